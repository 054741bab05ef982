//! Document identifier sources.

use crate::DocumentId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces new document identifiers.
///
/// Identifiers must be unique and should sort in creation order.
pub trait IdSource: Send + Sync {
    fn generate(&self) -> DocumentId;
}

/// Time-ordered UUIDv7 identifiers in their 32-character hex form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Source;

impl IdSource for UuidV7Source {
    fn generate(&self) -> DocumentId {
        uuid::Uuid::now_v7().simple().to_string()
    }
}

/// Zero-padded counter identifiers with a fixed prefix. Deterministic.
#[derive(Debug)]
pub struct SequentialIdSource {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdSource for SequentialIdSource {
    fn generate(&self) -> DocumentId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{:016}", self.prefix, n)
    }
}
