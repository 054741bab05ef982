//! Idempotent provisioning of the fixed store layout.
//!
//! Runs inside the engine's upgrade step. Stores and indexes are created
//! only when absent; nothing is ever dropped or altered, so running it
//! against an already provisioned database changes nothing.

use crate::backend::{BackendError, UpgradeContext, UpgradeHandler};
use docstash_engine::{layout, ObjectStoreDef};
use tracing::info;

/// What a provisioning run created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created_stores: Vec<String>,
    /// `(store, index)` pairs
    pub created_indexes: Vec<(String, String)>,
}

impl ProvisionReport {
    pub fn is_empty(&self) -> bool {
        self.created_stores.is_empty() && self.created_indexes.is_empty()
    }
}

/// Create every store and index in `defs` that does not exist yet.
pub fn provision(
    ctx: &mut dyn UpgradeContext,
    defs: &[ObjectStoreDef],
) -> Result<ProvisionReport, BackendError> {
    let mut report = ProvisionReport::default();
    let existing = ctx.object_store_names();

    for def in defs {
        if !existing.iter().any(|name| name == &def.name) {
            ctx.create_object_store(&def.name, def.key_path.as_ref(), def.auto_increment)?;
            report.created_stores.push(def.name.clone());
        }

        let indexes = ctx.index_names(&def.name)?;
        for index in &def.indexes {
            if indexes.iter().any(|name| name == &index.name) {
                continue;
            }
            ctx.create_index(&def.name, index)?;
            report
                .created_indexes
                .push((def.name.clone(), index.name.clone()));
        }
    }

    Ok(report)
}

/// Upgrade handler provisioning the docstash layout.
pub fn upgrade_handler() -> UpgradeHandler {
    Box::new(|ctx: &mut dyn UpgradeContext| {
        let (old_version, new_version) = (ctx.old_version(), ctx.new_version());
        let report = provision(ctx, &layout::object_stores())?;

        info!(
            old_version,
            new_version,
            stores = ?report.created_stores,
            indexes = report.created_indexes.len(),
            "Provisioned object stores"
        );

        Ok(())
    })
}
