//! Mutation actions and the ordered batch that holds them.
//!
//! A batch is append-only. Every action receives the next `opID` when it is
//! pushed, starting at 1, so queue order and `opID` order are the same thing.

use crate::{CollectionName, DocumentId, OpId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::convert::Infallible;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationType::Create => write!(f, "CREATE"),
            MutationType::Update => write!(f, "UPDATE"),
            MutationType::Delete => write!(f, "DELETE"),
        }
    }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAction {
    /// Position in the batch, strictly increasing from 1
    #[serde(rename = "opID")]
    pub op_id: OpId,
    pub op: MutationType,
    /// Target collection (for updates, the collection the document ends up in)
    pub collection_name: CollectionName,
    /// Full stored document for creates and updates, `None` for deletes
    pub doc: Option<Value>,
    #[serde(rename = "_id")]
    pub id: DocumentId,
}

impl MutationAction {
    pub fn new(
        op_id: OpId,
        op: MutationType,
        id: impl Into<DocumentId>,
        collection_name: impl Into<CollectionName>,
        doc: Option<Value>,
    ) -> Self {
        Self {
            op_id,
            op,
            collection_name: collection_name.into(),
            doc,
            id: id.into(),
        }
    }
}

/// Ordered, append-only queue of mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationBatch {
    actions: Vec<MutationAction>,
    /// Last assigned op ID
    op_id: OpId,
}

impl MutationBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, assigning it the next op ID.
    pub fn push(
        &mut self,
        op: MutationType,
        id: impl Into<DocumentId>,
        collection_name: impl Into<CollectionName>,
        doc: Option<Value>,
    ) -> OpId {
        match self.push_checked(op, id, collection_name, doc, |_| Ok::<_, Infallible>(())) {
            Ok(op_id) => op_id,
            Err(never) => match never {},
        }
    }

    /// Build the next action and append it only if `check` accepts it.
    ///
    /// A rejected action consumes no op ID.
    pub fn push_checked<E>(
        &mut self,
        op: MutationType,
        id: impl Into<DocumentId>,
        collection_name: impl Into<CollectionName>,
        doc: Option<Value>,
        check: impl FnOnce(&MutationAction) -> Result<(), E>,
    ) -> Result<OpId, E> {
        let action = MutationAction::new(self.op_id + 1, op, id, collection_name, doc);
        check(&action)?;

        self.op_id = action.op_id;
        self.actions.push(action);
        Ok(self.op_id)
    }

    /// Queued actions in FIFO order.
    pub fn actions(&self) -> &[MutationAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The op ID most recently assigned, 0 if nothing was ever queued.
    pub fn last_op_id(&self) -> OpId {
        self.op_id
    }

    /// Distinct collections touched by the queued actions, sorted.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        self.actions
            .iter()
            .map(|a| a.collection_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Remove and return every queued action.
    ///
    /// The op ID counter is not reset; actions pushed afterwards continue the
    /// sequence.
    pub fn drain(&mut self) -> Vec<MutationAction> {
        std::mem::take(&mut self.actions)
    }
}
