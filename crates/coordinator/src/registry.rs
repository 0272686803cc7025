//! Process-wide transaction registry
//!
//! Maps transaction ids to their shared entries and resource ids to the
//! transaction they are bound to. Both maps are sharded (`DashMap`), so
//! operations on different transactions do not contend.
//!
//! Callers clone the `Arc<TransactionEntry>` out of the map and drop the
//! shard reference before calling into any adapter.

use crate::transaction::TransactionEntry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use xact_core::{ResourceId, TransactionId};

/// Transaction and resource-binding tables
#[derive(Default)]
pub(crate) struct Registry {
    transactions: DashMap<TransactionId, Arc<TransactionEntry>>,
    bindings: DashMap<ResourceId, TransactionId>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entry: Arc<TransactionEntry>) {
        self.transactions.insert(entry.id(), entry);
    }

    pub(crate) fn get(&self, id: &TransactionId) -> Option<Arc<TransactionEntry>> {
        self.transactions.get(id).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn contains(&self, id: &TransactionId) -> bool {
        self.transactions.contains_key(id)
    }

    pub(crate) fn remove(&self, id: &TransactionId) -> Option<Arc<TransactionEntry>> {
        self.transactions.remove(id).map(|(_, entry)| entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Clone every entry out of the map
    pub(crate) fn snapshot(&self) -> Vec<Arc<TransactionEntry>> {
        self.transactions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Bind `resource` to `txn`.
    ///
    /// A binding to another transaction that has ended (or is no longer
    /// registered) is stale and gets replaced.
    ///
    /// # Errors
    /// Returns the id of the live transaction the resource is bound to.
    pub(crate) fn bind(
        &self,
        resource: &ResourceId,
        txn: TransactionId,
    ) -> std::result::Result<(), TransactionId> {
        match self.bindings.entry(resource.clone()) {
            Entry::Occupied(mut occupied) => {
                let holder = *occupied.get();
                if holder == txn {
                    return Ok(());
                }
                let live = self
                    .get(&holder)
                    .map(|entry| !entry.status().is_terminal())
                    .unwrap_or(false);
                if live {
                    Err(holder)
                } else {
                    occupied.insert(txn);
                    Ok(())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(txn);
                Ok(())
            }
        }
    }

    /// Release `resource` if it is bound to `txn`
    pub(crate) fn unbind(&self, resource: &ResourceId, txn: TransactionId) {
        self.bindings.remove_if(resource, |_, holder| *holder == txn);
    }

    #[cfg(test)]
    pub(crate) fn bound_to(&self, resource: &ResourceId) -> Option<TransactionId> {
        self.bindings.get(resource).map(|b| *b.value())
    }
}
