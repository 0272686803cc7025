//! Thread-local "current transaction" association
//!
//! Each thread has at most one current transaction per coordinator
//! instance. Entries are keyed by the coordinator's instance id, so two
//! coordinators in the same process do not see each other's transactions.

use crate::transaction::Transaction;
use std::cell::RefCell;
use std::collections::HashMap;
use xact_core::TransactionId;

thread_local! {
    /// Current transaction of this thread, per coordinator instance
    static CURRENT: RefCell<HashMap<u64, Transaction>> = RefCell::new(HashMap::new());
}

/// Current-transaction operations for the calling thread
pub(crate) struct CurrentContext;

impl CurrentContext {
    /// The calling thread's current transaction for `instance`
    pub(crate) fn get(instance: u64) -> Option<Transaction> {
        CURRENT.with(|current| current.borrow().get(&instance).cloned())
    }

    /// Make `txn` current for `instance` on the calling thread
    pub(crate) fn set(instance: u64, txn: Transaction) {
        CURRENT.with(|current| {
            current.borrow_mut().insert(instance, txn);
        });
    }

    /// Forget the association for `instance`
    pub(crate) fn clear(instance: u64) {
        CURRENT.with(|current| {
            current.borrow_mut().remove(&instance);
        });
    }

    /// Forget the association only if `txn` is the current one
    pub(crate) fn clear_if(instance: u64, txn: TransactionId) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.get(&instance).map(|t| t.id() == txn).unwrap_or(false) {
                current.remove(&instance);
            }
        });
    }
}
