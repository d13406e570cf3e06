//! Per-participant bulkhead: bounds how many in-flight calls a single
//! participant may have outstanding, independent of the others, so one slow
//! collaborator cannot starve the whole adapter pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct BulkheadFullError;

/// A lazily-created semaphore per participant target.
pub struct Bulkhead {
    max_concurrent: usize,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, target: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock();
        slots
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
            .clone()
    }

    /// Try to acquire a slot for `target` without waiting; fails fast if the
    /// bulkhead is already at capacity.
    pub fn try_acquire(&self, target: &str) -> Result<OwnedSemaphorePermit, BulkheadFullError> {
        self.semaphore_for(target)
            .try_acquire_owned()
            .map_err(|_| BulkheadFullError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let bulkhead = Bulkhead::new(2);
        let p1 = bulkhead.try_acquire("payment").unwrap();
        let p2 = bulkhead.try_acquire("payment").unwrap();
        assert!(bulkhead.try_acquire("payment").is_err());
        drop(p1);
        assert!(bulkhead.try_acquire("payment").is_ok());
        drop(p2);
    }

    #[test]
    fn targets_are_independent() {
        let bulkhead = Bulkhead::new(1);
        let _p1 = bulkhead.try_acquire("payment").unwrap();
        assert!(bulkhead.try_acquire("inventory").is_ok());
    }
}
