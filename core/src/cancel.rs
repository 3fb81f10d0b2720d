//! Cancellation handles for long-running operations.
//!
//! Merge, GC, fetch and push all accept a [`Cancel`] and check it at batch
//! boundaries. Cancelling discards uncommitted in-memory state only;
//! anything already flushed and named by a ref stays intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_sticky_and_shared() {
        let c = Cancel::new();
        let c2 = c.clone();
        assert!(!c.is_cancelled());
        c2.cancel();
        assert!(c.is_cancelled());
        c2.cancel();
        assert!(c2.is_cancelled());
    }
}
