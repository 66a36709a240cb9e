//! The live and trash connection sets.
//!
//! Both sets are copy-on-write: readers (`borrow`'s least-busy scan, the
//! periodic sizing tick) take a cheap `Arc<Vec<_>>` snapshot and iterate it
//! without ever blocking a concurrent mutator, at the cost of an allocation
//! per mutation. `arc-swap`'s `rcu` gives us that without hand-rolling the
//! retry loop a plain mutex-guarded collection would need, and without
//! paying for iteration under lock on the borrow hot path.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::connection::Connection;

/// A connection plus the small amount of bookkeeping the pool itself needs
/// (an id for logging; the trait object gives us everything else).
#[derive(Clone)]
pub(crate) struct Managed {
    pub(crate) id: u32,
    pub(crate) conn: Arc<dyn Connection>,
}

/// A snapshot-safe, copy-on-write collection of [`Managed`] connections.
#[derive(Default)]
pub(crate) struct ConnSet {
    inner: ArcSwap<Vec<Managed>>,
}

impl ConnSet {
    pub(crate) fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// A stable point-in-time view, safe to iterate while other threads
    /// mutate the set concurrently.
    pub(crate) fn snapshot(&self) -> Arc<Vec<Managed>> {
        self.inner.load_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub(crate) fn push(&self, managed: Managed) {
        self.inner.rcu(|current| {
            let mut next = (**current).clone();
            next.push(managed.clone());
            next
        });
    }

    /// Remove the connection with the given id, if present. Returns it so
    /// the caller can move it into another set or close it.
    pub(crate) fn remove(&self, id: u32) -> Option<Managed> {
        let mut removed = None;
        self.inner.rcu(|current| {
            let mut next = Vec::with_capacity(current.len());
            removed = None;
            for managed in current.iter() {
                if managed.id == id {
                    removed = Some(managed.clone());
                } else {
                    next.push(managed.clone());
                }
            }
            next
        });
        removed
    }

    /// Whether a connection with the given id is currently in this set.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: u32) -> bool {
        self.inner.load().iter().any(|m| m.id == id)
    }

    /// Drain every connection out of the set, for shutdown.
    pub(crate) fn drain(&self) -> Vec<Managed> {
        let taken = self.inner.swap(Arc::new(Vec::new()));
        (*taken).clone()
    }
}
