use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::types::{EventHash, RootSlot};

/// The DAG reachability oracle consumed by the election.
///
/// `strongly_see(from, to)` returns the hash of the event in slot `to` that
/// `from` strongly sees, or `None` if it doesn't (yet). Answers must be
/// monotonic: once `Some(h)` for a pair, always `Some(h)`.
pub trait StronglySee: Send + Sync {
    fn strongly_see(&self, from: &EventHash, to: &RootSlot) -> Option<EventHash>;
}

impl<T> StronglySee for &T
where
    T: StronglySee + ?Sized,
{
    fn strongly_see(&self, from: &EventHash, to: &RootSlot) -> Option<EventHash> {
        (**self).strongly_see(from, to)
    }
}

impl<T> StronglySee for Arc<T>
where
    T: StronglySee + ?Sized,
{
    fn strongly_see(&self, from: &EventHash, to: &RootSlot) -> Option<EventHash> {
        (**self).strongly_see(from, to)
    }
}

/// Table-backed oracle filled by the DAG index (or by tests).
///
/// Shared between the writer that learns new relations and the consensus
/// worker that reads them.
#[derive(Debug, Default)]
pub struct InMemoryReachability {
    edges: RwLock<HashMap<(EventHash, RootSlot), EventHash>>,
}

impl InMemoryReachability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` strongly sees `seen`, which occupies `slot`.
    ///
    /// Returns false if a different event is already recorded for the pair;
    /// the table stays unchanged in that case.
    pub fn insert(&self, from: EventHash, slot: RootSlot, seen: EventHash) -> bool {
        let mut edges = self.edges.write();
        match edges.get(&(from, slot)) {
            Some(existing) => *existing == seen,
            None => {
                edges.insert((from, slot), seen);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }
}

impl StronglySee for InMemoryReachability {
    fn strongly_see(&self, from: &EventHash, to: &RootSlot) -> Option<EventHash> {
        self.edges.read().get(&(*from, *to)).copied()
    }
}
