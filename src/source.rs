use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{
    error::ConsensusError,
    types::{Event, EventHash},
};

/// The local DAG store, as seen by consensus.
pub trait EventSource: Send + Sync {
    fn has_event(&self, hash: &EventHash) -> bool;

    /// Fetch a stored event. Asking for an unknown hash is an upstream
    /// invariant violation and yields [`ConsensusError::UnknownEvent`].
    fn get_event(&self, hash: &EventHash) -> Result<Event, ConsensusError>;

    /// Hashes of every stored event, in no particular order.
    fn known_events(&self) -> Vec<EventHash>;
}

/// Event store kept in memory, written by gossip and read by consensus.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    events: RwLock<HashMap<EventHash, Event>>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: Event) {
        self.events.write().insert(event.hash(), event);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSource for InMemoryEventSource {
    fn has_event(&self, hash: &EventHash) -> bool {
        self.events.read().contains_key(hash)
    }

    fn get_event(&self, hash: &EventHash) -> Result<Event, ConsensusError> {
        self.events
            .read()
            .get(hash)
            .cloned()
            .ok_or(ConsensusError::UnknownEvent(*hash))
    }

    fn known_events(&self) -> Vec<EventHash> {
        self.events.read().keys().copied().collect()
    }
}
