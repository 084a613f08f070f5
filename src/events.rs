use tokio::sync::broadcast;

use crate::{
    poset::Decision,
    types::{EventHash, FrameHeight, SuperFrameN},
};

/// Notifications published by the consensus worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A frame was decided and its checkpoint persisted.
    FrameDecided(Box<Decision>),
    /// The ordering buffer rejected an event, and with it its descendants.
    EventDropped { hash: EventHash, reason: String },
    /// The last frame of a super-frame was decided; the next one has begun.
    SuperFrameSealed {
        sealed: SuperFrameN,
        last_frame: FrameHeight,
    },
    /// Consensus stopped on an unrecoverable error.
    Halted { reason: String },
}

pub trait ConsensusEventBus: Clone + Send + Sync + 'static {
    /// Type returned to consumers that subscribe to consensus events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, event: ConsensusEvent);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl BroadcastEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ConsensusEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<ConsensusEvent>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, event: ConsensusEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
