use crate::types::{EventHash, FrameHeight, Lamport, NodeId, RootSlot};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Mismatched length: expected {expect}, actual {actual}")]
    MismatchedLength { expect: usize, actual: usize },

    #[error("Stale root {root:?} at frame {frame}, first undecided frame is {frame_to_decide}")]
    StaleRoot {
        root: EventHash,
        frame: FrameHeight,
        frame_to_decide: FrameHeight,
    },
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("Second root {new:?} for slot {slot:?}, already have {existing:?}")]
    DuplicateRoot {
        slot: RootSlot,
        existing: EventHash,
        new: EventHash,
    },
    #[error(
        "Root {voter:?} has no vote for candidate {candidate}, roots are processed out of causal order"
    )]
    MissingVote { voter: EventHash, candidate: NodeId },
    #[error("Root {root:?} strongly sees less than quorum stake of frame {frame} roots")]
    WeakObservation { root: EventHash, frame: FrameHeight },
    #[error("Exact stake tie while voting for candidate {candidate} at frame {frame}")]
    TiedVote {
        frame: FrameHeight,
        candidate: NodeId,
    },
    #[error("All the roots of frame {0} are decided as 'no', more than 1/3 of stake is Byzantine")]
    AllCandidatesRejected(FrameHeight),

    #[error("Event {0:?} has cyclic parent references")]
    CyclicParents(EventHash),
    #[error(
        "Event {event:?} has Lamport time {lamport}, not above parent {parent:?} with {parent_lamport}"
    )]
    NonMonotonicLamport {
        event: EventHash,
        lamport: Lamport,
        parent: EventHash,
        parent_lamport: Lamport,
    },
    #[error("Event {event:?} depends on rejected parent {parent:?}")]
    ParentRejected { event: EventHash, parent: EventHash },
    #[error("Event {0:?} evicted, ordering buffer is full")]
    BufferOverflow(EventHash),
    #[error("Unknown event {0:?}")]
    UnknownEvent(EventHash),

    #[error("Checkpoint not found, apply genesis for store first")]
    MissingCheckpoint,
    #[error("Invalid stake: {0}")]
    InvalidStake(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to decode checkpoint: {0}")]
    CheckpointDecode(#[from] prost::DecodeError),
    #[error("Unsupported checkpoint version {0}")]
    UnsupportedCheckpointVersion(u32),
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consensus halted: {0}")]
    Halted(String),
    #[error("Consensus service stopped")]
    ServiceStopped,
}

impl ConsensusError {
    /// Transient buffer-level rejections that only cost the offending event.
    ///
    /// Everything else signals a local invariant violation and must stop the
    /// consensus worker.
    pub fn is_event_rejection(&self) -> bool {
        matches!(
            self,
            ConsensusError::CyclicParents(_)
                | ConsensusError::NonMonotonicLamport { .. }
                | ConsensusError::ParentRejected { .. }
                | ConsensusError::BufferOverflow(_)
        )
    }
}
