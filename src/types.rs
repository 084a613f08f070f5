use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::ConsensusError;

/// Frame numeration.
pub type FrameHeight = u32;
/// Super-frame numeration.
pub type SuperFrameN = u32;
/// Block numeration.
pub type BlockN = u64;
/// Lamport numeration.
pub type Lamport = u32;
/// Nanoseconds since Unix epoch.
pub type Timestamp = u64;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

/// Content hash identifying an event.
pub type EventHash = Hash;

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hash from raw bytes, as stored in a checkpoint.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConsensusError::MismatchedLength {
                expect: 32,
                actual: bytes.len(),
            })?;
        Ok(Hash(array))
    }

    /// Hash arbitrary bytes. Handy for deriving opaque state roots.
    pub fn of(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..6]))
    }
}

/// Identity of a consensus participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// The voting unit: one root per node per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootSlot {
    pub frame: FrameHeight,
    pub node: NodeId,
}

impl RootSlot {
    pub fn new(frame: FrameHeight, node: NodeId) -> Self {
        Self { frame, node }
    }
}

/// Outcome of an election: the decided frame and its super-frame witness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionRes {
    pub decided_frame: FrameHeight,
    pub decided_sf_witness: EventHash,
}

/// What block production receives for every decided frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub index: BlockN,
    pub frame: FrameHeight,
    pub witness: EventHash,
    pub time: Timestamp,
}

/// An immutable DAG vertex.
///
/// Frame height and root flag are computed by the DAG layer before the event
/// reaches consensus; they are part of the hashed header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    hash: EventHash,
    creator: NodeId,
    super_frame: SuperFrameN,
    lamport: Lamport,
    frame: FrameHeight,
    is_root: bool,
    claimed_time: Timestamp,
    parents: Vec<EventHash>,
    payload: Vec<u8>,
}

impl Event {
    pub fn builder(creator: NodeId) -> EventBuilder {
        EventBuilder::new(creator)
    }

    pub fn hash(&self) -> EventHash {
        self.hash
    }

    pub fn creator(&self) -> NodeId {
        self.creator
    }

    pub fn super_frame(&self) -> SuperFrameN {
        self.super_frame
    }

    pub fn lamport(&self) -> Lamport {
        self.lamport
    }

    pub fn frame(&self) -> FrameHeight {
        self.frame
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn claimed_time(&self) -> Timestamp {
        self.claimed_time
    }

    pub fn parents(&self) -> &[EventHash] {
        &self.parents
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The root slot this event occupies, if it is a root.
    pub fn root_slot(&self) -> Option<RootSlot> {
        self.is_root.then(|| RootSlot::new(self.frame, self.creator))
    }
}

pub fn compute_event_hash(event: &Event) -> EventHash {
    let mut hasher = Sha256::new();
    hasher.update(event.creator.0.to_le_bytes());
    hasher.update(event.super_frame.to_le_bytes());
    hasher.update(event.lamport.to_le_bytes());
    hasher.update(event.frame.to_le_bytes());
    hasher.update([event.is_root as u8]);
    hasher.update(event.claimed_time.to_le_bytes());
    hasher.update((event.parents.len() as u32).to_le_bytes());
    for parent in &event.parents {
        hasher.update(parent.0);
    }
    hasher.update(&event.payload);
    Hash(hasher.finalize().into())
}

#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub(crate) fn new(creator: NodeId) -> Self {
        Self {
            event: Event {
                hash: Hash::ZERO,
                creator,
                super_frame: 0,
                lamport: 1,
                frame: 0,
                is_root: false,
                claimed_time: 0,
                parents: Vec::new(),
                payload: Vec::new(),
            },
        }
    }

    pub fn with_lamport(mut self, lamport: Lamport) -> Self {
        self.event.lamport = lamport;
        self
    }

    pub fn with_parents(mut self, parents: Vec<EventHash>) -> Self {
        self.event.parents = parents;
        self
    }

    /// Frame height assigned upstream. Marks the event as a root when `is_root`.
    pub fn with_frame(mut self, frame: FrameHeight, is_root: bool) -> Self {
        self.event.frame = frame;
        self.event.is_root = is_root;
        self
    }

    pub fn with_super_frame(mut self, super_frame: SuperFrameN) -> Self {
        self.event.super_frame = super_frame;
        self
    }

    pub fn with_claimed_time(mut self, claimed_time: Timestamp) -> Self {
        self.event.claimed_time = claimed_time;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.event.payload = payload;
        self
    }

    pub fn build(mut self) -> Event {
        self.event.hash = compute_event_hash(&self.event);
        self.event
    }
}
