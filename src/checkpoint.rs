//! Durable consensus cursor.
//!
//! The checkpoint changes only after a frame is decided and is always replaced
//! as a whole. It is serialized with prost behind a versioned envelope, so
//! records written by older releases are migrated forward on load.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use prost::Message;
use tokio::{io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::ConsensusError,
    stake::{Members, Stake},
    types::{BlockN, FrameHeight, Hash, NodeId, SuperFrameN, Timestamp},
};

pub const CHECKPOINT_VERSION: u32 = 3;

/// Initial network state.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub members: Members,
    /// Root of the initial balances, opaque to consensus.
    pub balances: Hash,
    pub time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub super_frame_n: SuperFrameN,
    pub last_decided_frame: FrameHeight,
    pub last_block_n: BlockN,
    /// Total stake of `members`.
    pub total_stake: Stake,
    pub last_consensus_time: Timestamp,
    /// Members of the current super-frame; the resumed election runs with them.
    pub members: Members,
    /// Members of the next super-frame. Equal to `members` unless a new set
    /// was staged; becomes `members` at rollover.
    pub next_members: Members,
    pub balances: Hash,
}

impl Checkpoint {
    pub fn genesis(genesis: &Genesis) -> Self {
        Self {
            super_frame_n: 0,
            last_decided_frame: 0,
            last_block_n: 0,
            total_stake: genesis.members.total_stake().clone(),
            last_consensus_time: genesis.time,
            members: genesis.members.clone(),
            next_members: genesis.members.clone(),
            balances: genesis.balances,
        }
    }

    pub fn first_undecided_frame(&self) -> FrameHeight {
        self.last_decided_frame + 1
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = CheckpointV3 {
            super_frame_n: self.super_frame_n,
            last_decided_frame: self.last_decided_frame,
            last_block_n: self.last_block_n,
            total_stake: self.total_stake.to_bytes_be(),
            next_members: encode_members(&self.next_members),
            last_consensus_time: self.last_consensus_time,
            balances: self.balances.as_bytes().to_vec(),
            members: encode_members(&self.members),
        };
        CheckpointEnvelope {
            version: CHECKPOINT_VERSION,
            body: body.encode_to_vec(),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let envelope = CheckpointEnvelope::decode(bytes)?;
        let body = match envelope.version {
            1 => {
                let legacy = CheckpointV1::decode(envelope.body.as_slice())?;
                debug!("Migrating checkpoint from version 1");
                migrate_v2(migrate_v1(legacy))
            }
            2 => {
                let legacy = CheckpointV2::decode(envelope.body.as_slice())?;
                debug!("Migrating checkpoint from version 2");
                migrate_v2(legacy)
            }
            3 => CheckpointV3::decode(envelope.body.as_slice())?,
            other => return Err(ConsensusError::UnsupportedCheckpointVersion(other)),
        };

        Ok(Self {
            super_frame_n: body.super_frame_n,
            last_decided_frame: body.last_decided_frame,
            last_block_n: body.last_block_n,
            total_stake: Stake::from_bytes_be(&body.total_stake),
            last_consensus_time: body.last_consensus_time,
            members: decode_members(&body.members),
            next_members: decode_members(&body.next_members),
            balances: if body.balances.is_empty() {
                Hash::ZERO
            } else {
                Hash::from_slice(&body.balances)?
            },
        })
    }
}

#[derive(Clone, PartialEq, Message)]
struct CheckpointEnvelope {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(bytes = "vec", tag = "2")]
    body: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct MemberRecord {
    #[prost(uint32, tag = "1")]
    id: u32,
    #[prost(bytes = "vec", tag = "2")]
    stake: Vec<u8>,
}

/// Layout of the first release: no consensus time, no balances.
#[derive(Clone, PartialEq, Message)]
struct CheckpointV1 {
    #[prost(uint32, tag = "1")]
    super_frame_n: u32,
    #[prost(uint32, tag = "2")]
    last_decided_frame: u32,
    #[prost(uint64, tag = "3")]
    last_block_n: u64,
    #[prost(bytes = "vec", tag = "4")]
    total_stake: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    next_members: Vec<MemberRecord>,
}

#[derive(Clone, PartialEq, Message)]
struct CheckpointV2 {
    #[prost(uint32, tag = "1")]
    super_frame_n: u32,
    #[prost(uint32, tag = "2")]
    last_decided_frame: u32,
    #[prost(uint64, tag = "3")]
    last_block_n: u64,
    #[prost(bytes = "vec", tag = "4")]
    total_stake: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    next_members: Vec<MemberRecord>,
    #[prost(uint64, tag = "6")]
    last_consensus_time: u64,
    #[prost(bytes = "vec", tag = "7")]
    balances: Vec<u8>,
}

/// Adds the staged member set as its own field.
#[derive(Clone, PartialEq, Message)]
struct CheckpointV3 {
    #[prost(uint32, tag = "1")]
    super_frame_n: u32,
    #[prost(uint32, tag = "2")]
    last_decided_frame: u32,
    #[prost(uint64, tag = "3")]
    last_block_n: u64,
    #[prost(bytes = "vec", tag = "4")]
    total_stake: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    next_members: Vec<MemberRecord>,
    #[prost(uint64, tag = "6")]
    last_consensus_time: u64,
    #[prost(bytes = "vec", tag = "7")]
    balances: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    members: Vec<MemberRecord>,
}

fn migrate_v1(legacy: CheckpointV1) -> CheckpointV2 {
    CheckpointV2 {
        super_frame_n: legacy.super_frame_n,
        last_decided_frame: legacy.last_decided_frame,
        last_block_n: legacy.last_block_n,
        total_stake: legacy.total_stake,
        next_members: legacy.next_members,
        last_consensus_time: 0,
        balances: Vec::new(),
    }
}

/// Older layouts kept only the current set, and nothing staged survived a
/// restart.
fn migrate_v2(legacy: CheckpointV2) -> CheckpointV3 {
    CheckpointV3 {
        super_frame_n: legacy.super_frame_n,
        last_decided_frame: legacy.last_decided_frame,
        last_block_n: legacy.last_block_n,
        total_stake: legacy.total_stake,
        members: legacy.next_members.clone(),
        next_members: legacy.next_members,
        last_consensus_time: legacy.last_consensus_time,
        balances: legacy.balances,
    }
}

fn encode_members(members: &Members) -> Vec<MemberRecord> {
    members
        .iter()
        .map(|(id, stake)| MemberRecord {
            id: id.0,
            stake: stake.to_bytes_be(),
        })
        .collect()
}

fn decode_members(records: &[MemberRecord]) -> Members {
    Members::new(
        records
            .iter()
            .map(|record| (NodeId(record.id), Stake::from_bytes_be(&record.stake))),
    )
}

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Replace the stored checkpoint atomically.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConsensusError>;

    async fn load(&self) -> Result<Option<Checkpoint>, ConsensusError>;
}

/// Write the genesis checkpoint unless one exists. Returns the checkpoint in
/// effect.
pub async fn apply_genesis<S>(store: &S, genesis: &Genesis) -> Result<Checkpoint, ConsensusError>
where
    S: CheckpointStore + ?Sized,
{
    if let Some(existing) = store.load().await? {
        debug!("Genesis already applied, keeping existing checkpoint");
        return Ok(existing);
    }
    let checkpoint = Checkpoint::genesis(genesis);
    store.save(&checkpoint).await?;
    info!(
        "Applied genesis with {} members, total stake {}",
        genesis.members.len(),
        checkpoint.total_stake
    );
    Ok(checkpoint)
}

/// In-memory implementation of [`CheckpointStore`]. Keeps the encoded record.
#[derive(Default, Clone)]
pub struct InMemoryCheckpointStore {
    record: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes, e.g. a record written by an older release.
    pub async fn put_raw(&self, bytes: Vec<u8>) {
        *self.record.write().await = Some(bytes);
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConsensusError> {
        let bytes = checkpoint.encode();
        *self.record.write().await = Some(bytes);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, ConsensusError> {
        let record = self.record.read().await;
        record
            .as_deref()
            .map(Checkpoint::decode)
            .transpose()
    }
}

/// Single-file store. Writes go to a temporary sibling that is renamed over
/// the target, so readers never see a partial checkpoint.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConsensusError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);

        if let Err(err) = write_synced(&tmp, &checkpoint.encode()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        debug!(
            "Checkpoint of frame {} written to {}",
            checkpoint.last_decided_frame,
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, ConsensusError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Checkpoint::decode(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write `bytes` and flush them to disk before returning.
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
