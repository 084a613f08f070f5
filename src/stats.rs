use crate::{
    poset::PosetStats,
    types::{BlockN, FrameHeight, SuperFrameN},
};

/// Statistics about the consensus worker and the poset it drives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusStats {
    /// Events waiting for missing parents.
    pub buffered_events: usize,
    /// Events released to consensus since start.
    pub released_events: usize,
    /// Events rejected by the ordering buffer since start.
    pub dropped_events: u64,
    /// Frames decided since start.
    pub decided_frames: u64,
    pub last_decided_frame: FrameHeight,
    pub last_block_n: BlockN,
    pub super_frame_n: SuperFrameN,
    /// Whether consensus stopped on an unrecoverable error.
    pub halted: bool,
}

impl ConsensusStats {
    pub(crate) fn from_poset(stats: PosetStats, last_block_n: BlockN, halted: bool) -> Self {
        Self {
            buffered_events: stats.buffered_events,
            released_events: stats.released_events,
            dropped_events: stats.dropped_events,
            decided_frames: stats.decided_frames,
            last_decided_frame: stats.last_decided_frame,
            last_block_n,
            super_frame_n: stats.super_frame_n,
            halted,
        }
    }
}
