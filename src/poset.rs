//! The consensus pipeline of one node: ordering buffer → election →
//! checkpoint.
//!
//! [`Poset`] is single-writer state. Drive it from exactly one task (see
//! [`crate::service`]); nothing in here blocks or performs I/O. Persisting the
//! checkpoints it produces is the caller's job.

use std::{mem, sync::Arc};

use num_traits::Zero;
use tracing::{debug, error, info, trace};

use crate::{
    checkpoint::{Checkpoint, Genesis},
    config::PosetConfig,
    election::Election,
    error::ConsensusError,
    ordering::{EventBuffer, EventSink},
    reachability::StronglySee,
    source::EventSource,
    stake::Members,
    types::{Block, ElectionRes, Event, EventHash, FrameHeight, Hash, SuperFrameN},
};

/// Everything produced by one frame decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub election: ElectionRes,
    pub block: Block,
    /// Super-frame the decided frame belongs to.
    pub super_frame_n: SuperFrameN,
    /// The decision closed its super-frame and the member set was swapped.
    pub sealed_super_frame: bool,
    /// Checkpoint to persist before acting on the decision.
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosetStats {
    pub buffered_events: usize,
    pub released_events: usize,
    pub dropped_events: u64,
    pub decided_frames: u64,
    pub last_decided_frame: FrameHeight,
    pub super_frame_n: SuperFrameN,
}

pub struct Poset<R> {
    buffer: EventBuffer,
    core: PosetCore<R>,
}

struct PosetCore<R> {
    config: PosetConfig,
    checkpoint: Checkpoint,
    members: Arc<Members>,
    election: Election<R>,
    /// Released roots not yet below the election, in release order.
    roots: Vec<Event>,
    decisions: Vec<Decision>,
    dropped: Vec<(EventHash, String)>,
    dropped_total: u64,
    decided_total: u64,
    halted: Option<String>,
}

impl<R> Poset<R>
where
    R: StronglySee,
{
    /// Fresh poset on top of the genesis checkpoint.
    pub fn new(genesis: &Genesis, oracle: R, config: PosetConfig) -> Result<Self, ConsensusError> {
        Self::bootstrap(Some(Checkpoint::genesis(genesis)), oracle, config)
    }

    /// Resume from the last stored checkpoint.
    ///
    /// No checkpoint means genesis was never applied, which is fatal. The
    /// election restarts at the first undecided frame with no votes; replay the
    /// DAG with [`Poset::replay_from`] to rebuild them.
    pub fn bootstrap(
        checkpoint: Option<Checkpoint>,
        oracle: R,
        config: PosetConfig,
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        let checkpoint = checkpoint.ok_or(ConsensusError::MissingCheckpoint)?;

        let members = Arc::new(checkpoint.members.clone());
        if members.total_stake() != &checkpoint.total_stake {
            return Err(ConsensusError::InvalidStake(format!(
                "checkpoint total stake {} differs from its members' {}",
                checkpoint.total_stake,
                members.total_stake()
            )));
        }
        let election = Election::from_members(
            Arc::clone(&members),
            checkpoint.first_undecided_frame(),
            oracle,
        )?;
        info!(
            "Bootstrapped at super-frame {}, first undecided frame {}, {} members",
            checkpoint.super_frame_n,
            checkpoint.first_undecided_frame(),
            members.len()
        );

        Ok(Self {
            buffer: EventBuffer::new(config.max_buffered_events),
            core: PosetCore {
                config,
                checkpoint,
                members,
                election,
                roots: Vec::new(),
                decisions: Vec::new(),
                dropped: Vec::new(),
                dropped_total: 0,
                decided_total: 0,
                halted: None,
            },
        })
    }

    /// Feed one event from gossip. Returns the decisions it caused, oldest first.
    ///
    /// An error is fatal: the poset halts and every later call fails with
    /// [`ConsensusError::Halted`].
    pub fn submit(&mut self, event: Event) -> Result<Vec<Decision>, ConsensusError> {
        if let Some(reason) = &self.core.halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }
        if let Err(err) = self.buffer.submit(event, &mut self.core) {
            error!("Consensus halted: {err}");
            self.core.halted = Some(err.to_string());
            self.core.decisions.clear();
            return Err(err);
        }
        Ok(mem::take(&mut self.core.decisions))
    }

    /// Fetch a stored event by hash and submit it.
    pub fn submit_by_hash<S>(
        &mut self,
        source: &S,
        hash: &EventHash,
    ) -> Result<Vec<Decision>, ConsensusError>
    where
        S: EventSource + ?Sized,
    {
        let event = source.get_event(hash)?;
        self.submit(event)
    }

    /// Resubmit every event of the local DAG store. Used after bootstrap.
    pub fn replay_from<S>(&mut self, source: &S) -> Result<Vec<Decision>, ConsensusError>
    where
        S: EventSource + ?Sized,
    {
        let mut events = source
            .known_events()
            .iter()
            .map(|hash| source.get_event(hash))
            .collect::<Result<Vec<_>, _>>()?;
        // any order works, Lamport order just keeps the buffer small
        events.sort_by_key(|event| (event.lamport(), event.hash()));
        debug!("Replaying {} stored events", events.len());

        let mut decisions = Vec::new();
        for event in events {
            decisions.extend(self.submit(event)?);
        }
        Ok(decisions)
    }

    /// Events rejected by the ordering buffer since the last call.
    pub fn take_dropped(&mut self) -> Vec<(EventHash, String)> {
        mem::take(&mut self.core.dropped)
    }

    /// Forget events still waiting for parents. Returns how many.
    pub fn discard_buffered(&mut self) -> usize {
        self.buffer.discard_all()
    }

    /// Stage the member set of the next super-frame. It travels in the
    /// checkpoint, so persist [`Poset::checkpoint`] to keep it across restarts.
    pub fn set_next_members(&mut self, members: Members) -> Result<(), ConsensusError> {
        if members.total_stake().is_zero() {
            return Err(ConsensusError::InvalidStake(
                "next members carry no stake".to_string(),
            ));
        }
        self.core.checkpoint.next_members = members;
        Ok(())
    }

    /// Record the balances root; stored with the next checkpoint.
    pub fn set_balances(&mut self, balances: Hash) {
        self.core.checkpoint.balances = balances;
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.core.checkpoint
    }

    pub fn members(&self) -> &Arc<Members> {
        &self.core.members
    }

    pub fn frame_to_decide(&self) -> FrameHeight {
        self.core.election.frame_to_decide()
    }

    pub fn is_known(&self, hash: &EventHash) -> bool {
        self.buffer.is_known(hash)
    }

    pub fn is_halted(&self) -> bool {
        self.core.halted.is_some()
    }

    pub fn stats(&self) -> PosetStats {
        PosetStats {
            buffered_events: self.buffer.len(),
            released_events: self.buffer.released_count(),
            dropped_events: self.core.dropped_total,
            decided_frames: self.core.decided_total,
            last_decided_frame: self.core.checkpoint.last_decided_frame,
            super_frame_n: self.core.checkpoint.super_frame_n,
        }
    }
}

impl<R> PosetCore<R>
where
    R: StronglySee,
{
    fn handle_root(&mut self, root: &Event) -> Result<(), ConsensusError> {
        let current = self.checkpoint.super_frame_n;
        if root.super_frame() < current || root.frame() < self.election.frame_to_decide() {
            trace!("Ignoring root {:?} below the election", root.hash());
            return Ok(());
        }
        self.roots.push(root.clone());
        if root.super_frame() > current {
            debug!(
                "Holding root {:?} of future super-frame {}",
                root.hash(),
                root.super_frame()
            );
            return Ok(());
        }

        let Some(slot) = root.root_slot() else {
            return Ok(());
        };
        let mut decided = self.election.process_root(root.hash(), slot)?;
        while let Some(res) = decided {
            self.apply_decision(res)?;
            decided = self.replay_roots()?;
        }
        Ok(())
    }

    fn apply_decision(&mut self, res: ElectionRes) -> Result<(), ConsensusError> {
        let witness = self
            .roots
            .iter()
            .find(|root| root.hash() == res.decided_sf_witness)
            .ok_or(ConsensusError::UnknownEvent(res.decided_sf_witness))?;
        let frame = res.decided_frame;
        let super_frame_n = self.checkpoint.super_frame_n;

        self.checkpoint.last_decided_frame = frame;
        self.checkpoint.last_block_n += 1;
        self.checkpoint.last_consensus_time = self
            .checkpoint
            .last_consensus_time
            .max(witness.claimed_time());
        let block = Block {
            index: self.checkpoint.last_block_n,
            frame,
            witness: res.decided_sf_witness,
            time: self.checkpoint.last_consensus_time,
        };

        let sealed = frame % self.config.super_frame_len == 0;
        if sealed {
            let members = Arc::new(self.checkpoint.next_members.clone());
            self.election.rollover(Arc::clone(&members), frame + 1)?;

            self.checkpoint.super_frame_n += 1;
            self.checkpoint.total_stake = members.total_stake().clone();
            self.checkpoint.members = (*members).clone();
            self.members = members;
            let next_super_frame = self.checkpoint.super_frame_n;
            self.roots
                .retain(|root| root.super_frame() >= next_super_frame && root.frame() > frame);
            info!(
                "Super-frame {super_frame_n} sealed at frame {frame}, {} members in super-frame {next_super_frame}",
                self.members.len()
            );
        } else {
            self.election.reset(frame + 1);
            self.roots.retain(|root| root.frame() > frame);
        }

        info!(
            "Block {} from frame {frame}, witness {:?}",
            block.index, block.witness
        );
        self.decided_total += 1;
        self.decisions.push(Decision {
            election: res,
            block,
            super_frame_n,
            sealed_super_frame: sealed,
            checkpoint: self.checkpoint.clone(),
        });
        Ok(())
    }

    /// Recount known roots against the freshly reset election.
    fn replay_roots(&mut self) -> Result<Option<ElectionRes>, ConsensusError> {
        let current = self.checkpoint.super_frame_n;
        for i in 0..self.roots.len() {
            let root = &self.roots[i];
            if root.super_frame() != current {
                continue;
            }
            let Some(slot) = root.root_slot() else {
                continue;
            };
            let hash = root.hash();
            if let Some(res) = self.election.process_root(hash, slot)? {
                return Ok(Some(res));
            }
        }
        Ok(None)
    }
}

impl<R> EventSink for PosetCore<R>
where
    R: StronglySee,
{
    fn process(&mut self, event: &Event) -> Result<(), ConsensusError> {
        if event.is_root() {
            self.handle_root(event)?;
        }
        Ok(())
    }

    fn drop_event(&mut self, event: &Event, reason: ConsensusError) {
        self.dropped_total += 1;
        self.dropped.push((event.hash(), reason.to_string()));
    }
}
