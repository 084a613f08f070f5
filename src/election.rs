//! Stake-weighted virtual voting.
//!
//! Roots of frame `frame_to_decide` are the candidates. Every later root votes
//! on each candidate that is not decided yet:
//!
//! - one frame above the candidates the vote is direct: yes iff the voter
//!   strongly sees the candidate;
//! - two or more frames above, the vote aggregates the votes of the roots the
//!   voter strongly sees one frame below, weighted by stake. Reaching quorum
//!   makes the vote decisive.
//!
//! A decisive vote settles its candidate for the rest of the election. The
//! frame closes once every candidate is settled: the first `yes` in member
//! order (stake descending, then id) becomes the super-frame witness.

use std::{collections::HashMap, sync::Arc};

use num_traits::Zero;
use tracing::{debug, info, trace};

use crate::{
    error::ConsensusError,
    reachability::StronglySee,
    stake::{Members, Stake, quorum},
    types::{ElectionRes, EventHash, FrameHeight, NodeId, RootSlot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VoteId {
    from_root: EventHash,
    for_node: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VoteValue {
    decided: bool,
    yes: bool,
    /// The candidate root seen by the voter, when voting yes.
    seen_root: Option<EventHash>,
}

/// Election of one frame at a time, within a fixed member set.
pub struct Election<R> {
    members: Arc<Members>,
    total_stake: Stake,
    quorum: Stake,
    strongly_see: R,

    frame_to_decide: FrameHeight,
    votes: HashMap<VoteId, VoteValue>,
    /// Decisive votes, one per settled candidate.
    settled: HashMap<NodeId, VoteValue>,
    /// Roots processed in this election, one per slot.
    processed: HashMap<RootSlot, EventHash>,
    decided: Option<ElectionRes>,
}

impl<R> Election<R>
where
    R: StronglySee,
{
    pub fn new(
        members: Arc<Members>,
        total_stake: Stake,
        quorum: Stake,
        frame_to_decide: FrameHeight,
        strongly_see: R,
    ) -> Result<Self, ConsensusError> {
        validate_quorum(&total_stake, &quorum)?;
        Ok(Self {
            members,
            total_stake,
            quorum,
            strongly_see,
            frame_to_decide,
            votes: HashMap::new(),
            settled: HashMap::new(),
            processed: HashMap::new(),
            decided: None,
        })
    }

    /// Election with total stake and quorum taken from the member table.
    pub fn from_members(
        members: Arc<Members>,
        frame_to_decide: FrameHeight,
        strongly_see: R,
    ) -> Result<Self, ConsensusError> {
        let total_stake = members.total_stake().clone();
        let quorum = quorum(&total_stake);
        Self::new(members, total_stake, quorum, frame_to_decide, strongly_see)
    }

    pub fn frame_to_decide(&self) -> FrameHeight {
        self.frame_to_decide
    }

    /// Result of the current election, once decided.
    pub fn decided(&self) -> Option<ElectionRes> {
        self.decided
    }

    pub fn members(&self) -> &Arc<Members> {
        &self.members
    }

    pub fn quorum(&self) -> &Stake {
        &self.quorum
    }

    pub fn total_stake(&self) -> &Stake {
        &self.total_stake
    }

    /// Start electing `frame_to_decide`, forgetting all votes.
    pub fn reset(&mut self, frame_to_decide: FrameHeight) {
        self.frame_to_decide = frame_to_decide;
        self.votes.clear();
        self.settled.clear();
        self.processed.clear();
        self.decided = None;
    }

    /// Switch to a new member set (super-frame rollover) and reset.
    pub fn rollover(
        &mut self,
        members: Arc<Members>,
        frame_to_decide: FrameHeight,
    ) -> Result<(), ConsensusError> {
        let total_stake = members.total_stake().clone();
        let quorum = quorum(&total_stake);
        validate_quorum(&total_stake, &quorum)?;

        self.members = members;
        self.total_stake = total_stake;
        self.quorum = quorum;
        self.reset(frame_to_decide);
        Ok(())
    }

    /// Count one root's votes. Roots must arrive in causal order.
    pub fn process_root(
        &mut self,
        root: EventHash,
        slot: RootSlot,
    ) -> Result<Option<ElectionRes>, ConsensusError> {
        if slot.frame < self.frame_to_decide {
            return Err(ConsensusError::StaleRoot {
                root,
                frame: slot.frame,
                frame_to_decide: self.frame_to_decide,
            });
        }
        if !self.members.contains(&slot.node) {
            return Err(ConsensusError::UnknownNode(slot.node));
        }
        if let Some(existing) = self.processed.get(&slot) {
            if *existing == root {
                trace!("Root {root:?} already counted");
                return Ok(None);
            }
            return Err(ConsensusError::DuplicateRoot {
                slot,
                existing: *existing,
                new: root,
            });
        }
        if let Some(res) = self.decided {
            trace!(
                "Frame {} is already decided, skipping root {root:?}",
                res.decided_frame
            );
            return Ok(None);
        }
        self.processed.insert(slot, root);

        if slot.frame == self.frame_to_decide {
            // a candidate, not a voter
            return Ok(None);
        }
        let round = slot.frame - self.frame_to_decide;

        let observed = if round > 1 {
            let observed = self.observed_roots(&root, slot.frame - 1);
            let observed_stake: Stake = observed
                .iter()
                .map(|(_, voter)| self.members.stake_of(voter))
                .sum();
            if observed_stake < self.quorum {
                return Err(ConsensusError::WeakObservation {
                    root,
                    frame: slot.frame - 1,
                });
            }
            observed
        } else {
            Vec::new()
        };

        let candidates: Vec<NodeId> = self
            .members
            .sorted_ids()
            .filter(|node| !self.settled.contains_key(node))
            .collect();

        for candidate in candidates {
            let vote = if round == 1 {
                let candidate_slot = RootSlot::new(self.frame_to_decide, candidate);
                let seen_root = self.strongly_see.strongly_see(&root, &candidate_slot);
                VoteValue {
                    decided: false,
                    yes: seen_root.is_some(),
                    seen_root,
                }
            } else {
                self.aggregate(candidate, &observed)?
            };
            trace!(
                "Root {root:?} at frame {} votes {} for {candidate} (decided: {})",
                slot.frame,
                if vote.yes { "yes" } else { "no" },
                vote.decided
            );

            self.votes.insert(
                VoteId {
                    from_root: root,
                    for_node: candidate,
                },
                vote,
            );
            if vote.decided {
                debug!(
                    "Candidate {candidate} of frame {} decided as '{}'",
                    self.frame_to_decide,
                    if vote.yes { "yes" } else { "no" }
                );
                self.settled.insert(candidate, vote);
            }
        }

        if self.settled.len() < self.members.len() {
            return Ok(None);
        }
        let res = self.choose_witness(root)?;
        info!(
            "Frame {} decided by root {root:?}, witness {:?}",
            res.decided_frame, res.decided_sf_witness
        );
        self.decided = Some(res);
        Ok(Some(res))
    }

    /// First candidate settled as `yes`, in member order.
    fn choose_witness(&self, decider: EventHash) -> Result<ElectionRes, ConsensusError> {
        for candidate in self.members.sorted_ids() {
            let Some(vote) = self.settled.get(&candidate) else {
                continue;
            };
            if !vote.yes {
                continue;
            }
            let Some(witness) = vote.seen_root else {
                return Err(ConsensusError::MissingVote {
                    voter: decider,
                    candidate,
                });
            };
            return Ok(ElectionRes {
                decided_frame: self.frame_to_decide,
                decided_sf_witness: witness,
            });
        }
        Err(ConsensusError::AllCandidatesRejected(self.frame_to_decide))
    }

    /// Roots of `frame` strongly seen by `root`, with their creators.
    fn observed_roots(&self, root: &EventHash, frame: FrameHeight) -> Vec<(EventHash, NodeId)> {
        self.members
            .sorted_ids()
            .filter_map(|node| {
                self.strongly_see
                    .strongly_see(root, &RootSlot::new(frame, node))
                    .map(|seen| (seen, node))
            })
            .collect()
    }

    fn aggregate(
        &self,
        candidate: NodeId,
        observed: &[(EventHash, NodeId)],
    ) -> Result<VoteValue, ConsensusError> {
        let mut yes_stake = Stake::zero();
        let mut no_stake = Stake::zero();
        let mut seen_root = None;

        for (voter_root, voter) in observed {
            let vote_id = VoteId {
                from_root: *voter_root,
                for_node: candidate,
            };
            let Some(vote) = self.votes.get(&vote_id) else {
                return Err(ConsensusError::MissingVote {
                    voter: *voter_root,
                    candidate,
                });
            };
            let stake = self.members.stake_of(voter);
            if vote.yes {
                yes_stake += stake;
                // first yes-voter in member order names the witness
                if seen_root.is_none() {
                    seen_root = vote.seen_root;
                }
            } else {
                no_stake += stake;
            }
        }

        let yes = if yes_stake >= self.quorum {
            true
        } else if no_stake >= self.quorum {
            false
        } else if yes_stake != no_stake {
            yes_stake > no_stake
        } else {
            return Err(ConsensusError::TiedVote {
                frame: self.frame_to_decide,
                candidate,
            });
        };
        let decided = yes_stake >= self.quorum || no_stake >= self.quorum;

        Ok(VoteValue {
            decided,
            yes,
            seen_root: if yes { seen_root } else { None },
        })
    }
}

fn validate_quorum(total_stake: &Stake, quorum: &Stake) -> Result<(), ConsensusError> {
    if total_stake.is_zero() {
        return Err(ConsensusError::InvalidStake(
            "total stake must be positive".to_string(),
        ));
    }
    if quorum * 3u32 <= total_stake * 2u32 || quorum > total_stake {
        return Err(ConsensusError::InvalidStake(format!(
            "quorum {quorum} must be above 2/3 of total stake {total_stake} and not above it"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reachability::InMemoryReachability, types::Hash};

    fn root(name: &str) -> EventHash {
        Hash::of(name.as_bytes())
    }

    fn four_equal() -> Arc<Members> {
        Arc::new(Members::from_weights((1..=4).map(|i| (NodeId(i), 1))))
    }

    #[test]
    fn rejects_zero_stake_and_weak_quorum() {
        let members = Arc::new(Members::from_weights([(NodeId(1), 0)]));
        let err = Election::from_members(members, 0, InMemoryReachability::new())
            .err()
            .unwrap();
        assert!(matches!(err, ConsensusError::InvalidStake(_)));

        let err = Election::new(
            four_equal(),
            Stake::from(4u32),
            Stake::from(2u32),
            0,
            InMemoryReachability::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConsensusError::InvalidStake(_)));
    }

    #[test]
    fn stale_and_unknown_roots_are_errors() {
        let mut election =
            Election::from_members(four_equal(), 3, InMemoryReachability::new()).unwrap();

        let err = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::StaleRoot { .. }));

        let err = election
            .process_root(root("x4"), RootSlot::new(4, NodeId(9)))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownNode(NodeId(9))));
    }

    #[test]
    fn second_root_in_slot_is_an_error() {
        let mut election =
            Election::from_members(four_equal(), 0, InMemoryReachability::new()).unwrap();
        let slot = RootSlot::new(1, NodeId(1));

        assert_eq!(election.process_root(root("a1"), slot).unwrap(), None);
        assert_eq!(election.process_root(root("a1"), slot).unwrap(), None);
        let err = election.process_root(root("a1-fork"), slot).unwrap_err();
        assert!(matches!(err, ConsensusError::DuplicateRoot { .. }));
    }

    #[test]
    fn missing_vote_means_out_of_order() {
        let table = InMemoryReachability::new();
        for (name, n) in [("b1", 2), ("c1", 3), ("d1", 4)] {
            table.insert(root("a2"), RootSlot::new(1, NodeId(n)), root(name));
        }
        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        election
            .process_root(root("b1"), RootSlot::new(1, NodeId(2)))
            .unwrap();

        let err = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::MissingVote { .. }));
    }

    #[test]
    fn voter_must_see_quorum_below() {
        let table = InMemoryReachability::new();
        for (name, n) in [("b1", 2), ("c1", 3)] {
            table.insert(root("a2"), RootSlot::new(1, NodeId(n)), root(name));
        }
        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        for (name, n) in [("b1", 2), ("c1", 3)] {
            election
                .process_root(root(name), RootSlot::new(1, NodeId(n)))
                .unwrap();
        }

        let err = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::WeakObservation { frame: 1, .. }
        ));
    }

    #[test]
    fn aggregated_vote_weighs_stake_not_heads() {
        // A:4 B:2 C:1 D:1, quorum 6
        let members = Arc::new(Members::from_weights([
            (NodeId(1), 4),
            (NodeId(2), 2),
            (NodeId(3), 1),
            (NodeId(4), 1),
        ]));
        let table = InMemoryReachability::new();
        let frame0 = |n: u32| RootSlot::new(0, NodeId(n));
        let frame1 = |n: u32| RootSlot::new(1, NodeId(n));

        // only c1 and d1 see b0, a1 doesn't
        table.insert(root("c1"), frame0(2), root("b0"));
        table.insert(root("d1"), frame0(2), root("b0"));
        // d2 sees a1, c1, d1 (stake 6)
        for (name, n) in [("a1", 1), ("c1", 3), ("d1", 4)] {
            table.insert(root("d2"), frame1(n), root(name));
        }

        let mut election = Election::from_members(members, 0, table).unwrap();
        for (name, n) in [("a1", 1), ("c1", 3), ("d1", 4)] {
            assert_eq!(
                election.process_root(root(name), frame1(n)).unwrap(),
                None
            );
        }
        assert_eq!(
            election
                .process_root(root("d2"), RootSlot::new(2, NodeId(4)))
                .unwrap(),
            None
        );

        // for b0: two heads (stake 2) said yes, one head (stake 4) said no
        let vote = election.votes[&VoteId {
            from_root: root("d2"),
            for_node: NodeId(2),
        }];
        assert!(!vote.yes);
        assert!(!vote.decided);
        // for a0 every observed root said no with stake 6
        assert_eq!(election.settled.get(&NodeId(1)).map(|v| v.yes), Some(false));
        assert!(!election.settled.contains_key(&NodeId(2)));
    }

    #[test]
    fn exact_tie_is_an_error() {
        let table = InMemoryReachability::new();
        let frame0 = |n: u32| RootSlot::new(0, NodeId(n));
        let frame1 = |n: u32| RootSlot::new(1, NodeId(n));
        table.insert(root("a1"), frame0(1), root("a0"));
        table.insert(root("b1"), frame0(1), root("a0"));
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3), ("d1", 4)] {
            table.insert(root("a2"), frame1(n), root(name));
        }

        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3), ("d1", 4)] {
            election.process_root(root(name), frame1(n)).unwrap();
        }

        let err = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::TiedVote {
                frame: 0,
                candidate: NodeId(1)
            }
        ));
    }

    #[test]
    fn closed_until_reset() {
        let table = InMemoryReachability::new();
        let frame0 = |n: u32| RootSlot::new(0, NodeId(n));
        let frame1 = |n: u32| RootSlot::new(1, NodeId(n));
        for name in ["a1", "b1", "c1"] {
            table.insert(root(name), frame0(1), root("a0"));
        }
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3)] {
            table.insert(root("a2"), frame1(n), root(name));
            table.insert(root("b2"), frame1(n), root(name));
        }

        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3)] {
            election.process_root(root(name), frame1(n)).unwrap();
        }

        let res = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap();
        assert_eq!(
            res,
            Some(ElectionRes {
                decided_frame: 0,
                decided_sf_witness: root("a0"),
            })
        );
        assert_eq!(
            election
                .process_root(root("b2"), RootSlot::new(2, NodeId(2)))
                .unwrap(),
            None
        );
        assert_eq!(election.decided(), res);

        election.reset(1);
        assert_eq!(election.frame_to_decide(), 1);
        assert_eq!(election.decided(), None);
    }

    #[test]
    fn undecided_candidate_holds_the_frame_open() {
        // a1, b1, c1 see {a0, b0, c0}; d1 sees {b0, c0, d0}
        let table = InMemoryReachability::new();
        let frame0 = |n: u32| RootSlot::new(0, NodeId(n));
        let frame1 = |n: u32| RootSlot::new(1, NodeId(n));
        for name in ["a1", "b1", "c1"] {
            for (seen, n) in [("a0", 1), ("b0", 2), ("c0", 3)] {
                table.insert(root(name), frame0(n), root(seen));
            }
        }
        for (seen, n) in [("b0", 2), ("c0", 3), ("d0", 4)] {
            table.insert(root("d1"), frame0(n), root(seen));
        }
        for (name, n) in [("b1", 2), ("c1", 3), ("d1", 4)] {
            table.insert(root("c2"), frame1(n), root(name));
        }
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3)] {
            table.insert(root("a2"), frame1(n), root(name));
        }

        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3), ("d1", 4)] {
            election.process_root(root(name), frame1(n)).unwrap();
        }

        // b0 and c0 settle as yes, a0 is still open
        assert_eq!(
            election
                .process_root(root("c2"), RootSlot::new(2, NodeId(3)))
                .unwrap(),
            None
        );
        assert!(election.settled[&NodeId(2)].yes);
        assert!(!election.settled.contains_key(&NodeId(1)));

        let res = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap();
        assert_eq!(
            res.map(|r| r.decided_sf_witness),
            Some(root("a0"))
        );
    }

    #[test]
    fn every_candidate_rejected_is_an_error() {
        let table = InMemoryReachability::new();
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3)] {
            table.insert(root("a2"), RootSlot::new(1, NodeId(n)), root(name));
        }
        let mut election = Election::from_members(four_equal(), 0, table).unwrap();
        for (name, n) in [("a1", 1), ("b1", 2), ("c1", 3)] {
            election
                .process_root(root(name), RootSlot::new(1, NodeId(n)))
                .unwrap();
        }

        let err = election
            .process_root(root("a2"), RootSlot::new(2, NodeId(1)))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::AllCandidatesRejected(0)));
    }
}
