//! Stake-weighted member table and the 2/3 quorum threshold.

use std::collections::{BTreeMap, HashMap};

use num_bigint::BigUint;
use num_traits::Zero;

use crate::types::NodeId;

/// Stake weight of a node. Arbitrary precision, never negative.
pub type Stake = BigUint;

/// Strictly more than 2/3 of `total`: `floor(total * 2 / 3) + 1`.
///
/// Two conflicting values can never both collect this much stake.
pub fn quorum(total: &Stake) -> Stake {
    total * 2u32 / 3u32 + 1u32
}

/// Node → stake table of one super-frame.
///
/// Entries are kept sorted by stake descending, then by id ascending. That
/// order is the deterministic candidate order of the election.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Members {
    entries: Vec<(NodeId, Stake)>,
    index: HashMap<NodeId, usize>,
    total: Stake,
}

impl Members {
    /// Build the table. A repeated id keeps its last stake.
    pub fn new<I>(members: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, Stake)>,
    {
        let deduped: BTreeMap<NodeId, Stake> = members.into_iter().collect();
        let mut entries: Vec<(NodeId, Stake)> = deduped.into_iter().collect();
        entries.sort_by(|(id_a, stake_a), (id_b, stake_b)| {
            stake_b.cmp(stake_a).then_with(|| id_a.cmp(id_b))
        });

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();
        let total = entries.iter().map(|(_, stake)| stake).sum();

        Self {
            entries,
            index,
            total,
        }
    }

    /// Convenience constructor from plain integer weights.
    pub fn from_weights<I>(weights: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, u64)>,
    {
        Self::new(
            weights
                .into_iter()
                .map(|(id, weight)| (id, Stake::from(weight))),
        )
    }

    pub fn total_stake(&self) -> &Stake {
        &self.total
    }

    pub fn quorum(&self) -> Stake {
        quorum(&self.total)
    }

    /// Zero for non-members.
    pub fn stake_of(&self, id: &NodeId) -> Stake {
        self.index
            .get(id)
            .map(|&i| self.entries[i].1.clone())
            .unwrap_or_else(Stake::zero)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sorted_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Stake)> + '_ {
        self.entries.iter().map(|(id, stake)| (id, stake))
    }
}
