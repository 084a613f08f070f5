//! Causal ordering buffer.
//!
//! Gossip delivers events in network order. [`EventBuffer`] holds every event
//! whose parents are not released yet and hands events to an [`EventSink`]
//! exactly once, parents first.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::{
    error::ConsensusError,
    types::{Event, EventHash, Lamport},
};

/// What the buffer needs to know about a DAG vertex.
pub trait Vertex {
    fn hash(&self) -> EventHash;
    fn parents(&self) -> &[EventHash];
    fn lamport(&self) -> Lamport;
}

impl Vertex for Event {
    fn hash(&self) -> EventHash {
        Event::hash(self)
    }

    fn parents(&self) -> &[EventHash] {
        Event::parents(self)
    }

    fn lamport(&self) -> Lamport {
        Event::lamport(self)
    }
}

/// Downstream of the buffer.
pub trait EventSink<E = Event> {
    /// Called once per event, after all of its parents. An error here is fatal
    /// and is returned from [`EventBuffer::submit`].
    fn process(&mut self, event: &E) -> Result<(), ConsensusError>;

    /// Called for an event that will never be released.
    fn drop_event(&mut self, event: &E, reason: ConsensusError);
}

#[derive(Debug)]
struct Pending<E> {
    event: E,
    missing: usize,
}

#[derive(Debug)]
pub struct EventBuffer<E = Event> {
    /// Released events and their Lamport time.
    released: HashMap<EventHash, Lamport>,
    incomplete: HashMap<EventHash, Pending<E>>,
    /// Missing parent -> buffered children waiting for it.
    waiting: HashMap<EventHash, Vec<EventHash>>,
    rejected: HashSet<EventHash>,
    /// Arrival order of buffered events, oldest first. May hold stale hashes.
    arrivals: VecDeque<EventHash>,
    max_buffered: usize,
}

impl<E: Vertex> EventBuffer<E> {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            released: HashMap::new(),
            incomplete: HashMap::new(),
            waiting: HashMap::new(),
            rejected: HashSet::new(),
            arrivals: VecDeque::new(),
            max_buffered,
        }
    }

    /// True once the event has been released to the sink.
    pub fn is_known(&self, hash: &EventHash) -> bool {
        self.released.contains_key(hash)
    }

    /// Number of events waiting for parents.
    pub fn len(&self) -> usize {
        self.incomplete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incomplete.is_empty()
    }

    pub fn released_count(&self) -> usize {
        self.released.len()
    }

    pub fn submit<S>(&mut self, event: E, sink: &mut S) -> Result<(), ConsensusError>
    where
        S: EventSink<E> + ?Sized,
    {
        let hash = event.hash();
        if self.released.contains_key(&hash)
            || self.incomplete.contains_key(&hash)
            || self.rejected.contains(&hash)
        {
            trace!("Ignoring duplicate event {hash:?}");
            return Ok(());
        }

        let mut parents: Vec<EventHash> = event.parents().to_vec();
        parents.sort_unstable();
        parents.dedup();

        if parents.contains(&hash) {
            self.reject(event, ConsensusError::CyclicParents(hash), sink);
            return Ok(());
        }
        if let Some(parent) = parents.iter().find(|p| self.rejected.contains(*p)) {
            let reason = ConsensusError::ParentRejected {
                event: hash,
                parent: *parent,
            };
            self.reject(event, reason, sink);
            return Ok(());
        }

        let missing: Vec<EventHash> = parents
            .into_iter()
            .filter(|p| !self.released.contains_key(p))
            .collect();
        if missing.is_empty() {
            let released = self.release(event, sink);
            self.compact_arrivals();
            return released;
        }

        if self.leads_back_to(&missing, &hash) {
            self.reject(event, ConsensusError::CyclicParents(hash), sink);
            return Ok(());
        }

        debug!(
            "Buffering event {hash:?}, waiting for {} parent(s)",
            missing.len()
        );
        for parent in &missing {
            self.waiting.entry(*parent).or_default().push(hash);
        }
        self.incomplete.insert(
            hash,
            Pending {
                event,
                missing: missing.len(),
            },
        );
        self.arrivals.push_back(hash);
        self.enforce_capacity(sink);
        Ok(())
    }

    /// Forget every buffered event without releasing it. Returns how many.
    pub fn discard_all(&mut self) -> usize {
        let discarded = self.incomplete.len();
        self.incomplete.clear();
        self.waiting.clear();
        self.arrivals.clear();
        discarded
    }

    fn release<S>(&mut self, event: E, sink: &mut S) -> Result<(), ConsensusError>
    where
        S: EventSink<E> + ?Sized,
    {
        let mut ready = VecDeque::from([event]);
        while let Some(event) = ready.pop_front() {
            if let Some(reason) = self.lamport_violation(&event) {
                self.reject(event, reason, sink);
                continue;
            }

            sink.process(&event)?;
            let hash = event.hash();
            self.released.insert(hash, event.lamport());
            trace!("Released event {hash:?}");

            for child in self.waiting.remove(&hash).unwrap_or_default() {
                let unblocked = match self.incomplete.get_mut(&child) {
                    Some(pending) => {
                        pending.missing -= 1;
                        pending.missing == 0
                    }
                    None => false,
                };
                if unblocked && let Some(pending) = self.incomplete.remove(&child) {
                    ready.push_back(pending.event);
                }
            }
        }
        Ok(())
    }

    fn lamport_violation(&self, event: &E) -> Option<ConsensusError> {
        event.parents().iter().find_map(|parent| {
            let parent_lamport = *self.released.get(parent)?;
            (event.lamport() <= parent_lamport).then(|| ConsensusError::NonMonotonicLamport {
                event: event.hash(),
                lamport: event.lamport(),
                parent: *parent,
                parent_lamport,
            })
        })
    }

    /// Whether some buffered ancestor reachable from `missing` names `target`
    /// as a parent.
    fn leads_back_to(&self, missing: &[EventHash], target: &EventHash) -> bool {
        let mut stack: Vec<EventHash> = missing.to_vec();
        let mut visited = HashSet::new();
        while let Some(hash) = stack.pop() {
            if hash == *target {
                return true;
            }
            if !visited.insert(hash) {
                continue;
            }
            if let Some(pending) = self.incomplete.get(&hash) {
                stack.extend(pending.event.parents().iter().copied());
            }
        }
        false
    }

    /// Drop `event` and, transitively, everything buffered behind it.
    fn reject<S>(&mut self, event: E, reason: ConsensusError, sink: &mut S)
    where
        S: EventSink<E> + ?Sized,
    {
        let mut queue = VecDeque::from([(event, reason)]);
        while let Some((event, reason)) = queue.pop_front() {
            let hash = event.hash();
            warn!("Dropping event {hash:?}: {reason}");
            self.rejected.insert(hash);
            sink.drop_event(&event, reason);

            for child in self.waiting.remove(&hash).unwrap_or_default() {
                if let Some(pending) = self.take_pending(&child) {
                    let reason = ConsensusError::ParentRejected {
                        event: child,
                        parent: hash,
                    };
                    queue.push_back((pending.event, reason));
                }
            }
        }
    }

    fn take_pending(&mut self, hash: &EventHash) -> Option<Pending<E>> {
        let pending = self.incomplete.remove(hash)?;
        for parent in pending.event.parents() {
            if let Some(children) = self.waiting.get_mut(parent) {
                children.retain(|child| child != hash);
                if children.is_empty() {
                    self.waiting.remove(parent);
                }
            }
        }
        Some(pending)
    }

    fn enforce_capacity<S>(&mut self, sink: &mut S)
    where
        S: EventSink<E> + ?Sized,
    {
        while self.incomplete.len() > self.max_buffered {
            let Some(oldest) = self.arrivals.pop_front() else {
                break;
            };
            if let Some(pending) = self.take_pending(&oldest) {
                self.reject(pending.event, ConsensusError::BufferOverflow(oldest), sink);
            }
        }
        self.compact_arrivals();
    }

    /// Forget hashes of events that already left the buffer, once they
    /// outnumber the buffered ones.
    fn compact_arrivals(&mut self) {
        if self.arrivals.len() > 2 * self.incomplete.len() {
            let incomplete = &self.incomplete;
            self.arrivals.retain(|hash| incomplete.contains_key(hash));
        }
    }
}
