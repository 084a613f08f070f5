use std::collections::{HashMap, HashSet};

use proptest::{prelude::*, sample::Index};

use lachesis_like_consensus::{
    error::ConsensusError,
    ordering::{EventBuffer, EventSink},
    types::{Event, EventHash, NodeId},
};

#[derive(Default)]
struct Recorder {
    released: Vec<EventHash>,
    dropped: Vec<(EventHash, String)>,
}

impl EventSink for Recorder {
    fn process(&mut self, event: &Event) -> Result<(), ConsensusError> {
        self.released.push(event.hash());
        Ok(())
    }

    fn drop_event(&mut self, event: &Event, reason: ConsensusError) {
        assert!(reason.is_event_rejection(), "unexpected drop reason {reason}");
        self.dropped.push((event.hash(), reason.to_string()));
    }
}

/// Event `i` picks its parents among events `0..i`; Lamport follows.
fn build_dag(parent_picks: &[Vec<Index>]) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::with_capacity(parent_picks.len());
    for (i, picks) in parent_picks.iter().enumerate() {
        let mut parents: Vec<usize> = if i == 0 {
            Vec::new()
        } else {
            picks.iter().map(|pick| pick.index(i)).collect()
        };
        parents.sort_unstable();
        parents.dedup();

        let lamport = parents
            .iter()
            .map(|p| events[*p].lamport())
            .max()
            .unwrap_or(0)
            + 1;
        let event = Event::builder(NodeId(i as u32))
            .with_lamport(lamport)
            .with_parents(parents.iter().map(|p| events[*p].hash()).collect())
            .with_payload(vec![i as u8])
            .build();
        events.push(event);
    }
    events
}

fn dag_and_arrival() -> impl Strategy<Value = (Vec<Event>, Vec<usize>)> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..4), 1..40).prop_flat_map(
        |picks| {
            let events = build_dag(&picks);
            let order: Vec<usize> = (0..events.len()).collect();
            (Just(events), Just(order).prop_shuffle())
        },
    )
}

proptest! {
    /// Every event is released exactly once and after all of its parents.
    #[test]
    fn releases_in_causal_order((events, arrival) in dag_and_arrival()) {
        let mut buffer = EventBuffer::new(1024);
        let mut recorder = Recorder::default();
        for i in &arrival {
            buffer.submit(events[*i].clone(), &mut recorder).unwrap();
        }

        prop_assert!(recorder.dropped.is_empty());
        prop_assert_eq!(recorder.released.len(), events.len());
        prop_assert!(buffer.is_empty());

        let position: HashMap<EventHash, usize> = recorder
            .released
            .iter()
            .enumerate()
            .map(|(pos, hash)| (*hash, pos))
            .collect();
        prop_assert_eq!(position.len(), events.len());
        for event in &events {
            for parent in event.parents() {
                prop_assert!(position[parent] < position[&event.hash()]);
            }
        }
    }

    /// Submitting the same events again changes nothing.
    #[test]
    fn resubmission_is_idempotent((events, arrival) in dag_and_arrival()) {
        let mut buffer = EventBuffer::new(1024);
        let mut recorder = Recorder::default();
        for i in arrival.iter().chain(arrival.iter()) {
            buffer.submit(events[*i].clone(), &mut recorder).unwrap();
        }

        let unique: HashSet<EventHash> = recorder.released.iter().copied().collect();
        prop_assert_eq!(unique.len(), recorder.released.len());
        prop_assert_eq!(recorder.released.len(), events.len());
        prop_assert_eq!(buffer.released_count(), events.len());
    }
}

#[test]
fn test_rejection_cascades_to_buffered_descendants() {
    let parent = Event::builder(NodeId(1)).with_lamport(3).build();
    // equal Lamport: rejected once its parent is released
    let child = Event::builder(NodeId(2))
        .with_lamport(3)
        .with_parents(vec![parent.hash()])
        .build();
    let grandchild = Event::builder(NodeId(3))
        .with_lamport(4)
        .with_parents(vec![child.hash()])
        .build();

    let mut buffer = EventBuffer::new(16);
    let mut recorder = Recorder::default();
    buffer.submit(grandchild.clone(), &mut recorder).unwrap();
    buffer.submit(child.clone(), &mut recorder).unwrap();
    assert_eq!(buffer.len(), 2);

    buffer.submit(parent.clone(), &mut recorder).unwrap();

    assert_eq!(recorder.released, vec![parent.hash()]);
    let dropped: Vec<EventHash> = recorder.dropped.iter().map(|(hash, _)| *hash).collect();
    assert_eq!(dropped, vec![child.hash(), grandchild.hash()]);
    assert!(recorder.dropped[1].1.contains("depends on rejected parent"));
    assert!(buffer.is_empty());

    // a late child of a rejected event is dropped on arrival
    let late = Event::builder(NodeId(4))
        .with_lamport(9)
        .with_parents(vec![grandchild.hash()])
        .build();
    buffer.submit(late.clone(), &mut recorder).unwrap();
    assert_eq!(recorder.dropped.last().map(|(hash, _)| *hash), Some(late.hash()));
}

#[test]
fn test_sink_error_propagates() {
    struct Failing;

    impl EventSink for Failing {
        fn process(&mut self, event: &Event) -> Result<(), ConsensusError> {
            Err(ConsensusError::UnknownEvent(event.hash()))
        }

        fn drop_event(&mut self, _event: &Event, _reason: ConsensusError) {}
    }

    let mut buffer = EventBuffer::new(16);
    let event = Event::builder(NodeId(1)).build();
    let err = buffer.submit(event.clone(), &mut Failing).unwrap_err();

    assert!(matches!(err, ConsensusError::UnknownEvent(hash) if hash == event.hash()));
    assert!(!buffer.is_known(&event.hash()));
}
