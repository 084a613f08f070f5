#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use lachesis_like_consensus::{
    reachability::InMemoryReachability,
    stake::Members,
    types::{Event, EventHash, FrameHeight, NodeId},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// `"c1"` is node 3.
pub fn node(name: &str) -> NodeId {
    NodeId(u32::from(name.as_bytes()[0] - b'a') + 1)
}

pub fn equal_members(count: u32) -> Members {
    Members::from_weights((1..=count).map(|n| (NodeId(n), 1)))
}

/// Hand-built DAG of named roots together with its strongly-see table.
///
/// A root is named after its creator and frame: `"b2"` is node 2's root at
/// frame 2. Each root strongly sees exactly the roots it is declared with,
/// which are also its parents.
#[derive(Default)]
pub struct Dag {
    pub table: Arc<InMemoryReachability>,
    events: HashMap<String, Event>,
    order: Vec<String>,
    /// Creator letters by ascending node id, when not alphabetical.
    creators: Option<String>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"dabc"` makes d node 1, a node 2 and so on.
    pub fn with_creator_order(letters: &str) -> Self {
        Self {
            creators: Some(letters.to_string()),
            ..Self::default()
        }
    }

    pub fn creator(&self, name: &str) -> NodeId {
        match &self.creators {
            Some(letters) => {
                let letter = name.as_bytes()[0];
                let position = letters
                    .bytes()
                    .position(|l| l == letter)
                    .unwrap_or_else(|| panic!("no creator for {name}"));
                NodeId(position as u32 + 1)
            }
            None => node(name),
        }
    }

    pub fn root(&mut self, name: &str, sees: &[&str]) -> &mut Self {
        let frame: FrameHeight = name[1..].parse().expect("frame suffix");
        let seen: Vec<Event> = sees.iter().map(|s| self.event(s)).collect();

        let event = Event::builder(self.creator(name))
            .with_frame(frame, true)
            .with_lamport(frame + 1)
            .with_claimed_time(u64::from(frame) * 1_000)
            .with_parents(seen.iter().map(Event::hash).collect())
            .build();
        for parent in &seen {
            let slot = parent.root_slot().expect("parent is a root");
            self.table.insert(event.hash(), slot, parent.hash());
        }

        self.events.insert(name.to_string(), event);
        self.order.push(name.to_string());
        self
    }

    /// Frame-0 roots with no parents.
    pub fn genesis(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            self.root(name, &[]);
        }
        self
    }

    pub fn event(&self, name: &str) -> Event {
        self.events
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("unknown root {name}"))
    }

    pub fn hash(&self, name: &str) -> EventHash {
        self.event(name).hash()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Every event, in the order it was declared.
    pub fn events(&self) -> Vec<Event> {
        self.order.iter().map(|name| self.event(name)).collect()
    }
}

/// `nodes` roots per frame for frames `1..=frames`. Every root strongly sees
/// every root of the frame below.
pub fn full_mesh(nodes: u8, frames: FrameHeight) -> Dag {
    let mut dag = Dag::new();
    let name = |n: u8, frame: FrameHeight| format!("{}{frame}", char::from(b'a' + n));
    for frame in 1..=frames {
        let below: Vec<String> = if frame == 1 {
            Vec::new()
        } else {
            (0..nodes).map(|n| name(n, frame - 1)).collect()
        };
        let below: Vec<&str> = below.iter().map(String::as_str).collect();
        for n in 0..nodes {
            dag.root(&name(n, frame), &below);
        }
    }
    dag
}
