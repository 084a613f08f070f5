//! The election core of a DAG-based asynchronous BFT consensus.
//!
//! Validators gossip events that form a DAG. Some events are *roots*, the first
//! event of a validator in a frame. This crate takes released events in causal
//! order, counts stake-weighted virtual votes between roots and decides, frame
//! after frame, which root becomes the frame's super-frame witness. Every
//! decision produces a block and a new durable checkpoint.
//!
//! ## How it fits together
//!
//! - [`ordering::EventBuffer`] holds events until their parents are known and
//!   releases them in causal order, rejecting malformed ones.
//! - [`election::Election`] counts votes for one frame, asking a
//!   [`reachability::StronglySee`] oracle which roots see which.
//! - [`poset::Poset`] glues both, builds blocks, rolls the member set over at
//!   super-frame boundaries and keeps the [`checkpoint::Checkpoint`] current.
//! - [`service::ConsensusService`] runs a poset on a single tokio task, persists
//!   checkpoints and publishes [`events::ConsensusEvent`]s.
//!
//! Frame assignment, strongly-see computation, gossip and signatures live
//! upstream; this crate consumes their results.

pub mod checkpoint;
pub mod config;
pub mod election;
pub mod error;
pub mod events;
pub mod ordering;
pub mod poset;
pub mod reachability;
pub mod service;
pub mod source;
pub mod stake;
pub mod stats;
pub mod types;
