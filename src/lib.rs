//! A message-driven Raft consensus core.
//!
//! A fixed cluster of replicas elects a leader, replicates an append-only
//! log of opaque payloads, and applies committed entries in order. Replicas
//! never touch threads or clocks directly: ticks, campaign rounds, and
//! message deliveries all flow through an [`executor::Executor`], so the
//! same protocol code runs on a worker pool in production and on a
//! deterministic queue in tests.
//!
//! Replicas live in a shared [`cluster::Cluster`] directory and are driven
//! through their lifecycle handlers; see [`replica::Replica`].

pub mod cluster;
pub mod executor;
pub mod message;
pub mod replica;
