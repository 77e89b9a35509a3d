//! Per-vbucket engine core: durability monitoring and failover history.
//!
//! Each vbucket is an independent shard with its own seqno space. This crate
//! provides the state machines that live inside one: the durability monitors
//! (active and passive) that track in-flight synchronous writes, the snapshot
//! tracker feeding the passive monitor, and the failover table that records
//! history branches and answers rollback questions for replicating consumers.
//!
//! Higher layers supply the environment through small traits: a persistence
//! oracle plus ack sink ([`durability::VBucketContext`]) and a completion
//! sink for the active monitor. The crate itself never performs I/O.

pub mod config;
pub mod durability;
pub mod failover;
mod monotonic;
pub mod vbucket;

pub use monotonic::Monotonic;

/// Sequence number within one vbucket. Zero means "none yet".
pub type SeqNo = u64;

/// Identifier of a replication peer in a topology chain.
pub type NodeId = u64;

/// VBucket identifier.
pub type VBucketId = u16;
