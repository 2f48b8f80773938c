//! Pure state for the replicated device flow table - no I/O, no async
//!
//! This crate contains the storage and versioning primitives shared by the
//! flow table orchestration layer and its tests:
//!
//! - **Logical clocks**: Lamport timestamps order all replication events
//!   instead of wall-clock time, which is not trusted across nodes.
//! - **Buckets**: flows are sharded into fixed buckets, each mutated and
//!   replicated as a single unit and summarized by a compact digest.
//! - **Replica info**: an immutable snapshot of the master/backup
//!   assignment for a device during one mastership term.

#![warn(clippy::pedantic)]

pub mod bucket;
pub mod clock;
pub mod entry;
pub mod replica;

pub use bucket::{BucketId, FlowBucket, FlowBucketDigest, NUM_BUCKETS};
pub use clock::{LogicalClock, LogicalTimestamp, Timestamped};
pub use entry::{AppId, DeviceId, FlowEntry, FlowId, FlowRule, FlowState, NodeId};
pub use replica::DeviceReplicaInfo;
