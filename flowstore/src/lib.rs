//! Replicated per-device flow table
//!
//! Each network device has exactly one logical owner (master) among a
//! cluster of controller nodes. This crate implements the table holding a
//! device's flow rules: it survives master failover without losing
//! acknowledged writes, keeps backup replicas current off the write path,
//! and detects and repairs replica divergence.
//!
//! # Architecture
//!
//! - [`DeviceFlowTable`]: the orchestrator. Routes writes to buckets,
//!   gates them on the active mastership term, and runs the three
//!   replication protocols (periodic backup push, periodic anti-entropy
//!   pull, mastership-change synchronization).
//! - [`LifecycleManager`]: adapts the external mastership feed into
//!   ordered [`LifecycleEvent`]s that drive term activation.
//! - [`ClusterTransport`]: the boundary to the messaging substrate. The
//!   table wraps every payload in a `Timestamped` envelope and ticks its
//!   Lamport clock on both send and receive.
//!
//! Storage primitives (buckets, digests, clocks) live in `flowstore-core`.

#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod table;
pub mod transport;

pub use config::TableConfig;
pub use error::TableError;
pub use lifecycle::{LifecycleEvent, LifecycleManager, MastershipEvent, MastershipService};
pub use table::{BackupOperation, DeviceFlowTable};
pub use transport::{ClusterTransport, FlowTableRequest, FlowTableResponse, InboundRequest, TransportError};
