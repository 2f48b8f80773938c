//! Boundary to the cluster messaging substrate.
//!
//! The wire encoding and delivery mechanism are out of scope here: a
//! [`ClusterTransport`] implementation only needs asynchronous
//! request/response with node addressing. Every message crossing the
//! boundary travels in a [`Timestamped`] envelope so both ends can merge
//! their Lamport clocks.

use std::fmt;

use error_stack::Report;
use futures::{Future, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use flowstore_core::{DeviceId, FlowBucket, FlowBucketDigest, FlowEntry, NodeId, Timestamped};

/// A replication request addressed to one device's flow table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FlowTableRequest {
    /// Request the digests of all buckets (anti-entropy and mastership
    /// synchronization).
    GetDigests,
    /// Pull one bucket's full contents (mastership synchronization).
    GetBucket {
        /// The bucket number to fetch.
        bucket: u32,
    },
    /// Push a bucket replica to a backup.
    Backup {
        /// A point-in-time snapshot of the bucket.
        bucket: FlowBucket,
    },
    /// Read the flow entries in one bucket. Sent by non-masters
    /// forwarding a read to the current master.
    GetFlows {
        /// The bucket number to read.
        bucket: u32,
    },
}

/// Response to a [`FlowTableRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FlowTableResponse {
    /// Digests of all buckets.
    Digests(Vec<FlowBucketDigest>),
    /// One bucket's full contents.
    Bucket(FlowBucket),
    /// Whether a pushed bucket was accepted. `false` signals the receiver
    /// does not recognize the bucket's term yet; the sender treats it
    /// like a transport failure and retries on the next cycle.
    BackupAck(bool),
    /// Flow entries of one bucket.
    Flows(Vec<FlowEntry>),
}

/// Context for a failed transport operation. Implementations attach the
/// underlying cause to the [`Report`].
#[derive(Debug)]
pub struct TransportError;

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cluster transport request failed")
    }
}

impl std::error::Error for TransportError {}

/// An inbound request paired with its response channel.
///
/// The subscriber ticks its clock from the request timestamp, computes a
/// response, and sends it back timestamped. Dropping the responder counts
/// as a transport failure on the requesting side.
pub struct InboundRequest {
    /// The node the request came from.
    pub from: NodeId,
    /// The timestamped request payload.
    pub request: Timestamped<FlowTableRequest>,
    /// Channel for the timestamped response.
    pub responder: oneshot::Sender<Timestamped<FlowTableResponse>>,
}

/// Asynchronous per-device request/response messaging between nodes.
///
/// Implementations handle addressing, encoding, and delivery; the flow
/// table never blocks a caller thread on the network.
pub trait ClusterTransport: Clone + Send + Sync + 'static {
    /// Stream of requests addressed to the local node for a device.
    type Inbound: Stream<Item = InboundRequest> + Send + Unpin + 'static;

    /// Send a request to `to` for `device` and await the response.
    fn send_and_receive(
        &self,
        device: DeviceId,
        to: NodeId,
        request: Timestamped<FlowTableRequest>,
    ) -> impl Future<Output = Result<Timestamped<FlowTableResponse>, Report<TransportError>>> + Send;

    /// Subscribe to requests addressed to the local node for `device`.
    fn subscribe(&self, device: DeviceId) -> Self::Inbound;

    /// Drop the local subscription for `device`.
    fn unsubscribe(&self, device: DeviceId);
}
