//! In-process cluster harness for the flow store.
//!
//! Wires [`DeviceFlowTable`]s hosted on simulated nodes together through
//! an in-memory request/response transport and a scriptable mastership
//! service. Supports partition injection and counts replication traffic
//! so tests can assert that backups are not re-sent needlessly.

#![warn(clippy::pedantic)]

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use error_stack::Report;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use flowstore::{
    ClusterTransport, DeviceFlowTable, FlowTableRequest, FlowTableResponse, InboundRequest,
    MastershipEvent, MastershipService, TableConfig, TransportError,
};
use flowstore_core::{
    AppId, DeviceId, DeviceReplicaInfo, FlowEntry, FlowId, FlowRule, NodeId, Timestamped,
};

/// A stream fed by the cluster hub over an unbounded channel.
pub struct Subscription<T>(mpsc::UnboundedReceiver<T>);

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

#[derive(Default)]
struct ClusterState {
    /// Inbound request feeds, keyed by (device, hosting node).
    inboxes: Mutex<HashMap<(DeviceId, NodeId), mpsc::UnboundedSender<InboundRequest>>>,
    /// Mastership event feeds per device, one per subscribed table.
    mastership_feeds: Mutex<HashMap<DeviceId, Vec<mpsc::UnboundedSender<MastershipEvent>>>>,
    /// Current replica assignment per device.
    replicas: Mutex<HashMap<DeviceId, DeviceReplicaInfo>>,
    /// Nodes currently cut off from the network.
    partitioned: Mutex<HashSet<NodeId>>,
    /// Backup requests delivered, keyed by (device, destination node).
    backups_delivered: Mutex<HashMap<(DeviceId, NodeId), usize>>,
}

impl ClusterState {
    fn broadcast(&self, device: DeviceId, event: MastershipEvent) {
        let mut feeds = self.mastership_feeds.lock().unwrap();
        if let Some(feeds) = feeds.get_mut(&device) {
            feeds.retain(|feed| feed.send(event.clone()).is_ok());
        }
    }
}

/// A simulated cluster: every node shares this hub, and tables built from
/// it talk to each other entirely in memory.
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<ClusterState>,
}

impl LocalCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the flow table for `device` hosted on `node`.
    #[must_use]
    pub fn table(
        &self,
        device: DeviceId,
        node: NodeId,
        config: TableConfig,
    ) -> DeviceFlowTable<LocalTransport, LocalMastership> {
        DeviceFlowTable::new(device, node, self.transport(node), self.mastership(), config)
    }

    #[must_use]
    pub fn transport(&self, node: NodeId) -> LocalTransport {
        LocalTransport {
            node,
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn mastership(&self) -> LocalMastership {
        LocalMastership {
            state: Arc::clone(&self.state),
        }
    }

    /// Install a new replica assignment for `device` and announce it to
    /// every subscribed table.
    pub fn set_replicas(
        &self,
        device: DeviceId,
        term: u64,
        master: Option<NodeId>,
        backups: Vec<NodeId>,
    ) {
        let info = DeviceReplicaInfo::new(term, master, backups);
        self.state
            .replicas
            .lock()
            .unwrap()
            .insert(device, info.clone());
        self.state.broadcast(device, MastershipEvent::Replicas(info));
    }

    /// Cut `node` off from the network: requests to and from it fail.
    pub fn partition(&self, node: NodeId) {
        self.state.partitioned.lock().unwrap().insert(node);
    }

    /// Reconnect a partitioned node.
    pub fn heal(&self, node: NodeId) {
        self.state.partitioned.lock().unwrap().remove(&node);
    }

    /// Number of backup requests delivered to `node` for `device` so far.
    #[must_use]
    pub fn backups_delivered(&self, device: DeviceId, node: NodeId) -> usize {
        self.state
            .backups_delivered
            .lock()
            .unwrap()
            .get(&(device, node))
            .copied()
            .unwrap_or(0)
    }
}

/// In-memory [`ClusterTransport`] for one simulated node.
#[derive(Clone)]
pub struct LocalTransport {
    node: NodeId,
    state: Arc<ClusterState>,
}

impl ClusterTransport for LocalTransport {
    type Inbound = Subscription<InboundRequest>;

    async fn send_and_receive(
        &self,
        device: DeviceId,
        to: NodeId,
        request: Timestamped<FlowTableRequest>,
    ) -> Result<Timestamped<FlowTableResponse>, Report<TransportError>> {
        {
            let partitioned = self.state.partitioned.lock().unwrap();
            if partitioned.contains(&self.node) || partitioned.contains(&to) {
                return Err(Report::new(TransportError)
                    .attach_printable(format!("{to} is unreachable from {}", self.node)));
            }
        }
        if matches!(request.value(), FlowTableRequest::Backup { .. }) {
            *self
                .state
                .backups_delivered
                .lock()
                .unwrap()
                .entry((device, to))
                .or_default() += 1;
        }
        trace!(from = %self.node, %to, %device, "delivering request");

        let (responder, response) = oneshot::channel();
        self.state
            .inboxes
            .lock()
            .unwrap()
            .get(&(device, to))
            .ok_or_else(|| {
                Report::new(TransportError)
                    .attach_printable(format!("{to} has no subscription for {device}"))
            })?
            .send(InboundRequest {
                from: self.node,
                request,
                responder,
            })
            .map_err(|_| {
                Report::new(TransportError)
                    .attach_printable(format!("{to} dropped its subscription for {device}"))
            })?;
        response.await.map_err(|_| {
            Report::new(TransportError).attach_printable("request dropped without a response")
        })
    }

    fn subscribe(&self, device: DeviceId) -> Self::Inbound {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .inboxes
            .lock()
            .unwrap()
            .insert((device, self.node), tx);
        Subscription(rx)
    }

    fn unsubscribe(&self, device: DeviceId) {
        self.state
            .inboxes
            .lock()
            .unwrap()
            .remove(&(device, self.node));
    }
}

/// Scriptable [`MastershipService`] backed by the cluster hub.
///
/// Assignments are installed with [`LocalCluster::set_replicas`];
/// activation by a master is re-broadcast to every subscribed table, the
/// way a coordination service would replicate the activation record.
#[derive(Clone)]
pub struct LocalMastership {
    state: Arc<ClusterState>,
}

impl MastershipService for LocalMastership {
    type Events = Subscription<MastershipEvent>;

    fn replica_info(&self, device: DeviceId) -> DeviceReplicaInfo {
        self.state
            .replicas
            .lock()
            .unwrap()
            .get(&device)
            .cloned()
            .unwrap_or_else(|| DeviceReplicaInfo::new(0, None, Vec::new()))
    }

    fn events(&self, device: DeviceId) -> Self::Events {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .mastership_feeds
            .lock()
            .unwrap()
            .entry(device)
            .or_default()
            .push(tx);
        Subscription(rx)
    }

    fn activate(&self, device: DeviceId, term: u64) {
        let info = self.state.replicas.lock().unwrap().get(&device).cloned();
        if let Some(info) = info
            && info.term() == term
        {
            self.state.broadcast(device, MastershipEvent::Activated(info));
        }
    }
}

/// A deterministic rule for tests. Flows with the same number modulo the
/// bucket count land in the same bucket.
#[must_use]
pub fn test_rule(device: DeviceId, flow: u64, app: u16) -> FlowRule {
    FlowRule {
        device,
        id: FlowId(flow),
        app: AppId(app),
        payload: Bytes::from(format!("match:{flow}")),
    }
}

/// An entry for `rule` created at the given timestamp.
#[must_use]
pub fn test_entry(rule: FlowRule, created: u64) -> FlowEntry {
    FlowEntry::new(rule, created)
}
