//! Mastership lifecycle tracking.
//!
//! The [`LifecycleManager`] is the table's sole source of truth for "what
//! term am I in and who are the master/backups". It consumes the raw feed
//! from the external mastership service and emits ordered
//! [`LifecycleEvent`]s:
//!
//! - `TermStart` when a new term begins (new master elected or
//!   reassigned),
//! - `TermActive` once that term's master confirms it has synchronized
//!   with the prior replicas and the term is authoritative,
//! - `TermUpdate` when the backup set changes without a master change.

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use flowstore_core::{DeviceId, DeviceReplicaInfo};

/// Raw event feed produced by the external mastership service.
#[derive(Clone, Debug)]
pub enum MastershipEvent {
    /// The master or backup assignment for the device changed.
    Replicas(DeviceReplicaInfo),
    /// A master durably recorded that its term is synchronized and now
    /// authoritative. Observed by every replica of the device.
    Activated(DeviceReplicaInfo),
}

/// Ordered lifecycle events consumed by the flow table.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// A new term has begun.
    TermStart(DeviceReplicaInfo),
    /// The term's master has completed synchronization; the term is
    /// authoritative.
    TermActive(DeviceReplicaInfo),
    /// The backup set changed within the current term.
    TermUpdate(DeviceReplicaInfo),
}

/// Source of replica assignments per device. Mastership election itself
/// is external; this trait is the adapter surface the lifecycle manager
/// binds to.
pub trait MastershipService: Clone + Send + Sync + 'static {
    /// Stream of raw mastership events for one device.
    type Events: Stream<Item = MastershipEvent> + Send + Unpin + 'static;

    /// The current replica assignment for `device`.
    fn replica_info(&self, device: DeviceId) -> DeviceReplicaInfo;

    /// The raw event feed for `device`.
    fn events(&self, device: DeviceId) -> Self::Events;

    /// Durably record that `term` is synchronized and authoritative for
    /// `device`. The service re-delivers this as
    /// [`MastershipEvent::Activated`] to every subscribed replica.
    fn activate(&self, device: DeviceId, term: u64);
}

/// Tracks a device's replica assignment, detects term transitions, and
/// emits lifecycle events.
pub struct LifecycleManager<M: MastershipService> {
    device: DeviceId,
    service: M,
    info: watch::Receiver<DeviceReplicaInfo>,
    feed: JoinHandle<()>,
}

impl<M: MastershipService> LifecycleManager<M> {
    /// Create a manager for `device`, returning it together with the
    /// lifecycle event stream the table consumes.
    #[must_use]
    pub fn new(device: DeviceId, service: M) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let initial = service.replica_info(device);
        let (info_tx, info_rx) = watch::channel(initial.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let events = service.events(device);
        let feed = tokio::spawn(run_feed(device, initial, events, info_tx, event_tx));
        (
            Self {
                device,
                service,
                info: info_rx,
                feed,
            },
            event_rx,
        )
    }

    /// The current replica assignment snapshot. Never blocks.
    #[must_use]
    pub fn replica_info(&self) -> DeviceReplicaInfo {
        self.info.borrow().clone()
    }

    /// Record that `term` is synchronized and safe to serve from.
    pub fn activate(&self, term: u64) {
        self.service.activate(self.device, term);
    }

    /// Stop consuming the mastership feed.
    pub fn close(&self) {
        self.feed.abort();
    }
}

impl<M: MastershipService> Drop for LifecycleManager<M> {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

/// Translate the raw mastership feed into ordered lifecycle events.
///
/// Events for terms older than the current one are stale deliveries and
/// are dropped.
#[instrument(skip_all, name = "lifecycle", fields(device = %device))]
async fn run_feed<E>(
    device: DeviceId,
    mut current: DeviceReplicaInfo,
    mut events: E,
    info_tx: watch::Sender<DeviceReplicaInfo>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
) where
    E: Stream<Item = MastershipEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            MastershipEvent::Replicas(info) => {
                if info.term() > current.term() {
                    debug!(term = info.term(), master = ?info.master(), "term started");
                    current = info.clone();
                    info_tx.send_replace(info.clone());
                    if event_tx.send(LifecycleEvent::TermStart(info)).is_err() {
                        return;
                    }
                } else if info.term() == current.term() && info != current {
                    debug!(term = info.term(), "replica set updated");
                    current = info.clone();
                    info_tx.send_replace(info.clone());
                    if event_tx.send(LifecycleEvent::TermUpdate(info)).is_err() {
                        return;
                    }
                } else {
                    trace!(term = info.term(), "ignoring stale replica event");
                }
            }
            MastershipEvent::Activated(info) => {
                if info.term() < current.term() {
                    trace!(term = info.term(), "ignoring stale activation");
                    continue;
                }
                if info.term() > current.term() {
                    current = info.clone();
                    info_tx.send_replace(info.clone());
                }
                debug!(term = info.term(), "term active");
                if event_tx.send(LifecycleEvent::TermActive(info)).is_err() {
                    return;
                }
            }
        }
    }
    trace!("mastership feed closed");
}
