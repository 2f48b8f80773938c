//! The device flow table orchestrator.
//!
//! Flows are stored in buckets; each bucket is mutated and replicated as
//! a single unit, and tables for different devices communicate
//! independently of each other for parallelism.
//!
//! Three replication protocols keep replicas current:
//!
//! 1. **Backup push**: on a fixed period the master pushes every bucket
//!    whose timestamp advanced past the last successful push to each
//!    backup. Completed pushes immediately re-check the bucket so
//!    replication drains a fast-moving master instead of always waiting a
//!    full period.
//! 2. **Anti-entropy pull**: on a separate period the master requests
//!    bucket digests from each backup and resets the backup bookkeeping
//!    for any bucket the backup is missing, forcing a re-push. This
//!    repairs silent divergence (e.g. after a backup restart).
//! 3. **Mastership-change synchronization**: on `TermStart` the new
//!    master pulls newer buckets from the prior master, falling back to
//!    the prior backups, then activates the term. Writes submitted while
//!    the term is not yet active are queued per bucket and drained on
//!    activation, never dropped or applied to stale data.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::JoinMap;
use tracing::{debug, info, instrument, trace, warn};

use flowstore_core::{
    AppId, BucketId, DeviceId, DeviceReplicaInfo, FlowBucket, FlowBucketDigest, FlowEntry, FlowId,
    FlowRule, LogicalClock, LogicalTimestamp, NodeId, Timestamped, NUM_BUCKETS,
};

use crate::config::TableConfig;
use crate::error::TableError;
use crate::lifecycle::{LifecycleEvent, LifecycleManager, MastershipService};
use crate::transport::{ClusterTransport, FlowTableRequest, FlowTableResponse, InboundRequest, TransportError};

/// Identifies one replication stream: a bucket being pushed to a node.
///
/// Used to de-duplicate concurrent pushes to the same destination and to
/// track the last successfully replicated timestamp per destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackupOperation {
    /// The destination node.
    pub node: NodeId,
    /// The bucket number being replicated.
    pub bucket: u32,
}

/// An operation parked until its bucket's term becomes active. The drain
/// supplies the bucket and clock when the time comes.
type PendingTask = Box<dyn FnOnce(&mut FlowBucket, &LogicalClock) + Send>;

/// In-flight backup pushes for one replication pass, keyed by operation.
type BackupAttempts = JoinMap<
    BackupOperation,
    (
        LogicalTimestamp,
        Result<Timestamped<FlowTableResponse>, Report<TransportError>>,
    ),
>;

/// Flow table for all flows associated with a specific device.
///
/// Writes are accepted only on the device's current master; replication
/// to backups happens off the write path. Construction pre-allocates all
/// [`NUM_BUCKETS`] buckets, subscribes to the transport and mastership
/// feeds, and starts the periodic backup and anti-entropy loops.
pub struct DeviceFlowTable<T: ClusterTransport, M: MastershipService> {
    inner: Arc<TableInner<T, M>>,
    tasks: Vec<JoinHandle<()>>,
    backup_period: watch::Sender<Duration>,
    anti_entropy_period: watch::Sender<Duration>,
}

struct TableInner<T: ClusterTransport, M: MastershipService> {
    device: DeviceId,
    local: NodeId,
    transport: T,
    lifecycle: LifecycleManager<M>,
    clock: LogicalClock,
    /// Fixed at construction; only bucket contents are ever mutated.
    buckets: Box<[Mutex<FlowBucket>]>,
    /// The table's view of the replica assignment, lagging the lifecycle
    /// manager's during event processing.
    replica_state: Mutex<Option<DeviceReplicaInfo>>,
    /// Highest term the local node has finished synchronizing.
    active_term: AtomicU64,
    /// Per-bucket queues of writes parked during a term transition.
    /// Guarded by its own lock, distinct from any bucket lock.
    pending: Mutex<HashMap<u32, VecDeque<PendingTask>>>,
    /// Last successfully replicated timestamp per (node, bucket).
    last_backup: Mutex<HashMap<BackupOperation, LogicalTimestamp>>,
    /// Pushes currently on the wire, across all replication passes.
    in_flight: Mutex<HashSet<BackupOperation>>,
    sync_timeout: Duration,
}

impl<T: ClusterTransport, M: MastershipService> DeviceFlowTable<T, M> {
    /// Create the flow table for `device` on the local node.
    ///
    /// Must be called within a tokio runtime: the table spawns its
    /// request handler, lifecycle, backup, and anti-entropy tasks.
    #[must_use]
    pub fn new(device: DeviceId, local: NodeId, transport: T, mastership: M, config: TableConfig) -> Self {
        let (lifecycle, lifecycle_events) = LifecycleManager::new(device, mastership);
        let (backup_period, backup_period_rx) = watch::channel(config.backup_period);
        let (anti_entropy_period, anti_entropy_rx) = watch::channel(config.anti_entropy_period);
        let inbound = transport.subscribe(device);

        let buckets = (0..NUM_BUCKETS)
            .map(|bucket| Mutex::new(FlowBucket::new(BucketId { device, bucket })))
            .collect();

        let inner = Arc::new(TableInner {
            device,
            local,
            transport,
            lifecycle,
            clock: LogicalClock::new(),
            buckets,
            replica_state: Mutex::new(None),
            active_term: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            last_backup: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            sync_timeout: config.sync_timeout,
        });

        let info = inner.lifecycle.replica_info();
        if info.term() > 0 {
            *inner.replica_state.lock().unwrap() = Some(info.clone());
        }

        let tasks = vec![
            tokio::spawn(run_handler(Arc::clone(&inner), inbound)),
            tokio::spawn(run_lifecycle(Arc::clone(&inner), lifecycle_events)),
            tokio::spawn(run_backup_loop(Arc::clone(&inner), backup_period_rx)),
            tokio::spawn(run_anti_entropy_loop(Arc::clone(&inner), anti_entropy_rx)),
        ];

        // A node constructed as the standing master has nothing to
        // recover: activate its term immediately.
        inner.activate_master(&info);

        Self {
            inner,
            tasks,
            backup_period,
            anti_entropy_period,
        }
    }

    /// Add an entry to the table.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::NotMaster`] if the local node does not
    /// hold mastership for the device.
    pub async fn add(&self, entry: FlowEntry) -> Result<(), Report<TableError>> {
        self.inner
            .run_in_term(entry.id(), move |bucket, term, clock| {
                bucket.add(entry, term, clock);
            })
            .await
    }

    /// Update an entry in the table. Updates targeting an entry older
    /// than what is stored are silently dropped.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::NotMaster`] if the local node does not
    /// hold mastership for the device.
    pub async fn update(&self, entry: FlowEntry) -> Result<(), Report<TableError>> {
        self.inner
            .run_in_term(entry.id(), move |bucket, term, clock| {
                bucket.update(entry, term, clock);
            })
            .await
    }

    /// Apply `f` to the stored entry for `rule`, returning its result.
    /// The mutation is versioned only if `f` returns a value.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::NotMaster`] if the local node does not
    /// hold mastership for the device.
    pub async fn update_with<F, R>(&self, rule: FlowRule, f: F) -> Result<Option<R>, Report<TableError>>
    where
        F: FnOnce(&mut FlowEntry) -> Option<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner
            .run_in_term(rule.id, move |bucket, term, clock| {
                bucket.update_with(&rule, f, term, clock)
            })
            .await
    }

    /// Remove an entry from the table, returning the removed entry.
    /// Removals targeting an entry older than what is stored are rejected
    /// and return `None`.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::NotMaster`] if the local node does not
    /// hold mastership for the device.
    pub async fn remove(&self, entry: FlowEntry) -> Result<Option<FlowEntry>, Report<TableError>> {
        self.inner
            .run_in_term(entry.id(), move |bucket, term, clock| {
                bucket.remove(&entry, term, clock)
            })
            .await
    }

    /// Total number of entries in the table.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap().count())
            .sum()
    }

    /// The locally stored entry for `rule`, if any.
    #[must_use]
    pub fn flow_entry(&self, rule: &FlowRule) -> Option<FlowEntry> {
        self.inner
            .bucket(bucket_number(rule.id))
            .lock()
            .unwrap()
            .get(rule)
            .cloned()
    }

    /// All flow entries for the device.
    ///
    /// On the master this reads locally; on any other node the read is
    /// forwarded to the current master. With no master anywhere the
    /// result is empty.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::ReadFailed`] if forwarding to the master
    /// fails.
    pub async fn flow_entries(&self) -> Result<Vec<FlowEntry>, Report<TableError>> {
        let inner = &self.inner;
        let replica = inner.lifecycle.replica_info();
        if replica.is_master(inner.local) {
            return Ok(inner.local_entries());
        }
        let Some(master) = replica.master() else {
            return Ok(Vec::new());
        };
        let requests = (0..NUM_BUCKETS).map(|bucket| inner.request_flows(master, bucket));
        let mut entries = Vec::new();
        for result in futures::future::join_all(requests).await {
            entries.extend(result.change_context(TableError::ReadFailed(inner.device))?);
        }
        Ok(entries)
    }

    /// Digests of all buckets, in bucket-number order.
    #[must_use]
    pub fn digests(&self) -> Vec<FlowBucketDigest> {
        self.inner.digests()
    }

    /// Clear the whole table, including queued operations and replication
    /// bookkeeping. Does not advance bucket versions.
    pub fn purge(&self) {
        let inner = &self.inner;
        inner.pending.lock().unwrap().clear();
        for bucket in &*inner.buckets {
            bucket.lock().unwrap().purge();
        }
        inner.last_backup.lock().unwrap().clear();
        inner.in_flight.lock().unwrap().clear();
    }

    /// Remove all entries installed by `app`, across every bucket.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::NotMaster`] if the local node does not
    /// hold mastership for the device.
    pub async fn purge_app(&self, app: AppId) -> Result<(), Report<TableError>> {
        let inner = &self.inner;
        let replica = inner.lifecycle.replica_info();
        if !replica.is_master(inner.local) {
            return Err(Report::new(TableError::NotMaster(inner.device)));
        }
        let term = replica.term();
        let purges = (0..NUM_BUCKETS).map(|bucket| {
            inner.run_in_term_bucket(bucket, term, move |bucket, term, clock| {
                bucket.purge_app(app, term, clock);
            })
        });
        for result in futures::future::join_all(purges).await {
            result?;
        }
        Ok(())
    }

    /// Change the backup period without restarting the table.
    pub fn set_backup_period(&self, period: Duration) {
        let _ = self.backup_period.send(period);
    }

    /// Change the anti-entropy period without restarting the table.
    pub fn set_anti_entropy_period(&self, period: Duration) {
        let _ = self.anti_entropy_period.send(period);
    }

    /// Shut the table down: cancel the periodic loops, drop the transport
    /// subscription, and stop tracking mastership. In-flight requests are
    /// abandoned; their responses would be ignored anyway.
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.transport.unsubscribe(self.inner.device);
        self.inner.lifecycle.close();
    }
}

impl<T: ClusterTransport, M: MastershipService> Drop for DeviceFlowTable<T, M> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The bucket number owning a flow identifier.
fn bucket_number(flow: FlowId) -> u32 {
    (flow.0 % u64::from(NUM_BUCKETS)) as u32
}

fn unexpected_response(request: &'static str, response: &FlowTableResponse) -> Report<TransportError> {
    Report::new(TransportError)
        .attach_printable(format!("unexpected response to {request}: {response:?}"))
}

impl<T: ClusterTransport, M: MastershipService> TableInner<T, M> {
    fn bucket(&self, number: u32) -> &Mutex<FlowBucket> {
        &self.buckets[number as usize]
    }

    fn digest(&self, number: u32) -> Option<FlowBucketDigest> {
        let bucket = self.buckets.get(number as usize)?;
        Some(bucket.lock().unwrap().digest())
    }

    fn digests(&self) -> Vec<FlowBucketDigest> {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap().digest())
            .collect()
    }

    fn local_entries(&self) -> Vec<FlowEntry> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.lock().unwrap().entries().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn apply<R>(
        &self,
        bucket_nr: u32,
        term: u64,
        f: impl FnOnce(&mut FlowBucket, u64, &LogicalClock) -> R,
    ) -> R {
        let mut bucket = self.bucket(bucket_nr).lock().unwrap();
        f(&mut bucket, term, &self.clock)
    }

    /// Run a mutation against the bucket owning `flow`, in the current
    /// term.
    async fn run_in_term<R, F>(&self, flow: FlowId, f: F) -> Result<R, Report<TableError>>
    where
        F: FnOnce(&mut FlowBucket, u64, &LogicalClock) -> R + Send + 'static,
        R: Send + 'static,
    {
        let replica = self.lifecycle.replica_info();
        if !replica.is_master(self.local) {
            return Err(Report::new(TableError::NotMaster(self.device)));
        }
        self.run_in_term_bucket(bucket_number(flow), replica.term(), f)
            .await
    }

    /// Run a mutation against one bucket in `term`, queueing it if the
    /// term has not yet been activated (the bucket has not been
    /// synchronized with prior replicas).
    async fn run_in_term_bucket<R, F>(
        &self,
        bucket_nr: u32,
        term: u64,
        f: F,
    ) -> Result<R, Report<TableError>>
    where
        F: FnOnce(&mut FlowBucket, u64, &LogicalClock) -> R + Send + 'static,
        R: Send + 'static,
    {
        enum Gate<R, F> {
            Ready(F),
            Queued(oneshot::Receiver<R>),
        }

        // The active-term check happens under the queue lock, and
        // activation publishes the term before taking this lock to drain.
        // An operation that misses the drain therefore observes the term
        // as active and runs synchronously instead of queueing.
        let gate = {
            let mut pending = self.pending.lock().unwrap();
            if self.active_term.load(Ordering::Acquire) < term {
                debug!(device = %self.device, bucket = bucket_nr, term, "queueing operation until term activates");
                let (tx, rx) = oneshot::channel();
                pending
                    .entry(bucket_nr)
                    .or_default()
                    .push_back(Box::new(move |bucket, clock| {
                        let _ = tx.send(f(bucket, term, clock));
                    }));
                Gate::Queued(rx)
            } else {
                Gate::Ready(f)
            }
        };

        match gate {
            Gate::Ready(f) => Ok(self.apply(bucket_nr, term, f)),
            Gate::Queued(rx) => rx
                .await
                .map_err(|_| Report::new(TableError::Shutdown(self.device))),
        }
    }

    // ========================================================================
    // Backup (push) protocol
    // ========================================================================

    /// One replication pass: push every pending bucket change to every
    /// backup, draining each (node, bucket) stream until it is current.
    async fn backup_all(&self) {
        let replica = self.lifecycle.replica_info();
        if !replica.is_master(self.local) {
            return;
        }

        let mut attempts: BackupAttempts = JoinMap::new();
        for bucket in 0..NUM_BUCKETS {
            for &node in replica.backups() {
                self.try_start_backup(&mut attempts, &replica, node, bucket);
            }
        }

        while let Some((op, joined)) = attempts.join_next().await {
            match joined {
                Ok((timestamp, Ok(response))) => {
                    let (response, remote) = response.into_parts();
                    self.clock.tick(remote);
                    match response {
                        FlowTableResponse::BackupAck(true) => {
                            self.succeed_backup(op, timestamp);
                            // The bucket may have moved on while this push
                            // was in flight; start the next one immediately.
                            self.try_start_backup(&mut attempts, &replica, op.node, op.bucket);
                        }
                        FlowTableResponse::BackupAck(false) => {
                            debug!(node = %op.node, bucket = op.bucket, "backup rejected: term mismatch");
                            self.fail_backup(op);
                        }
                        other => {
                            debug!(node = %op.node, bucket = op.bucket, ?other, "unexpected backup response");
                            self.fail_backup(op);
                        }
                    }
                }
                Ok((_, Err(error))) => {
                    debug!(node = %op.node, bucket = op.bucket, ?error, "backup failed");
                    self.fail_backup(op);
                }
                Err(join_error) => {
                    warn!(node = %op.node, bucket = op.bucket, ?join_error, "backup task failed");
                    self.fail_backup(op);
                }
            }
        }
    }

    /// Start a push for one (node, bucket) pair if the bucket is in the
    /// current term, has changes pending replication, and no push to the
    /// same destination is already in flight.
    fn try_start_backup(
        &self,
        attempts: &mut BackupAttempts,
        replica: &DeviceReplicaInfo,
        node: NodeId,
        bucket_nr: u32,
    ) {
        let timestamp = {
            let bucket = self.bucket(bucket_nr).lock().unwrap();
            // Buckets not yet mutated in the current term are skipped;
            // mastership synchronization brings them in-term first.
            if bucket.term() != replica.term() {
                return;
            }
            bucket.timestamp()
        };

        let op = BackupOperation { node, bucket: bucket_nr };
        if attempts.contains_key(&op) {
            return;
        }
        {
            let last = self.last_backup.lock().unwrap();
            if last.get(&op).is_some_and(|last| !last.is_older_than(timestamp)) {
                return;
            }
        }
        if !self.in_flight.lock().unwrap().insert(op) {
            return;
        }

        // Snapshot only once the push is committed; most passes bail out on
        // the checks above without copying anything. The bucket may have
        // advanced past `timestamp` by now, in which case the next pass
        // simply pushes it again.
        let snapshot = self.bucket(bucket_nr).lock().unwrap().clone();

        trace!(node = %node, bucket = bucket_nr, count = snapshot.count(), "backing up bucket");
        let transport = self.transport.clone();
        let device = self.device;
        let request = self
            .clock
            .timestamp(FlowTableRequest::Backup { bucket: snapshot });
        attempts.spawn(op, async move {
            let result = transport.send_and_receive(device, node, request).await;
            (timestamp, result)
        });
    }

    fn succeed_backup(&self, op: BackupOperation, timestamp: LogicalTimestamp) {
        self.last_backup.lock().unwrap().insert(op, timestamp);
        self.in_flight.lock().unwrap().remove(&op);
    }

    fn fail_backup(&self, op: BackupOperation) {
        self.in_flight.lock().unwrap().remove(&op);
    }

    /// Forget the last completed push for `op` so the next backup pass
    /// re-replicates the bucket even though no new local write occurred.
    fn reset_backup(&self, op: BackupOperation) {
        self.last_backup.lock().unwrap().remove(&op);
    }

    /// Accept or reject a bucket pushed by the device master.
    fn on_backup(&self, incoming: FlowBucket) -> bool {
        trace!(bucket = incoming.id().bucket, count = incoming.count(), "received bucket backup");

        let replica = self.lifecycle.replica_info();
        // A push for a term we don't know about yet is rejected: the
        // sender retries once we have learned about the term.
        if incoming.term() != replica.term() {
            debug!(
                incoming = incoming.term(),
                current = replica.term(),
                "rejecting backup: term mismatch"
            );
            return false;
        }
        if incoming.id().device != self.device {
            return false;
        }
        let Some(local) = self.buckets.get(incoming.id().bucket as usize) else {
            return false;
        };

        let mut local = local.lock().unwrap();
        if incoming.digest().is_newer_than(&local.digest()) {
            *local = incoming;
        }
        true
    }

    // ========================================================================
    // Anti-entropy (pull) protocol
    // ========================================================================

    /// One anti-entropy pass: compare digests with each backup and force
    /// a re-push of any bucket the backup is behind on.
    async fn run_anti_entropy(&self) {
        let replica = self.lifecycle.replica_info();
        if !replica.is_master(self.local) {
            return;
        }

        for &node in replica.backups() {
            // Flush pending pushes first so the digest comparison sees
            // steady state rather than scheduled-but-unsent backups.
            self.backup_all().await;

            match self.request_digests(node).await {
                Ok(digests) => {
                    for remote in digests {
                        let Some(local) = self.digest(remote.bucket) else {
                            continue;
                        };
                        if local.is_newer_than(&remote) {
                            debug!(%node, bucket = remote.bucket, "detected missing flow entries on backup");
                            self.reset_backup(BackupOperation {
                                node,
                                bucket: remote.bucket,
                            });
                        }
                    }
                }
                Err(error) => {
                    debug!(%node, ?error, "anti-entropy digest exchange failed");
                }
            }
        }
    }

    // ========================================================================
    // Mastership-change synchronization
    // ========================================================================

    async fn start_term(&self, info: DeviceReplicaInfo) {
        let prev = self.replica_state.lock().unwrap().replace(info.clone());
        if info.is_master(self.local) {
            info!(device = %self.device, term = info.term(), "synchronizing flows for new term");
            self.sync_flows(prev, info).await;
        }
    }

    async fn sync_flows(&self, prev: Option<DeviceReplicaInfo>, new: DeviceReplicaInfo) {
        let Some(prev) = prev else {
            // First-ever assignment: nothing to recover.
            self.activate_master(&new);
            return;
        };

        if let Some(master) = prev.master()
            && master != self.local
        {
            match self.sync_with(master).await {
                Ok(()) => self.activate_master(&new),
                Err(error) => {
                    warn!(
                        device = %self.device,
                        %master,
                        ?error,
                        "failed to synchronize with prior master, trying prior backups"
                    );
                    self.sync_from_backups(&prev).await;
                    self.activate_master(&new);
                }
            }
        } else {
            self.sync_from_backups(&prev).await;
            self.activate_master(&new);
        }
    }

    /// Best effort: a master with no reachable prior holder of state
    /// activates with whatever local state exists rather than stalling.
    async fn sync_from_backups(&self, prev: &DeviceReplicaInfo) {
        for &node in prev.backups() {
            if node == self.local {
                continue;
            }
            match self.sync_with(node).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(device = %self.device, %node, ?error, "failed to synchronize with prior backup");
                }
            }
        }
    }

    async fn sync_with(&self, node: NodeId) -> Result<(), Report<TransportError>> {
        tokio::time::timeout(self.sync_timeout, self.pull_newer_buckets(node))
            .await
            .map_err(|_| {
                Report::new(TransportError)
                    .attach_printable(format!("synchronization with {node} timed out"))
            })?
    }

    /// Pull every bucket `node` holds a strictly newer copy of.
    async fn pull_newer_buckets(&self, node: NodeId) -> Result<(), Report<TransportError>> {
        info!(device = %self.device, %node, "synchronizing flows");
        let digests = self.request_digests(node).await?;
        let stale: Vec<u32> = digests
            .into_iter()
            .filter(|remote| {
                self.digest(remote.bucket)
                    .is_some_and(|local| remote.is_newer_than(&local))
            })
            .map(|remote| remote.bucket)
            .collect();

        let pulls = stale.into_iter().map(|bucket| self.sync_bucket(node, bucket));
        for result in futures::future::join_all(pulls).await {
            result?;
        }
        Ok(())
    }

    async fn sync_bucket(&self, node: NodeId, bucket_nr: u32) -> Result<(), Report<TransportError>> {
        debug!(device = %self.device, %node, bucket = bucket_nr, "pulling bucket");
        let incoming = match self
            .send_with_timestamp(node, FlowTableRequest::GetBucket { bucket: bucket_nr })
            .await?
        {
            FlowTableResponse::Bucket(bucket) => bucket,
            other => return Err(unexpected_response("GetBucket", &other)),
        };

        let Some(local) = self.buckets.get(bucket_nr as usize) else {
            return Err(Report::new(TransportError)
                .attach_printable(format!("bucket {bucket_nr} out of range")));
        };
        let mut local = local.lock().unwrap();
        // Replace only if still newer on arrival: a concurrent local
        // update may have won the race.
        if incoming.digest().is_newer_than(&local.digest()) {
            *local = incoming;
        }
        Ok(())
    }

    // ========================================================================
    // Term lifecycle
    // ========================================================================

    fn activate_master(&self, info: &DeviceReplicaInfo) {
        if !info.is_master(self.local) {
            return;
        }
        info!(device = %self.device, term = info.term(), "activating term");
        // Publish the active term before draining: a writer that finds
        // its bucket's queue already drained must observe the term as
        // active and run synchronously instead of queueing.
        self.active_term.store(info.term(), Ordering::Release);
        for bucket in 0..NUM_BUCKETS {
            self.drain_bucket(bucket);
        }
        self.lifecycle.activate(info.term());
    }

    fn drain_bucket(&self, bucket_nr: u32) {
        // The queue is detached under its own lock before the bucket lock
        // is taken, preserving the queue-lock/bucket-lock ordering.
        let tasks = self.pending.lock().unwrap().remove(&bucket_nr);
        if let Some(tasks) = tasks {
            debug!(device = %self.device, bucket = bucket_nr, count = tasks.len(), "completing queued operations");
            let mut bucket = self.bucket(bucket_nr).lock().unwrap();
            for task in tasks {
                task(&mut bucket, &self.clock);
            }
        }
    }

    fn activate_term(&self, info: &DeviceReplicaInfo) {
        {
            let mut state = self.replica_state.lock().unwrap();
            let current_term = state.as_ref().map_or(0, DeviceReplicaInfo::term);
            if info.term() < current_term {
                return;
            }
            if info.term() > current_term {
                *state = Some(info.clone());
            }
        }

        // Stale non-owners should not retain device state.
        if !info.is_master(self.local) && !info.is_backup(self.local) {
            debug!(device = %self.device, "clearing buckets: local node no longer holds a replica");
            self.clear_buckets();
        }
        self.active_term.store(info.term(), Ordering::Release);
    }

    fn update_term(&self, info: &DeviceReplicaInfo) {
        {
            let mut state = self.replica_state.lock().unwrap();
            let Some(current) = state.as_ref() else {
                return;
            };
            if current.term() != info.term() {
                return;
            }
            *state = Some(info.clone());
        }

        if self.active_term.load(Ordering::Acquire) == info.term()
            && !info.is_master(self.local)
            && !info.is_backup(self.local)
        {
            debug!(device = %self.device, "clearing buckets: local node dropped from the backup set");
            self.clear_buckets();
        }
    }

    fn clear_buckets(&self) {
        for bucket in &*self.buckets {
            bucket.lock().unwrap().clear();
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send a request wrapped in a Lamport timestamp, merging the clock
    /// from the response.
    async fn send_with_timestamp(
        &self,
        to: NodeId,
        request: FlowTableRequest,
    ) -> Result<FlowTableResponse, Report<TransportError>> {
        let request = self.clock.timestamp(request);
        let response = self.transport.send_and_receive(self.device, to, request).await?;
        let (value, timestamp) = response.into_parts();
        self.clock.tick(timestamp);
        Ok(value)
    }

    async fn request_digests(&self, node: NodeId) -> Result<Vec<FlowBucketDigest>, Report<TransportError>> {
        match self.send_with_timestamp(node, FlowTableRequest::GetDigests).await? {
            FlowTableResponse::Digests(digests) => Ok(digests),
            other => Err(unexpected_response("GetDigests", &other)),
        }
    }

    async fn request_flows(&self, node: NodeId, bucket: u32) -> Result<Vec<FlowEntry>, Report<TransportError>> {
        match self
            .send_with_timestamp(node, FlowTableRequest::GetFlows { bucket })
            .await?
        {
            FlowTableResponse::Flows(entries) => Ok(entries),
            other => Err(unexpected_response("GetFlows", &other)),
        }
    }

    /// Handle one inbound request. `None` means the request was malformed
    /// and the responder should be dropped, which the sender observes as
    /// a transport failure.
    fn handle_request(&self, request: FlowTableRequest) -> Option<FlowTableResponse> {
        match request {
            FlowTableRequest::GetDigests => Some(FlowTableResponse::Digests(self.digests())),
            FlowTableRequest::GetBucket { bucket } => {
                let bucket = self.buckets.get(bucket as usize)?;
                Some(FlowTableResponse::Bucket(bucket.lock().unwrap().clone()))
            }
            FlowTableRequest::Backup { bucket } => {
                Some(FlowTableResponse::BackupAck(self.on_backup(bucket)))
            }
            FlowTableRequest::GetFlows { bucket } => {
                let bucket = self.buckets.get(bucket as usize)?;
                let entries = bucket.lock().unwrap().entries().cloned().collect();
                Some(FlowTableResponse::Flows(entries))
            }
        }
    }
}

/// Serve inbound replication requests, ticking the clock on receive and
/// stamping each response.
#[instrument(skip_all, name = "flow_table", fields(device = %inner.device, node = %inner.local))]
async fn run_handler<T: ClusterTransport, M: MastershipService>(
    inner: Arc<TableInner<T, M>>,
    mut inbound: T::Inbound,
) {
    while let Some(InboundRequest { from, request, responder }) = inbound.next().await {
        inner.clock.tick(request.timestamp());
        let Some(response) = inner.handle_request(request.into_value()) else {
            warn!(%from, "dropping malformed request");
            continue;
        };
        let _ = responder.send(inner.clock.timestamp(response));
    }
    trace!("inbound request stream closed");
}

/// React to lifecycle events from the mastership feed.
#[instrument(skip_all, name = "lifecycle_events", fields(device = %inner.device, node = %inner.local))]
async fn run_lifecycle<T: ClusterTransport, M: MastershipService>(
    inner: Arc<TableInner<T, M>>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        trace!(?event, "lifecycle event");
        match event {
            LifecycleEvent::TermStart(info) => inner.start_term(info).await,
            LifecycleEvent::TermActive(info) => inner.activate_term(&info),
            LifecycleEvent::TermUpdate(info) => inner.update_term(&info),
        }
    }
}

/// Periodic backup pushes, with a runtime-adjustable period.
#[instrument(skip_all, name = "backup", fields(device = %inner.device, node = %inner.local))]
async fn run_backup_loop<T: ClusterTransport, M: MastershipService>(
    inner: Arc<TableInner<T, M>>,
    mut period: watch::Receiver<Duration>,
) {
    let mut interval = tokio::time::interval(*period.borrow());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.backup_all().await,
            changed = period.changed() => {
                if changed.is_err() {
                    return;
                }
                let new_period = *period.borrow_and_update();
                debug!(?new_period, "backup period changed");
                interval = tokio::time::interval(new_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }
}

/// Periodic anti-entropy, with a runtime-adjustable period.
#[instrument(skip_all, name = "anti_entropy", fields(device = %inner.device, node = %inner.local))]
async fn run_anti_entropy_loop<T: ClusterTransport, M: MastershipService>(
    inner: Arc<TableInner<T, M>>,
    mut period: watch::Receiver<Duration>,
) {
    let mut interval = tokio::time::interval(*period.borrow());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.run_anti_entropy().await,
            changed = period.changed() => {
                if changed.is_err() {
                    return;
                }
                let new_period = *period.borrow_and_update();
                debug!(?new_period, "anti-entropy period changed");
                interval = tokio::time::interval(new_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }
}
