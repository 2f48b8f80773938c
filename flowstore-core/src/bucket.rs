//! Flow buckets: the unit of sharding and replication.
//!
//! A device's flow table is partitioned into [`NUM_BUCKETS`] buckets by
//! flow identifier. Each bucket is mutated and replicated as a single
//! unit, and carries the term and logical timestamp of its last mutation.
//! Two replicas of the same bucket are compared for freshness through
//! their [`FlowBucketDigest`]s alone; contents are only transferred when
//! the digests differ.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock::{LogicalClock, LogicalTimestamp};
use crate::entry::{AppId, DeviceId, FlowEntry, FlowId, FlowRule};

/// Number of buckets each device flow table is sharded into.
pub const NUM_BUCKETS: u32 = 1024;

/// Identifies one shard of a device's flow table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketId {
    /// The device the bucket belongs to.
    pub device: DeviceId,
    /// Bucket number in `[0, NUM_BUCKETS)`.
    pub bucket: u32,
}

/// A compact freshness summary of a bucket: enough to compare two
/// replicas without transferring contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowBucketDigest {
    /// Bucket number the digest describes.
    pub bucket: u32,
    /// Term of the bucket's last mutation.
    pub term: u64,
    /// Logical time of the bucket's last mutation.
    pub timestamp: LogicalTimestamp,
}

impl FlowBucketDigest {
    /// Digest ordering rule: later term wins; within a term, later
    /// Lamport time wins.
    #[must_use]
    pub fn is_newer_than(&self, other: &FlowBucketDigest) -> bool {
        self.term > other.term
            || (self.term == other.term && self.timestamp.is_newer_than(other.timestamp))
    }
}

/// One shard of a device flow table.
///
/// Entries are stored per flow identifier, and within a flow identifier
/// per rule identity: a flow id may map to multiple distinct rule bodies
/// sharing the identifier.
///
/// The bucket's `term` and `timestamp` are advanced exactly once per
/// successful mutation and are the only inputs to replica freshness
/// comparison.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowBucket {
    id: BucketId,
    term: u64,
    timestamp: LogicalTimestamp,
    flows: HashMap<FlowId, HashMap<FlowRule, FlowEntry>>,
}

impl FlowBucket {
    /// Create an empty bucket. All buckets are pre-allocated when the
    /// device table is constructed; they are cleared, never destroyed.
    #[must_use]
    pub fn new(id: BucketId) -> Self {
        Self {
            id,
            term: 0,
            timestamp: LogicalTimestamp::default(),
            flows: HashMap::new(),
        }
    }

    /// The bucket identifier.
    #[must_use]
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// The term of the last mutation.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.term
    }

    /// The logical time of the last mutation.
    #[must_use]
    pub fn timestamp(&self) -> LogicalTimestamp {
        self.timestamp
    }

    /// The digest summarizing this bucket's freshness.
    #[must_use]
    pub fn digest(&self) -> FlowBucketDigest {
        FlowBucketDigest {
            bucket: self.id.bucket,
            term: self.term,
            timestamp: self.timestamp,
        }
    }

    /// Number of entries in the bucket.
    #[must_use]
    pub fn count(&self) -> usize {
        self.flows.values().map(HashMap::len).sum()
    }

    /// The stored entry for the given rule, if any.
    #[must_use]
    pub fn get(&self, rule: &FlowRule) -> Option<&FlowEntry> {
        self.flows.get(&rule.id)?.get(rule)
    }

    /// All entries in the bucket.
    pub fn entries(&self) -> impl Iterator<Item = &FlowEntry> {
        self.flows.values().flat_map(HashMap::values)
    }

    fn record(&mut self, term: u64, clock: &LogicalClock) {
        self.term = term;
        self.timestamp = clock.increment();
    }

    /// Insert or overwrite an entry under its flow id. Always succeeds.
    pub fn add(&mut self, entry: FlowEntry, term: u64, clock: &LogicalClock) {
        self.flows
            .entry(entry.id())
            .or_default()
            .insert(entry.rule.clone(), entry);
        self.record(term, clock);
    }

    /// Replace the stored entry unless the incoming entry was created
    /// before the stored one. Stale writes from re-ordered duplicate
    /// deliveries are dropped without advancing the timestamp.
    ///
    /// Returns whether the entry was applied.
    pub fn update(&mut self, entry: FlowEntry, term: u64, clock: &LogicalClock) -> bool {
        let entries = self.flows.entry(entry.id()).or_default();
        if entries
            .get(&entry.rule)
            .is_some_and(|stored| entry.created < stored.created)
        {
            return false;
        }
        entries.insert(entry.rule.clone(), entry);
        self.record(term, clock);
        true
    }

    /// Apply a transform to the stored entry for `rule`, if present.
    ///
    /// The timestamp is advanced only when the transform returns a value,
    /// so state transitions are versioned like any other mutation.
    pub fn update_with<T>(
        &mut self,
        rule: &FlowRule,
        f: impl FnOnce(&mut FlowEntry) -> Option<T>,
        term: u64,
        clock: &LogicalClock,
    ) -> Option<T> {
        let result = self
            .flows
            .get_mut(&rule.id)
            .and_then(|entries| entries.get_mut(rule))
            .and_then(f);
        if result.is_some() {
            self.record(term, clock);
        }
        result
    }

    /// Remove the stored entry unless the removal targets an entry older
    /// than what is stored (the same staleness policy as [`update`]).
    ///
    /// Returns the removed entry, or `None` if nothing was removed or the
    /// removal was rejected as stale.
    ///
    /// [`update`]: FlowBucket::update
    pub fn remove(&mut self, entry: &FlowEntry, term: u64, clock: &LogicalClock) -> Option<FlowEntry> {
        let entries = self.flows.get_mut(&entry.id())?;
        if entries
            .get(&entry.rule)
            .is_some_and(|stored| entry.created < stored.created)
        {
            return None;
        }
        let removed = entries.remove(&entry.rule);
        if entries.is_empty() {
            self.flows.remove(&entry.id());
        }
        if removed.is_some() {
            self.record(term, clock);
        }
        removed
    }

    /// Clear all entries without versioning the mutation. Used by the
    /// table-wide purge, which also resets replication bookkeeping.
    pub fn purge(&mut self) {
        self.flows.clear();
    }

    /// Remove all entries installed by the given application.
    ///
    /// The timestamp is advanced only if something was actually removed.
    /// Returns the number of entries removed.
    pub fn purge_app(&mut self, app: AppId, term: u64, clock: &LogicalClock) -> usize {
        let before = self.count();
        self.flows.retain(|_, entries| {
            entries.retain(|rule, _| rule.app != app);
            !entries.is_empty()
        });
        let removed = before - self.count();
        if removed > 0 {
            self.record(term, clock);
        }
        removed
    }

    /// Clear the bucket and reset its version, making its digest older
    /// than any mutated replica. Used when the local node stops being an
    /// owner of the device's data: a later re-assignment must repull the
    /// bucket rather than trust the emptied copy.
    pub fn clear(&mut self) {
        self.flows.clear();
        self.term = 0;
        self.timestamp = LogicalTimestamp::default();
    }
}
