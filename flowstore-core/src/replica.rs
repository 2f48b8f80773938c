//! Replica assignment snapshots.

use serde::{Deserialize, Serialize};

use crate::entry::NodeId;

/// An immutable snapshot of a device's master/backup assignment for one
/// mastership term.
///
/// Every replication decision reads one of these; a new snapshot replaces
/// the old wholesale on each mastership or backup-set change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReplicaInfo {
    term: u64,
    master: Option<NodeId>,
    backups: Vec<NodeId>,
}

impl DeviceReplicaInfo {
    /// Create a snapshot for the given term. `backups` is ordered by
    /// failover preference.
    #[must_use]
    pub fn new(term: u64, master: Option<NodeId>, backups: Vec<NodeId>) -> Self {
        Self {
            term,
            master,
            backups,
        }
    }

    /// The mastership term, increasing only on master change.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.term
    }

    /// The node authorized to accept writes, if any.
    #[must_use]
    pub fn master(&self) -> Option<NodeId> {
        self.master
    }

    /// The nodes designated to hold replicas, in failover order.
    #[must_use]
    pub fn backups(&self) -> &[NodeId] {
        &self.backups
    }

    /// Whether `node` is the master for this term.
    #[must_use]
    pub fn is_master(&self, node: NodeId) -> bool {
        self.master == Some(node)
    }

    /// Whether `node` is a backup for this term.
    #[must_use]
    pub fn is_backup(&self, node: NodeId) -> bool {
        self.backups.contains(&node)
    }
}
