//! Flow table configuration.

use std::time::Duration;

/// Replication timing knobs for one device flow table.
///
/// Both periods can also be adjusted at runtime through
/// [`DeviceFlowTable::set_backup_period`] and
/// [`DeviceFlowTable::set_anti_entropy_period`] without restarting the
/// table.
///
/// [`DeviceFlowTable::set_backup_period`]: crate::DeviceFlowTable::set_backup_period
/// [`DeviceFlowTable::set_anti_entropy_period`]: crate::DeviceFlowTable::set_anti_entropy_period
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    /// How often the master pushes changed buckets to its backups.
    pub backup_period: Duration,
    /// How often the master compares digests with each backup to detect
    /// silently diverged replicas.
    pub anti_entropy_period: Duration,
    /// Bound on each synchronization attempt against a prior replica
    /// during a mastership change. A timed-out attempt is treated like a
    /// transport failure and falls through to the next candidate.
    pub sync_timeout: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            backup_period: Duration::from_millis(2000),
            anti_entropy_period: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(15),
        }
    }
}
