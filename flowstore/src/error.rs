//! Caller-visible error types.

use std::fmt;

use flowstore_core::DeviceId;

/// Errors surfaced by the flow table's caller-facing API.
///
/// Replication failures are never surfaced here: transport errors during
/// backup, anti-entropy, or synchronization are logged and retried on the
/// next scheduled cycle.
#[derive(Debug)]
pub enum TableError {
    /// A write was submitted to a node that does not hold mastership for
    /// the device. Not retried internally; the caller must resubmit to
    /// the current master.
    NotMaster(DeviceId),
    /// The table was closed while a queued operation was still pending.
    Shutdown(DeviceId),
    /// A read forwarded to the master could not be completed.
    ReadFailed(DeviceId),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::NotMaster(device) => {
                write!(f, "local node is not the master for {device}")
            }
            TableError::Shutdown(device) => {
                write!(f, "flow table for {device} was closed")
            }
            TableError::ReadFailed(device) => {
                write!(f, "failed to read flow entries for {device} from the master")
            }
        }
    }
}

impl std::error::Error for TableError {}
