//! Flow rule and flow entry records.
//!
//! The replication core treats the match/action contents of a rule as an
//! opaque payload; it only needs rule identity, a mutable state field, and
//! the creation ordinal used to resolve conflicting concurrent writes to
//! the same rule identity.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies a network device owning one logical flow table.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

/// Identifies a controller node in the cluster.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Stable identifier shared by all rules keyed on the same flow.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Identifies the application that installed a rule.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AppId(pub u16);

/// State of a flow entry as tracked by the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    /// Installation has been requested but not yet confirmed by the device.
    #[default]
    PendingAdd,
    /// The device has confirmed the rule is installed.
    Added,
    /// Removal has been requested but not yet confirmed by the device.
    PendingRemove,
    /// The device has confirmed the rule is removed.
    Removed,
    /// The device rejected the rule.
    Failed,
}

/// A flow rule: identity plus an opaque match/action payload.
///
/// Equality covers all fields; two rules with the same [`FlowId`] but
/// different payloads are distinct entries in the same bucket slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRule {
    /// The device the rule applies to.
    pub device: DeviceId,
    /// The flow identifier, which selects the bucket the rule lives in.
    pub id: FlowId,
    /// The application that owns the rule.
    pub app: AppId,
    /// Opaque match/action contents.
    pub payload: Bytes,
}

/// A flow rule plus the mutable runtime state tracked for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// The rule this entry tracks.
    pub rule: FlowRule,
    /// Current controller-side state of the rule.
    pub state: FlowState,
    /// Creation ordinal. When two writes race on the same rule identity,
    /// the entry created later wins and the older write is dropped.
    pub created: u64,
    /// Bytes matched by the rule, as last reported by the device.
    pub bytes: u64,
    /// Packets matched by the rule, as last reported by the device.
    pub packets: u64,
    /// Seconds the rule has been installed.
    pub life: u64,
    /// Timestamp of the last statistics report.
    pub last_seen: u64,
}

impl FlowEntry {
    /// Create a new entry in the default [`FlowState::PendingAdd`] state.
    #[must_use]
    pub fn new(rule: FlowRule, created: u64) -> Self {
        Self {
            rule,
            state: FlowState::default(),
            created,
            bytes: 0,
            packets: 0,
            life: 0,
            last_seen: 0,
        }
    }

    /// The flow identifier of the underlying rule.
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.rule.id
    }
}
