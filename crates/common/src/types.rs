use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Best-effort, human-readable identity of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceIdentifier {
    ProductName(String),
    VendorProductFallback { vendor_id: u16, product_id: u16 },
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentifier::ProductName(name) => f.write_str(name),
            DeviceIdentifier::VendorProductFallback {
                vendor_id,
                product_id,
            } => write!(f, "VendorID: {:04x}, ProductID: {:04x}", vendor_id, product_id),
        }
    }
}

/// OS-addressable argument for the mount backend, e.g. `/dev/sdb1`.
///
/// Kept apart from [`DeviceIdentifier`]: a product name is for people, not for `umount`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountTarget(String);

impl MountTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountCommand {
    Unmount,
    Mount,
}

impl MountCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MountCommand::Unmount => "unmount",
            MountCommand::Mount => "mount",
        }
    }
}

impl fmt::Display for MountCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptionDecision {
    /// Unmounted, authorization still pending.
    Blocked,
    /// Authorization granted and the device was remounted.
    Authorized,
    DeniedNotRemounted,
    Error { command: MountCommand, reason: String },
    TimedOut { command: MountCommand },
}

impl InterceptionDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InterceptionDecision::Blocked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub instance: u64,
    pub identifier: DeviceIdentifier,
    pub target: Option<MountTarget>,
    pub decision: InterceptionDecision,
    pub decided_at: DateTime<Utc>,
}

/// What the event loop did with one device handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Skipped,
    Decided(InterceptionDecision),
}
