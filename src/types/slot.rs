//! Slot identifiers and Virtual A/B feature flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two bootable slots on an A/B device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Returns the opposite slot.
    ///
    /// A/B devices have exactly two slots, so this flips the low bit.
    pub fn other(self) -> SlotId {
        SlotId(self.0 ^ 1)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "_a"),
            1 => write!(f, "_b"),
            n => write!(f, "slot {}", n),
        }
    }
}

/// Virtual A/B feature flags exposed by the slot-control capability.
///
/// These describe how the device was provisioned, not how a particular
/// update behaved; per-update usage flags live in the merge stats report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualAbFeatures {
    /// Device retrofits Virtual A/B onto a pre-dynamic-partitions layout.
    pub retrofit: bool,
    /// Snapshot compression is enabled.
    pub compression: bool,
    /// XOR compression is enabled.
    pub xor_compression: bool,
    /// Snapshots are merged by a userspace daemon instead of dm-snapshot.
    pub userspace_snapshots: bool,
}
