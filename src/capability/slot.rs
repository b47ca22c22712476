//! Slot-control capability boundary.

use crate::types::{SlotId, VirtualAbFeatures};

/// Boot-control operations consumed by the cleanup action.
pub trait SlotControlCapability {
    /// Whether this device uses Virtual A/B at all.
    ///
    /// On a non-Virtual-A/B device the cleanup action is a no-op.
    fn virtual_ab_enabled(&self) -> bool;

    /// The currently booted slot.
    fn current_slot(&self) -> SlotId;

    /// Whether the given slot has been marked successful by the boot
    /// health check.
    fn is_slot_marked_successful(&self, slot: SlotId) -> bool;

    /// Marks a slot unbootable.
    ///
    /// Called on the old slot after a completed merge: its rollback image
    /// no longer exists once the snapshots are gone.
    fn mark_slot_unbootable(&self, slot: SlotId);

    /// Provisioning-time Virtual A/B feature flags, queried at report time.
    fn virtual_ab_features(&self) -> VirtualAbFeatures;
}
