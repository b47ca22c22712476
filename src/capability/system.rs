//! Host system-state boundary.
//!
//! The four host signals the action reads are grouped behind one trait so
//! tests can script boot progress and administrator configuration without
//! touching real system properties.

/// Live host signals consumed by the cleanup action.
pub trait SystemState {
    /// The system-wide boot-completed readiness signal.
    ///
    /// Queried repeatedly by the boot gate; meaningless in recovery.
    fn boot_completed(&self) -> bool;

    /// Administrator-configured merge delay in seconds, unclamped.
    fn merge_delay_seconds(&self) -> u64;

    /// Whether a dynamic-system-update image is currently running.
    ///
    /// Merging while a temporary image is active is unsafe.
    fn dsu_image_running(&self) -> bool;

    /// The build fingerprint of the currently running system.
    fn build_fingerprint(&self) -> String;
}
