//! Snapshot-merge capability boundary.
//!
//! The cleanup action does not own the merge. It drives a capability that
//! does, through the trait below, and the capability calls back into the
//! action synchronously while a poll is in flight (progress updates and the
//! pre-cancellation hook). The trait-based seam enables:
//! - Fake capabilities for deterministic tests
//! - A real implementation backed by the platform's snapshot manager
//! - Logging/tracing wrappers
//!
//! # Example (fake for testing)
//!
//! ```ignore
//! struct ScriptedCapability {
//!     outcomes: RefCell<VecDeque<MergeOutcome>>,
//! }
//!
//! impl SnapshotMergeCapability for ScriptedCapability {
//!     type Mount = ();
//!
//!     fn poll_merge_state(&self, observer: &mut dyn PollObserver) -> MergeOutcome {
//!         let next = self.outcomes.borrow_mut().pop_front().unwrap();
//!         if next == MergeOutcome::Merging {
//!             observer.on_merge_percentage();
//!         }
//!         next
//!     }
//!     // ...
//! }
//! ```

use crate::stats::MergeStatsRecorder;
use crate::types::{CreateResult, MergeFailureCode, MergeOutcome};

/// Hooks invoked synchronously from inside [`SnapshotMergeCapability::poll_merge_state`].
///
/// Implementations must not assume either hook fires on any given poll:
/// progress fires while the merge is advancing, and `before_cancel` fires
/// only when the capability is about to commit to `Cancelled`.
pub trait PollObserver {
    /// Called when merge progress advances.
    ///
    /// Returns whether the capability should keep waiting inside the poll
    /// call. The cleanup action always answers `false` so control returns
    /// promptly to the scheduler instead of blocking for the whole merge.
    fn on_merge_percentage(&mut self) -> bool;

    /// Called before the capability transitions into `Cancelled`.
    ///
    /// Returns whether cancellation is approved. Rejecting keeps the
    /// snapshots on disk so an inconsistent metadata state is never made
    /// worse by deleting them.
    fn before_cancel(&mut self) -> bool;
}

/// The merge capability consumed by the cleanup action.
pub trait SnapshotMergeCapability {
    /// Handle to the mounted metadata filesystem.
    ///
    /// Owned by the action once acquired and released only at completion.
    /// The capability decides what the handle actually is (a mount guard,
    /// a device path, a unit in tests).
    type Mount;

    /// Whether the merge precondition holds at all on this boot.
    fn is_merge_needed(&self) -> bool;

    /// Mounts the metadata partition if not already mounted.
    ///
    /// Returns `None` on failure. In recovery an unformatted metadata
    /// partition is a legitimate state, so callers decide severity.
    fn ensure_metadata_mounted(&self) -> Option<Self::Mount>;

    /// Recreates snapshot devices for an in-flight previous update.
    ///
    /// Only meaningful in recovery, where the devices do not survive into
    /// the minimal boot environment.
    fn recreate_snapshot_devices(&self, mount: &Self::Mount) -> CreateResult;

    /// Copies feature/compression flags for the current update into the
    /// stats recorder.
    fn set_merge_stats_features(&self, stats: &mut MergeStatsRecorder);

    /// Reads the persisted failure code from the last merge attempt.
    fn read_merge_failure_code(&self) -> MergeFailureCode;

    /// Polls the merge once, driving it forward a bounded amount.
    ///
    /// May perform bounded internal work but must return promptly; the
    /// observer hooks fire synchronously during the call.
    fn poll_merge_state(&self, observer: &mut dyn PollObserver) -> MergeOutcome;

    /// Returns the current update state and merge completion percentage
    /// in `[0, 100]`, without driving the merge.
    fn update_state(&self) -> (MergeOutcome, f64);

    /// Cancels the in-flight update record and cleans up its snapshots.
    fn cancel_update(&self) -> bool;

    /// Requests that the merge begin.
    fn initiate_merge(&self) -> bool;

    /// Reads the build fingerprint the update was applied on top of.
    fn read_source_build_fingerprint(&self) -> String;

    /// Copies copy-on-write usage totals into the stats recorder.
    fn update_cow_stats(&self, stats: &mut MergeStatsRecorder);
}
