//! Persisted progress-store boundary.
//!
//! The store holds the update engine's persisted key-value preferences.
//! The cleanup action uses it for two things: resetting persisted update
//! progress before approving a cancellation, and persisting the merge
//! stats recorder's state so resume counting survives process restarts.

/// Marker key written when dynamic-partition metadata has been updated.
///
/// A non-empty value means metadata may be inconsistent with the on-disk
/// snapshots; cancellation must not delete them in that state.
pub const DYNAMIC_PARTITION_METADATA_UPDATED_KEY: &str = "dynamic-partition-metadata-updated";

/// Key under which the merge stats recorder persists its in-flight state.
pub const MERGE_STATS_STATE_KEY: &str = "snapshot-merge-stats-state";

/// Persisted key-value preference storage consumed by the cleanup action.
pub trait ProgressStore {
    /// Resets persisted update progress.
    ///
    /// `quick` skips the expensive full reset; `skip_dynamic_partitions_metadata`
    /// leaves the dynamic-partition metadata marker in place. Returns whether
    /// the reset succeeded.
    fn reset_update_progress(&self, quick: bool, skip_dynamic_partitions_metadata: bool) -> bool;

    /// Reads a string value, `None` if the key is absent.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Writes a string value. Returns whether the write succeeded.
    fn set_string(&self, key: &str, value: &str) -> bool;

    /// Removes a key. Returns whether the removal succeeded (removing an
    /// absent key is a success).
    fn remove(&self, key: &str) -> bool;
}
