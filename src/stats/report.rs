//! Finalized merge stats report and the persisted in-flight state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MergeFailureCode, MergeOutcome};

/// In-flight recorder state persisted through the progress store.
///
/// Written when the merge is initiated and on every recorder start, so an
/// interrupted merge leaves a usable record behind and a restarted process
/// can tell it is resuming rather than starting fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStatsState {
    /// Wall-clock time the first attempt of this merge started.
    pub started_at: DateTime<Utc>,
    /// How many times recording has resumed since `started_at`.
    pub resume_count: u32,
    pub outcome: MergeOutcome,
    pub boot_complete_time_ms: i64,
    pub boot_complete_to_merge_start_time_ms: i64,
    pub merge_failure_code: MergeFailureCode,
    pub source_build_fingerprint: String,
    pub cow_file_size_bytes: u64,
    pub total_cow_size_bytes: u64,
    pub estimated_cow_size_bytes: u64,
    pub compression_enabled: bool,
    pub userspace_snapshots_used: bool,
    pub xor_compression_used: bool,
    pub iouring_used: bool,
}

/// Immutable result of finalizing a [`super::MergeStatsRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeStatsReport {
    pub outcome: MergeOutcome,
    /// Total merge time, accumulated across interrupted attempts.
    pub merge_time: Duration,
    pub resume_count: u32,
    pub boot_complete_time_ms: i64,
    pub boot_complete_to_merge_start_time_ms: i64,
    pub merge_failure_code: MergeFailureCode,
    pub source_build_fingerprint: String,
    pub cow_file_size_bytes: u64,
    pub total_cow_size_bytes: u64,
    pub estimated_cow_size_bytes: u64,
    pub compression_enabled: bool,
    pub userspace_snapshots_used: bool,
    pub xor_compression_used: bool,
    pub iouring_used: bool,
}
