//! Telemetry accumulation for one merge attempt.
//!
//! The recorder is exclusively owned by the state machine and mutated on
//! every poll. Persistence goes through the [`ProgressStore`] so that
//! resume counting and the start timestamp survive process restarts; all
//! persistence failures are surfaced as [`StatsError`] and swallowed by
//! callers, because degraded telemetry must never degrade correctness.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::store::{ProgressStore, MERGE_STATS_STATE_KEY};
use crate::types::{MergeFailureCode, MergeOutcome};

use super::report::{MergeStatsReport, MergeStatsState};

/// Errors from recorder persistence and finalization.
#[derive(Debug, Error)]
pub enum StatsError {
    /// The recording window was never opened.
    #[error("merge stats recording was never started")]
    NotStarted,

    /// Serializing the persisted state failed.
    #[error("failed to serialize merge stats state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The progress store rejected the write.
    #[error("progress store rejected the merge stats write")]
    StoreRejected,
}

/// An open recording window.
#[derive(Debug, Clone)]
struct RecordingWindow {
    started_at: DateTime<Utc>,
    resume_count: u32,
}

impl RecordingWindow {
    fn fresh() -> Self {
        RecordingWindow {
            started_at: Utc::now(),
            resume_count: 0,
        }
    }
}

/// Accumulates timing and outcome telemetry across one merge attempt.
#[derive(Debug, Default)]
pub struct MergeStatsRecorder {
    window: Option<RecordingWindow>,
    outcome: MergeOutcome,
    boot_complete_time_ms: i64,
    boot_complete_to_merge_start_time_ms: i64,
    merge_failure_code: MergeFailureCode,
    source_build_fingerprint: String,
    cow_file_size_bytes: u64,
    total_cow_size_bytes: u64,
    estimated_cow_size_bytes: u64,
    compression_enabled: bool,
    userspace_snapshots_used: bool,
    xor_compression_used: bool,
    iouring_used: bool,
}

impl MergeStatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the recording window, resuming a persisted one if present.
    ///
    /// A persisted state means a previous recording was interrupted (the
    /// process restarted, or the action was suspended and resumed); the
    /// original start time is kept so merge time accumulates, and the
    /// resume count increments.
    pub fn start(&mut self, store: &dyn ProgressStore) -> Result<(), StatsError> {
        let window = match store.get_string(MERGE_STATS_STATE_KEY) {
            Some(raw) if !raw.is_empty() => match serde_json::from_str::<MergeStatsState>(&raw) {
                Ok(prior) => {
                    debug!(
                        resume_count = prior.resume_count + 1,
                        "resuming an interrupted merge stats window"
                    );
                    RecordingWindow {
                        started_at: prior.started_at,
                        resume_count: prior.resume_count + 1,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "discarding unparseable merge stats state");
                    RecordingWindow::fresh()
                }
            },
            _ => RecordingWindow::fresh(),
        };
        self.window = Some(window);
        self.write_state(store)
    }

    /// Persists the current accumulation through the progress store.
    pub fn write_state(&self, store: &dyn ProgressStore) -> Result<(), StatsError> {
        let window = self.window.as_ref().ok_or(StatsError::NotStarted)?;
        let state = self.to_state(window);
        let raw = serde_json::to_string(&state)?;
        if !store.set_string(MERGE_STATS_STATE_KEY, &raw) {
            return Err(StatsError::StoreRejected);
        }
        Ok(())
    }

    /// Finalizes the recorder, clearing the persisted state and producing
    /// the immutable report.
    ///
    /// Fails only when the window was never opened; clearing the persisted
    /// state is best-effort.
    pub fn finish(self, store: &dyn ProgressStore) -> Result<MergeStatsReport, StatsError> {
        let window = self.window.as_ref().ok_or(StatsError::NotStarted)?;
        if !store.remove(MERGE_STATS_STATE_KEY) {
            warn!("failed to clear persisted merge stats state");
        }
        let merge_time = Utc::now()
            .signed_duration_since(window.started_at)
            .to_std()
            .unwrap_or_default();
        Ok(MergeStatsReport {
            outcome: self.outcome,
            merge_time,
            resume_count: window.resume_count,
            boot_complete_time_ms: self.boot_complete_time_ms,
            boot_complete_to_merge_start_time_ms: self.boot_complete_to_merge_start_time_ms,
            merge_failure_code: self.merge_failure_code,
            source_build_fingerprint: self.source_build_fingerprint,
            cow_file_size_bytes: self.cow_file_size_bytes,
            total_cow_size_bytes: self.total_cow_size_bytes,
            estimated_cow_size_bytes: self.estimated_cow_size_bytes,
            compression_enabled: self.compression_enabled,
            userspace_snapshots_used: self.userspace_snapshots_used,
            xor_compression_used: self.xor_compression_used,
            iouring_used: self.iouring_used,
        })
    }

    fn to_state(&self, window: &RecordingWindow) -> MergeStatsState {
        MergeStatsState {
            started_at: window.started_at,
            resume_count: window.resume_count,
            outcome: self.outcome,
            boot_complete_time_ms: self.boot_complete_time_ms,
            boot_complete_to_merge_start_time_ms: self.boot_complete_to_merge_start_time_ms,
            merge_failure_code: self.merge_failure_code,
            source_build_fingerprint: self.source_build_fingerprint.clone(),
            cow_file_size_bytes: self.cow_file_size_bytes,
            total_cow_size_bytes: self.total_cow_size_bytes,
            estimated_cow_size_bytes: self.estimated_cow_size_bytes,
            compression_enabled: self.compression_enabled,
            userspace_snapshots_used: self.userspace_snapshots_used,
            xor_compression_used: self.xor_compression_used,
            iouring_used: self.iouring_used,
        }
    }

    // ─── Accumulation ───

    pub fn set_outcome(&mut self, outcome: MergeOutcome) {
        self.outcome = outcome;
    }

    pub fn set_boot_complete_time_ms(&mut self, ms: i64) {
        self.boot_complete_time_ms = ms;
    }

    pub fn boot_complete_time_ms(&self) -> i64 {
        self.boot_complete_time_ms
    }

    pub fn set_boot_complete_to_merge_start_time_ms(&mut self, ms: i64) {
        self.boot_complete_to_merge_start_time_ms = ms;
    }

    pub fn set_merge_failure_code(&mut self, code: MergeFailureCode) {
        self.merge_failure_code = code;
    }

    pub fn set_source_build_fingerprint(&mut self, fingerprint: impl Into<String>) {
        self.source_build_fingerprint = fingerprint.into();
    }

    pub fn set_cow_file_size_bytes(&mut self, bytes: u64) {
        self.cow_file_size_bytes = bytes;
    }

    pub fn set_total_cow_size_bytes(&mut self, bytes: u64) {
        self.total_cow_size_bytes = bytes;
    }

    pub fn set_estimated_cow_size_bytes(&mut self, bytes: u64) {
        self.estimated_cow_size_bytes = bytes;
    }

    pub fn set_compression_enabled(&mut self, used: bool) {
        self.compression_enabled = used;
    }

    pub fn set_userspace_snapshots_used(&mut self, used: bool) {
        self.userspace_snapshots_used = used;
    }

    pub fn set_xor_compression_used(&mut self, used: bool) {
        self.xor_compression_used = used;
    }

    pub fn set_iouring_used(&mut self, used: bool) {
        self.iouring_used = used;
    }
}
