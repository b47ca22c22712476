//! Telemetry sink boundary and the structured merge report record.

use serde::Serialize;

use crate::types::{MergeFailureCode, MergeOutcome};

/// One structured record describing a finished merge, emitted at most once
/// per run.
///
/// Enabled flags describe device provisioning and are queried at report
/// time; used flags describe what the finished merge actually did and come
/// from the finalized stats report, because they can no longer be queried
/// once the snapshots are gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReportRecord {
    pub outcome: MergeOutcome,
    pub merge_time_ms: i64,
    pub resume_count: u32,
    pub vab_retrofit: bool,
    pub cow_file_size_bytes: u64,
    pub compression_enabled: bool,
    pub compression_used: bool,
    pub total_cow_size_bytes: u64,
    pub estimated_cow_size_bytes: u64,
    pub boot_complete_time_ms: i64,
    pub boot_complete_to_merge_start_time_ms: i64,
    pub merge_failure_code: MergeFailureCode,
    pub source_build_fingerprint: String,
    pub target_build_fingerprint: String,
    pub userspace_snapshots_enabled: bool,
    pub userspace_snapshots_used: bool,
    pub xor_compression_enabled: bool,
    pub xor_compression_used: bool,
    pub iouring_used: bool,
}

/// Fire-and-forget structured telemetry emission.
///
/// Transport and encoding belong to the host; implementations must not
/// block the caller.
pub trait TelemetrySink {
    fn report_merge(&self, record: &MergeReportRecord);
}
