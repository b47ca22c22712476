//! Merge outcome and completion taxonomy.
//!
//! `MergeOutcome` is the state reported by the snapshot-merge capability on
//! every poll. It crosses a process boundary in real deployments, so the
//! decoded form keeps room for enumerators this build does not know about.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of the snapshot merge as reported by the merge capability.
///
/// Exactly one value is active at any poll. `Unrecognized` carries a raw
/// value that did not decode to a known state; dispatching on it is a
/// protocol-level defect, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "raw", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No update is in flight and no snapshots exist.
    None,
    /// An update has been started by the consumer side but not completed.
    Initiated,
    /// An update has been applied but the merge has not been attempted.
    Unverified,
    /// The merge is in progress.
    Merging,
    /// The merge cannot make progress until the device reboots.
    MergeNeedsReboot,
    /// The merge finished successfully.
    MergeCompleted,
    /// The merge failed; the device may be corrupted.
    MergeFailed,
    /// The update was cancelled and its snapshots discarded.
    Cancelled,
    /// A reserved or unknown enumerator arrived from the capability.
    Unrecognized(i32),
}

impl Default for MergeOutcome {
    fn default() -> Self {
        MergeOutcome::None
    }
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::None => write!(f, "None"),
            MergeOutcome::Initiated => write!(f, "Initiated"),
            MergeOutcome::Unverified => write!(f, "Unverified"),
            MergeOutcome::Merging => write!(f, "Merging"),
            MergeOutcome::MergeNeedsReboot => write!(f, "MergeNeedsReboot"),
            MergeOutcome::MergeCompleted => write!(f, "MergeCompleted"),
            MergeOutcome::MergeFailed => write!(f, "MergeFailed"),
            MergeOutcome::Cancelled => write!(f, "Cancelled"),
            MergeOutcome::Unrecognized(raw) => write!(f, "Unrecognized({})", raw),
        }
    }
}

/// Terminal result of one run of the cleanup action.
///
/// `DeviceCorrupted` is distinct from `Error`: it means the merge itself
/// failed, not that this action hit a fatal condition while driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCode {
    Success,
    Error,
    DeviceCorrupted,
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionCode::Success => write!(f, "success"),
            CompletionCode::Error => write!(f, "error"),
            CompletionCode::DeviceCorrupted => write!(f, "device corrupted"),
        }
    }
}

/// A merge failure code recorded by the merge capability.
///
/// The machine treats the code as opaque: it only distinguishes ok from
/// not-ok and forwards the raw value to stats and telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeFailureCode(pub i32);

impl MergeFailureCode {
    pub const OK: MergeFailureCode = MergeFailureCode(0);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for MergeFailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of recreating snapshot devices for an in-flight previous update
/// while booted into recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateResult {
    /// Snapshot devices exist and were (re)created.
    Created,
    /// There was no pending update, so no devices were needed.
    NotCreated,
    /// Device creation failed.
    Error,
}
