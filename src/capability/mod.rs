//! Capability boundaries consumed by the cleanup action.
//!
//! The action owns none of the heavy machinery: the merge itself, slot
//! marking, preference storage, system signals, and telemetry transport
//! all live behind the traits in this module. The trait seams are what
//! make the state machine testable: every collaborator has a scripted
//! fake in `test_utils`.
//!
//! # Module Structure
//!
//! - [`snapshot`]: the merge capability and its synchronous poll hooks
//! - [`slot`]: boot-control / slot-marking operations
//! - [`store`]: persisted key-value progress storage
//! - [`system`]: live host signals (boot readiness, configured delay)
//! - [`delegate`]: progress delegate and the consuming completion sink
//! - [`telemetry`]: structured merge-report emission

pub mod delegate;
pub mod slot;
pub mod snapshot;
pub mod store;
pub mod system;
pub mod telemetry;

pub use delegate::{CompletionSink, ProgressDelegate};
pub use slot::SlotControlCapability;
pub use snapshot::{PollObserver, SnapshotMergeCapability};
pub use store::{
    ProgressStore, DYNAMIC_PARTITION_METADATA_UPDATED_KEY, MERGE_STATS_STATE_KEY,
};
pub use system::SystemState;
pub use telemetry::{MergeReportRecord, TelemetrySink};
