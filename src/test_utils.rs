//! Shared test doubles for the capability boundaries.
//!
//! Every collaborator the machine consumes has a scripted fake here. The
//! fakes share state through `Arc<Mutex<..>>` so a test can keep a handle
//! for assertions after the machine (or driver) has taken ownership of
//! its clone.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::capability::delegate::{CompletionSink, ProgressDelegate};
use crate::capability::slot::SlotControlCapability;
use crate::capability::snapshot::{PollObserver, SnapshotMergeCapability};
use crate::capability::store::ProgressStore;
use crate::capability::system::SystemState;
use crate::capability::telemetry::{MergeReportRecord, TelemetrySink};
use crate::machine::{MergeConfig, MergeStateMachine};
use crate::stats::{BootClock, MergeStatsRecorder};
use crate::types::{
    CompletionCode, CreateResult, MergeFailureCode, MergeOutcome, SlotId, VirtualAbFeatures,
};

/// The machine type every unit test drives.
pub type TestMachine = MergeStateMachine<FakeSnapshot, FakeBootControl, MemoryProgressStore>;

// ─── Snapshot-merge capability ───

/// Opaque mount handle used by the fake capability.
#[derive(Debug)]
pub struct FakeMount;

#[derive(Debug)]
pub struct FakeSnapshotState {
    pub merge_needed: bool,
    pub mount_ok: bool,
    pub recreate_result: CreateResult,
    /// Outcomes returned by successive polls; when exhausted, polls keep
    /// returning `current_state`.
    pub poll_outcomes: VecDeque<MergeOutcome>,
    /// State reported by `update_state` queries.
    pub current_state: MergeOutcome,
    /// When set, `update_state` reports this instead of the last poll's
    /// outcome (models state advancing between a poll and a re-query).
    pub override_state_after_poll: Option<MergeOutcome>,
    pub percentage: f64,
    pub failure_code: MergeFailureCode,
    pub cancel_ok: bool,
    pub initiate_ok: bool,
    pub source_fingerprint: String,
    pub cow_file_size_bytes: u64,
    pub total_cow_size_bytes: u64,
    pub estimated_cow_size_bytes: u64,
    pub compression_used: bool,
    pub userspace_snapshots_used: bool,
    pub xor_compression_used: bool,
    pub iouring_used: bool,
    pub poll_calls: u32,
    pub cancel_calls: u32,
    pub initiate_calls: u32,
    pub mount_calls: u32,
}

impl Default for FakeSnapshotState {
    fn default() -> Self {
        FakeSnapshotState {
            merge_needed: true,
            mount_ok: true,
            recreate_result: CreateResult::NotCreated,
            poll_outcomes: VecDeque::new(),
            current_state: MergeOutcome::None,
            override_state_after_poll: None,
            percentage: 0.0,
            failure_code: MergeFailureCode::OK,
            cancel_ok: true,
            initiate_ok: true,
            source_fingerprint: "fake/source:1".to_string(),
            cow_file_size_bytes: 0,
            total_cow_size_bytes: 0,
            estimated_cow_size_bytes: 0,
            compression_used: false,
            userspace_snapshots_used: false,
            xor_compression_used: false,
            iouring_used: false,
            poll_calls: 0,
            cancel_calls: 0,
            initiate_calls: 0,
            mount_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSnapshot {
    state: Arc<Mutex<FakeSnapshotState>>,
}

impl FakeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeSnapshotState> {
        self.state.lock().unwrap()
    }
}

impl SnapshotMergeCapability for FakeSnapshot {
    type Mount = FakeMount;

    fn is_merge_needed(&self) -> bool {
        self.lock().merge_needed
    }

    fn ensure_metadata_mounted(&self) -> Option<FakeMount> {
        let mut state = self.lock();
        state.mount_calls += 1;
        state.mount_ok.then_some(FakeMount)
    }

    fn recreate_snapshot_devices(&self, _mount: &FakeMount) -> CreateResult {
        self.lock().recreate_result
    }

    fn set_merge_stats_features(&self, stats: &mut MergeStatsRecorder) {
        let state = self.lock();
        stats.set_compression_enabled(state.compression_used);
        stats.set_userspace_snapshots_used(state.userspace_snapshots_used);
        stats.set_xor_compression_used(state.xor_compression_used);
        stats.set_iouring_used(state.iouring_used);
    }

    fn read_merge_failure_code(&self) -> MergeFailureCode {
        self.lock().failure_code
    }

    fn poll_merge_state(&self, observer: &mut dyn PollObserver) -> MergeOutcome {
        // The lock must not be held across observer callbacks: they call
        // back into this capability.
        let outcome = {
            let mut state = self.lock();
            state.poll_calls += 1;
            let outcome = state
                .poll_outcomes
                .pop_front()
                .unwrap_or(state.current_state);
            state.current_state = match state.override_state_after_poll {
                Some(overridden) => overridden,
                None => outcome,
            };
            outcome
        };
        match outcome {
            MergeOutcome::Merging => {
                observer.on_merge_percentage();
            }
            MergeOutcome::Cancelled => {
                observer.before_cancel();
            }
            _ => {}
        }
        outcome
    }

    fn update_state(&self) -> (MergeOutcome, f64) {
        let state = self.lock();
        (state.current_state, state.percentage)
    }

    fn cancel_update(&self) -> bool {
        let mut state = self.lock();
        state.cancel_calls += 1;
        state.cancel_ok
    }

    fn initiate_merge(&self) -> bool {
        let mut state = self.lock();
        state.initiate_calls += 1;
        state.initiate_ok
    }

    fn read_source_build_fingerprint(&self) -> String {
        self.lock().source_fingerprint.clone()
    }

    fn update_cow_stats(&self, stats: &mut MergeStatsRecorder) {
        let state = self.lock();
        stats.set_cow_file_size_bytes(state.cow_file_size_bytes);
        stats.set_total_cow_size_bytes(state.total_cow_size_bytes);
        stats.set_estimated_cow_size_bytes(state.estimated_cow_size_bytes);
    }
}

// ─── Slot control ───

#[derive(Debug)]
pub struct FakeBootControlState {
    pub virtual_ab_enabled: bool,
    pub current_slot: SlotId,
    /// Failed slot checks remaining before the mark reads as successful.
    pub not_successful_polls: u32,
    pub slot_successful: bool,
    pub unbootable: Vec<SlotId>,
    pub features: VirtualAbFeatures,
}

impl Default for FakeBootControlState {
    fn default() -> Self {
        FakeBootControlState {
            virtual_ab_enabled: true,
            current_slot: SlotId(0),
            not_successful_polls: 0,
            slot_successful: true,
            unbootable: Vec::new(),
            features: VirtualAbFeatures::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBootControl {
    state: Arc<Mutex<FakeBootControlState>>,
}

impl FakeBootControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeBootControlState> {
        self.state.lock().unwrap()
    }
}

impl SlotControlCapability for FakeBootControl {
    fn virtual_ab_enabled(&self) -> bool {
        self.lock().virtual_ab_enabled
    }

    fn current_slot(&self) -> SlotId {
        self.lock().current_slot
    }

    fn is_slot_marked_successful(&self, _slot: SlotId) -> bool {
        let mut state = self.lock();
        if state.not_successful_polls > 0 {
            state.not_successful_polls -= 1;
            return false;
        }
        state.slot_successful
    }

    fn mark_slot_unbootable(&self, slot: SlotId) {
        self.lock().unbootable.push(slot);
    }

    fn virtual_ab_features(&self) -> VirtualAbFeatures {
        self.lock().features
    }
}

// ─── Progress store ───

#[derive(Debug)]
pub struct MemoryProgressStoreState {
    pub values: HashMap<String, String>,
    pub reset_ok: bool,
    pub set_ok: bool,
    /// `(quick, skip_dynamic_partitions_metadata)` for each reset call.
    pub reset_calls: Vec<(bool, bool)>,
}

impl Default for MemoryProgressStoreState {
    fn default() -> Self {
        MemoryProgressStoreState {
            values: HashMap::new(),
            reset_ok: true,
            set_ok: true,
            reset_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    state: Arc<Mutex<MemoryProgressStoreState>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryProgressStoreState> {
        self.state.lock().unwrap()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn reset_update_progress(&self, quick: bool, skip_dynamic_partitions_metadata: bool) -> bool {
        let mut state = self.lock();
        state
            .reset_calls
            .push((quick, skip_dynamic_partitions_metadata));
        state.reset_ok
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> bool {
        let mut state = self.lock();
        if !state.set_ok {
            return false;
        }
        state.values.insert(key.to_string(), value.to_string());
        true
    }

    fn remove(&self, key: &str) -> bool {
        self.lock().values.remove(key);
        true
    }
}

// ─── System state ───

#[derive(Debug)]
pub struct FakeSystemState {
    /// Failed boot checks remaining before the signal reads true.
    pub boot_not_ready_polls: u32,
    pub boot_completed: bool,
    pub merge_delay_seconds: u64,
    pub dsu_image_running: bool,
    pub build_fingerprint: String,
    pub boot_checks: u32,
}

impl Default for FakeSystemState {
    fn default() -> Self {
        FakeSystemState {
            boot_not_ready_polls: 0,
            boot_completed: true,
            merge_delay_seconds: 0,
            dsu_image_running: false,
            build_fingerprint: "fake/target:1".to_string(),
            boot_checks: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSystem {
    state: Arc<Mutex<FakeSystemState>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeSystemState> {
        self.state.lock().unwrap()
    }
}

impl SystemState for FakeSystem {
    fn boot_completed(&self) -> bool {
        let mut state = self.lock();
        state.boot_checks += 1;
        if state.boot_not_ready_polls > 0 {
            state.boot_not_ready_polls -= 1;
            return false;
        }
        state.boot_completed
    }

    fn merge_delay_seconds(&self) -> u64 {
        self.lock().merge_delay_seconds
    }

    fn dsu_image_running(&self) -> bool {
        self.lock().dsu_image_running
    }

    fn build_fingerprint(&self) -> String {
        self.lock().build_fingerprint.clone()
    }
}

// ─── Clock, delegate, sinks ───

#[derive(Debug, Clone, Default)]
pub struct FakeBootClock {
    ms: Arc<Mutex<i64>>,
}

impl FakeBootClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: i64) {
        *self.ms.lock().unwrap() = ms;
    }

    pub fn advance(&self, ms: i64) {
        *self.ms.lock().unwrap() += ms;
    }
}

impl BootClock for FakeBootClock {
    fn now_ms(&self) -> i64 {
        *self.ms.lock().unwrap()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate {
    fractions: Arc<Mutex<Vec<f64>>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fractions(&self) -> Vec<f64> {
        self.fractions.lock().unwrap().clone()
    }
}

impl ProgressDelegate for RecordingDelegate {
    fn on_cleanup_progress(&self, fraction: f64) {
        self.fractions.lock().unwrap().push(fraction);
    }
}

/// Records completion codes; hand [`CompletionRecorder::probe`] to the
/// machine and keep the recorder for assertions.
#[derive(Debug, Clone, Default)]
pub struct CompletionRecorder {
    codes: Arc<Mutex<Vec<CompletionCode>>>,
}

impl CompletionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> CompletionProbe {
        CompletionProbe(self.codes.clone())
    }

    pub fn codes(&self) -> Vec<CompletionCode> {
        self.codes.lock().unwrap().clone()
    }

    /// The single recorded completion code.
    ///
    /// # Panics
    ///
    /// Panics unless exactly one completion was recorded.
    pub fn only(&self) -> CompletionCode {
        let codes = self.codes();
        assert_eq!(
            codes.len(),
            1,
            "expected exactly one completion, got {:?}",
            codes
        );
        codes[0]
    }
}

#[derive(Debug)]
pub struct CompletionProbe(Arc<Mutex<Vec<CompletionCode>>>);

impl CompletionSink for CompletionProbe {
    fn on_action_complete(self: Box<Self>, code: CompletionCode) {
        self.0.lock().unwrap().push(code);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    records: Arc<Mutex<Vec<MergeReportRecord>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MergeReportRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn report_merge(&self, record: &MergeReportRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

// ─── Harness ───

/// One shared-handle instance of every collaborator, plus a machine
/// builder wired to all of them.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    pub snapshot: FakeSnapshot,
    pub boot: FakeBootControl,
    pub store: MemoryProgressStore,
    pub system: FakeSystem,
    pub clock: FakeBootClock,
    pub delegate: RecordingDelegate,
    pub completion: CompletionRecorder,
    pub telemetry: RecordingTelemetry,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a machine over clones of this harness's collaborators.
    pub fn machine(&self, config: MergeConfig) -> TestMachine {
        MergeStateMachine::new(
            self.snapshot.clone(),
            self.boot.clone(),
            self.store.clone(),
            self.system.clone(),
            config,
        )
        .with_boot_clock(self.clock.clone())
        .with_delegate(self.delegate.clone())
        .with_telemetry(self.telemetry.clone())
        .with_completion_sink(self.completion.probe())
    }
}
