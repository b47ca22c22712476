//! The snapshot-merge cleanup state machine.
//!
//! Drives a background snapshot merge to completion by polling the merge
//! capability until it reaches a terminal state, gating on boot readiness
//! and slot validation first, and honoring an administrator-configured
//! merge delay.
//!
//! # Lifecycle
//!
//! `start()` and `resume()` funnel into the same internal start routine:
//! the machine is stateless across suspensions and reconstructs its stage
//! from collaborator queries every time. `suspend()` and `stop()` clear
//! the running flag and disarm the pending task; a callback that still
//! fires afterwards no-ops on the running check.
//!
//! # Scheduling Discipline
//!
//! At most one delayed task is ever armed. Every firing acknowledges
//! (consumes) the armed entry before doing any work, so a concurrent
//! suspend never cancels an already-fired entry whose identifier might
//! have been reused.

use std::fmt;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::capability::delegate::{CompletionSink, ProgressDelegate};
use crate::capability::slot::SlotControlCapability;
use crate::capability::snapshot::{PollObserver, SnapshotMergeCapability};
use crate::capability::store::{ProgressStore, DYNAMIC_PARTITION_METADATA_UPDATED_KEY};
use crate::capability::system::SystemState;
use crate::capability::telemetry::{MergeReportRecord, TelemetrySink};
use crate::stats::{BootClock, MergeStatsRecorder, SystemBootClock};
use crate::types::{CompletionCode, CreateResult, MergeOutcome, SlotId};

use super::config::{self, MergeConfig};
use super::task::{ScheduledTask, Step, TaskId};

/// The stage the machine is currently in.
///
/// Stored as a tagged variant rather than a set of booleans so that
/// illegal combinations ("running but no stage") are unrepresentable.
/// Never persisted: a resumed machine starts over from the boot gate and
/// rediscovers where the merge actually is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    WaitingBootCompleted,
    WaitingSlotMarkedSuccessful,
    CheckingMergeDelay,
    ResumingMerge,
    InitiatingMerge,
    WaitingForMerge,
    Terminal(CompletionCode),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::WaitingBootCompleted => write!(f, "WaitingBootCompleted"),
            RunState::WaitingSlotMarkedSuccessful => write!(f, "WaitingSlotMarkedSuccessful"),
            RunState::CheckingMergeDelay => write!(f, "CheckingMergeDelay"),
            RunState::ResumingMerge => write!(f, "ResumingMerge"),
            RunState::InitiatingMerge => write!(f, "InitiatingMerge"),
            RunState::WaitingForMerge => write!(f, "WaitingForMerge"),
            RunState::Terminal(code) => write!(f, "Terminal({})", code),
        }
    }
}

/// State machine driving the snapshot-merge cleanup of a previous update.
pub struct MergeStateMachine<S, B, P>
where
    S: SnapshotMergeCapability,
    B: SlotControlCapability,
    P: ProgressStore,
{
    snapshot: S,
    boot_control: B,
    prefs: P,
    system: Box<dyn SystemState + Send>,
    config: MergeConfig,
    boot_clock: Box<dyn BootClock + Send>,
    delegate: Option<Box<dyn ProgressDelegate + Send>>,
    telemetry: Option<Box<dyn TelemetrySink + Send>>,
    completion: Option<Box<dyn CompletionSink + Send>>,

    task: ScheduledTask,
    run_state: RunState,
    running: bool,
    cancel_failed: bool,
    last_percentage: u32,
    metadata_mount: Option<S::Mount>,
    stats: Option<MergeStatsRecorder>,
}

impl<S, B, P> MergeStateMachine<S, B, P>
where
    S: SnapshotMergeCapability,
    B: SlotControlCapability,
    P: ProgressStore,
{
    /// Creates a machine over its required collaborators.
    ///
    /// The merge capability is a required argument, so the "capability must
    /// be present on a Virtual A/B device" precondition holds by
    /// construction.
    pub fn new(
        snapshot: S,
        boot_control: B,
        prefs: P,
        system: impl SystemState + Send + 'static,
        config: MergeConfig,
    ) -> Self {
        MergeStateMachine {
            snapshot,
            boot_control,
            prefs,
            system: Box::new(system),
            config,
            boot_clock: Box::new(SystemBootClock),
            delegate: None,
            telemetry: None,
            completion: None,
            task: ScheduledTask::new(),
            run_state: RunState::Idle,
            running: false,
            cancel_failed: false,
            last_percentage: 0,
            metadata_mount: None,
            stats: None,
        }
    }

    /// Sets the progress delegate.
    pub fn with_delegate(mut self, delegate: impl ProgressDelegate + Send + 'static) -> Self {
        self.delegate = Some(Box::new(delegate));
        self
    }

    /// Sets the telemetry sink.
    pub fn with_telemetry(mut self, sink: impl TelemetrySink + Send + 'static) -> Self {
        self.telemetry = Some(Box::new(sink));
        self
    }

    /// Sets the completion sink, notified exactly once per run.
    pub fn with_completion_sink(mut self, sink: impl CompletionSink + Send + 'static) -> Self {
        self.completion = Some(Box::new(sink));
        self
    }

    /// Overrides the boot clock (tests).
    pub fn with_boot_clock(mut self, clock: impl BootClock + Send + 'static) -> Self {
        self.boot_clock = Box::new(clock);
        self
    }

    // ─── Lifecycle ───

    /// Starts the machine.
    pub fn start(&mut self) {
        self.start_internal();
    }

    /// Resumes after a suspension; identical to `start`.
    pub fn resume(&mut self) {
        self.start_internal();
    }

    /// Suspends the machine, disarming any pending task.
    pub fn suspend(&mut self) {
        self.stop_internal();
    }

    /// Stops the machine, disarming any pending task.
    pub fn stop(&mut self) {
        self.stop_internal();
    }

    /// Current stage.
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Whether the machine is actively scheduled or polling.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Terminal completion code, once the run has finished.
    pub fn completion_code(&self) -> Option<CompletionCode> {
        match self.run_state {
            RunState::Terminal(code) => Some(code),
            _ => None,
        }
    }

    /// The armed task, if any, for deadline computation by the driver.
    pub fn scheduled(&self) -> Option<(TaskId, Step, std::time::Duration)> {
        self.task.armed()
    }

    /// Fires the armed task.
    ///
    /// The entry is acknowledged (consumed) before anything else happens,
    /// and the step is dropped when the machine was stopped after arming.
    #[instrument(skip(self), fields(state = %self.run_state))]
    pub fn fire_scheduled(&mut self) {
        let Some((id, step)) = self.task.acknowledge() else {
            trace!("no armed task to fire");
            return;
        };
        if !self.running {
            debug!(task_id = %id, step = %step, "machine stopped; dropping fired task");
            return;
        }
        match step {
            Step::WaitBootCompleted => self.wait_boot_completed_or_schedule(),
            Step::CheckSlotMarkedSuccessful => self.check_slot_marked_successful_or_schedule(),
            Step::StartMerge => self.start_merge(),
            Step::WaitForMerge => self.wait_for_merge_or_schedule(),
        }
    }

    fn start_internal(&mut self) {
        if let RunState::Terminal(code) = self.run_state {
            warn!(code = %code, "start requested after completion; ignoring");
            return;
        }
        info!("starting snapshot-merge cleanup");
        self.running = true;
        // Nothing to do on a non-Virtual-A/B device.
        if !self.boot_control.virtual_ab_enabled() {
            debug!("virtual A/B is not enabled");
            self.complete(CompletionCode::Success);
            return;
        }
        if self.stats.is_none() {
            self.stats = Some(MergeStatsRecorder::new());
        }
        self.run_state = RunState::WaitingBootCompleted;
        self.wait_boot_completed_or_schedule();
    }

    fn stop_internal(&mut self) {
        if !self.running && !self.task.is_scheduled() {
            return;
        }
        info!("stopping/suspending snapshot-merge cleanup");
        self.running = false;
        if let Some(id) = self.task.cancel() {
            info!(task_id = %id, "cancelled pending task");
        }
    }

    /// Terminal transition: exactly once per run.
    fn complete(&mut self, code: CompletionCode) {
        self.stop_internal();
        self.report_merge_stats();
        self.metadata_mount = None;
        self.run_state = RunState::Terminal(code);
        info!(code = %code, "snapshot-merge cleanup finished");
        match self.completion.take() {
            Some(sink) => sink.on_action_complete(code),
            None => debug!("no completion sink attached"),
        }
    }

    // ─── Boot-readiness gate ───

    fn wait_boot_completed_or_schedule(&mut self) {
        if !self.running {
            return;
        }
        // Boot-completed has no meaning in recovery.
        if !self.config.is_recovery && !self.system.boot_completed() {
            let id = self
                .task
                .schedule(Step::WaitBootCompleted, self.config.boot_completed_interval);
            trace!(task_id = %id, "boot not completed; rescheduled");
            return;
        }

        let boot_ms = self.boot_clock.now_ms();
        if let Some(stats) = self.stats.as_mut() {
            stats.set_boot_complete_time_ms(boot_ms);
        }
        info!(boot_time_ms = boot_ms, "boot completed, waiting for the slot to be marked successful");
        self.run_state = RunState::WaitingSlotMarkedSuccessful;
        self.check_slot_marked_successful_or_schedule();
    }

    // ─── Slot-validation gate ───

    fn check_slot_marked_successful_or_schedule(&mut self) {
        if !self.running {
            return;
        }
        if !self.config.is_recovery {
            let slot = self.boot_control.current_slot();
            if !self.boot_control.is_slot_marked_successful(slot) {
                let id = self.task.schedule(
                    Step::CheckSlotMarkedSuccessful,
                    self.config.slot_check_interval,
                );
                trace!(task_id = %id, slot = %slot, "slot not yet marked successful; rescheduled");
                return;
            }
        }
        self.check_for_merge_delay();
    }

    // ─── Merge-delay check ───

    fn check_for_merge_delay(&mut self) {
        self.run_state = RunState::CheckingMergeDelay;
        if !self.snapshot.is_merge_needed() {
            self.start_merge();
            return;
        }
        let delay = config::clamp_merge_delay(self.system.merge_delay_seconds());
        if !delay.is_zero() {
            info!(
                delay_secs = delay.as_secs(),
                "merge is ready to start, but a merge delay is configured"
            );
        }
        // Uniform scheduling path even at zero delay.
        let id = self.task.schedule(Step::StartMerge, delay);
        debug!(task_id = %id, "scheduled merge initiation");
    }

    // ─── Merge initiation ───

    fn start_merge(&mut self) {
        if !self.running {
            return;
        }
        self.run_state = RunState::ResumingMerge;

        if self.metadata_mount.is_none() {
            self.metadata_mount = self.snapshot.ensure_metadata_mounted();
        }
        let Some(mount) = self.metadata_mount.as_ref() else {
            error!("failed to mount the metadata partition");
            // Metadata that was erased but never formatted cannot be
            // mounted in recovery; there is nothing to clean up there.
            let code = if self.config.is_recovery {
                CompletionCode::Success
            } else {
                CompletionCode::Error
            };
            self.complete(code);
            return;
        };

        if self.config.is_recovery {
            match self.snapshot.recreate_snapshot_devices(mount) {
                CreateResult::Created => {
                    // An unfinished previous update left snapshots behind;
                    // their devices now exist again so polling can proceed.
                    info!("snapshot devices are created");
                }
                CreateResult::NotCreated => {
                    info!("no snapshot devices were needed");
                }
                CreateResult::Error => {
                    error!("failed to create snapshot devices");
                    self.complete(CompletionCode::Error);
                    return;
                }
            }
        }

        if let Some(stats) = self.stats.as_mut() {
            if let Err(err) = stats.start(&self.prefs) {
                // The action may be paused and resumed while the kernel
                // keeps merging snapshots in the background.
                warn!(error = %err, "failed to start the merge stats recorder");
            }
        }

        info!("waiting for any previous merge request to complete; this can take several minutes");
        self.run_state = RunState::WaitingForMerge;
        self.wait_for_merge_or_schedule();
    }

    // ─── Merge-wait loop ───

    fn wait_for_merge_or_schedule(&mut self) {
        if !self.running {
            return;
        }

        if let Some(stats) = self.stats.as_mut() {
            self.snapshot.set_merge_stats_features(stats);

            // Stash any previously recorded failure code before polling: a
            // later successful merge must not overwrite the signal of a
            // real earlier failure.
            let failure_code = self.snapshot.read_merge_failure_code();
            if !failure_code.is_ok() {
                stats.set_merge_failure_code(failure_code);
            }
        }

        let outcome = {
            let mut observer = MachinePollObserver {
                snapshot: &self.snapshot,
                prefs: &self.prefs,
                delegate: self.delegate.as_deref(),
                last_percentage: &mut self.last_percentage,
                cancel_failed: &mut self.cancel_failed,
            };
            self.snapshot.poll_merge_state(&mut observer)
        };
        if let Some(stats) = self.stats.as_mut() {
            stats.set_outcome(outcome);
        }

        match outcome {
            MergeOutcome::None => {
                info!("no snapshot to merge");
                let code = if self.snapshot.cancel_update() {
                    CompletionCode::Success
                } else {
                    warn!("failed to cancel the update record");
                    CompletionCode::Error
                };
                self.complete(code);
            }

            MergeOutcome::Initiated => {
                error!("previous update has not been completed, not cleaning up");
                self.complete(CompletionCode::Success);
            }

            MergeOutcome::Unverified => {
                self.initiate_merge_and_wait();
            }

            MergeOutcome::Merging => {
                let id = self
                    .task
                    .schedule(Step::WaitForMerge, self.config.merge_poll_interval);
                trace!(task_id = %id, "merge in progress; rescheduled");
            }

            MergeOutcome::MergeNeedsReboot => {
                error!("a reboot is required to finish merging");
                self.complete(CompletionCode::Error);
            }

            MergeOutcome::MergeCompleted => {
                info!("merge finished");
                // The old slot's rollback image is gone with the snapshots.
                let other = self.boot_control.current_slot().other();
                self.mark_slot_unbootable(other);
                self.complete(CompletionCode::Success);
            }

            MergeOutcome::MergeFailed => {
                error!("merge failed; the device may be corrupted");
                let failure_code = self.snapshot.read_merge_failure_code();
                if let Some(stats) = self.stats.as_mut() {
                    stats.set_merge_failure_code(failure_code);
                }
                self.complete(CompletionCode::DeviceCorrupted);
            }

            MergeOutcome::Cancelled => {
                // If pre-cancellation recovery failed, the snapshots were
                // kept to avoid inconsistency; nothing more can be done
                // until the next run.
                let code = if self.cancel_failed {
                    CompletionCode::Error
                } else {
                    CompletionCode::Success
                };
                self.complete(code);
            }

            MergeOutcome::Unrecognized(raw) => {
                panic!("snapshot-merge capability returned unrecognized update state {raw}");
            }
        }
    }

    fn mark_slot_unbootable(&mut self, slot: SlotId) {
        info!(slot = %slot, "marking the old slot unbootable");
        self.boot_control.mark_slot_unbootable(slot);
    }

    // ─── Merge initiation-and-wait ───

    fn initiate_merge_and_wait(&mut self) {
        if !self.running {
            return;
        }
        info!("attempting to initiate merge");
        if self.system.dsu_image_running() {
            warn!("a dynamic-system-update image is running; refusing to merge under it");
            self.complete(CompletionCode::Error);
            return;
        }
        self.run_state = RunState::InitiatingMerge;

        if let Some(stats) = self.stats.as_mut() {
            self.snapshot.update_cow_stats(stats);

            let merge_start_ms = self.boot_clock.now_ms();
            stats.set_boot_complete_to_merge_start_time_ms(
                merge_start_ms - stats.boot_complete_time_ms(),
            );
            stats.set_source_build_fingerprint(self.snapshot.read_source_build_fingerprint());

            if let Err(err) = stats.write_state(&self.prefs) {
                error!(
                    error = %err,
                    "failed to persist merge stats; the record may be unreliable if the merge is interrupted"
                );
            }
        }

        if self.snapshot.initiate_merge() {
            self.run_state = RunState::WaitingForMerge;
            self.wait_for_merge_or_schedule();
            return;
        }

        warn!("merge initiation failed");
        let (state, _) = self.snapshot.update_state();
        if let Some(stats) = self.stats.as_mut() {
            stats.set_outcome(state);
        }
        if state == MergeOutcome::Unverified {
            // The update was applied but a merge was never attempted; this
            // happens when the engine restarts before the device reboots.
            warn!("merge initiation left the update at Unverified; did the engine restart?");
            self.complete(CompletionCode::Success);
            return;
        }

        // The state advanced despite the reported failure; a merge may
        // have been triggered manually in between. Go back to waiting.
        warn!(state = %state, "merge initiation failed but the update state advanced; waiting for merge");
        self.run_state = RunState::WaitingForMerge;
        self.wait_for_merge_or_schedule();
    }

    // ─── Stats reporting ───

    /// Finalizes the recorder and emits the structured merge report.
    ///
    /// Runs exactly once, from the terminal transition. Every early return
    /// below degrades telemetry only; the run's completion code is already
    /// decided.
    fn report_merge_stats(&mut self) {
        let Some(recorder) = self.stats.take() else {
            return;
        };
        let report = match recorder.finish(&self.prefs) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "not reporting merge stats; finalization failed");
                return;
            }
        };

        if self.config.is_recovery {
            info!("skipping merge stats report in recovery");
            return;
        }
        let sink = match (self.config.telemetry_enabled, self.telemetry.as_deref()) {
            (true, Some(sink)) => sink,
            _ => {
                info!("skipping merge stats report; telemetry is disabled");
                return;
            }
        };
        match report.outcome {
            MergeOutcome::None | MergeOutcome::Initiated | MergeOutcome::Unverified => {
                info!(outcome = %report.outcome, "not reporting merge stats; nothing was merged");
                return;
            }
            _ => {}
        }

        let features = self.boot_control.virtual_ab_features();
        let merge_time_ms = report.merge_time.as_millis() as i64;
        info!(
            outcome = %report.outcome,
            merge_time_ms,
            resume_count = report.resume_count,
            cow_file_size_bytes = report.cow_file_size_bytes,
            "reporting merge stats"
        );
        let record = MergeReportRecord {
            outcome: report.outcome,
            merge_time_ms,
            resume_count: report.resume_count,
            vab_retrofit: features.retrofit,
            cow_file_size_bytes: report.cow_file_size_bytes,
            compression_enabled: features.compression,
            // The snapshots are gone, so per-update usage can no longer be
            // queried; it comes from the finalized report instead.
            compression_used: report.compression_enabled,
            total_cow_size_bytes: report.total_cow_size_bytes,
            estimated_cow_size_bytes: report.estimated_cow_size_bytes,
            boot_complete_time_ms: report.boot_complete_time_ms,
            boot_complete_to_merge_start_time_ms: report.boot_complete_to_merge_start_time_ms,
            merge_failure_code: report.merge_failure_code,
            source_build_fingerprint: report.source_build_fingerprint.clone(),
            target_build_fingerprint: self.system.build_fingerprint(),
            userspace_snapshots_enabled: features.userspace_snapshots,
            userspace_snapshots_used: report.userspace_snapshots_used,
            xor_compression_enabled: features.xor_compression,
            xor_compression_used: report.xor_compression_used,
            iouring_used: report.iouring_used,
        };
        sink.report_merge(&record);
    }
}

/// Short-lived observer passed into the polling primitive.
///
/// Borrows disjoint machine fields instead of capturing the machine, so
/// the capability can hold the observer while the machine's receiver
/// borrow is still alive.
struct MachinePollObserver<'a, S, P> {
    snapshot: &'a S,
    prefs: &'a P,
    delegate: Option<&'a (dyn ProgressDelegate + Send)>,
    last_percentage: &'a mut u32,
    cancel_failed: &'a mut bool,
}

impl<S, P> PollObserver for MachinePollObserver<'_, S, P>
where
    S: SnapshotMergeCapability,
    P: ProgressStore,
{
    fn on_merge_percentage(&mut self) -> bool {
        let (_, percentage) = self.snapshot.update_state();
        if let Some(delegate) = self.delegate {
            // The capability reports [0, 100]; delegates take [0, 1].
            delegate.on_cleanup_progress(percentage / 100.0);
        }

        // Log only on whole-percent increases.
        let whole = percentage as u32;
        if *self.last_percentage < whole {
            *self.last_percentage = whole;
            info!(percent = whole, "waiting for merge to complete");
        }

        // Let the poll return `Merging` so rescheduling happens on the
        // event loop instead of blocking inside this call.
        false
    }

    fn before_cancel(&mut self) -> bool {
        if self.prefs.reset_update_progress(false, false) {
            return true;
        }

        // Resetting may not work on stub stores; check the marker before
        // concluding anything.
        warn!("update state is about to become Cancelled but resetting update progress failed");
        let marker = self
            .prefs
            .get_string(DYNAMIC_PARTITION_METADATA_UPDATED_KEY)
            .unwrap_or_default();
        if marker.is_empty() {
            info!("dynamic-partition metadata marker is empty, assuming cleanup already finished");
            return true;
        }
        warn!(
            marker = %marker,
            "dynamic-partition metadata marker is set; not deleting snapshots"
        );
        *self.cancel_failed = true;
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::Harness;
    use crate::types::MergeFailureCode;

    fn started(harness: &Harness, config: MergeConfig) -> crate::test_utils::TestMachine {
        let mut machine = harness.machine(config);
        machine.start();
        machine
    }

    /// Drives a freshly started machine through the zero-delay
    /// `StartMerge` task into the merge-wait loop.
    fn run_to_poll(harness: &Harness) -> crate::test_utils::TestMachine {
        let mut machine = started(harness, MergeConfig::new());
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
        machine.fire_scheduled();
        machine
    }

    // ─── Lifecycle ───

    #[test]
    fn virtual_ab_disabled_completes_immediately_without_scheduling() {
        let harness = Harness::new();
        harness.boot.lock().virtual_ab_enabled = false;

        let machine = started(&harness, MergeConfig::new());

        assert_eq!(harness.completion.only(), CompletionCode::Success);
        assert!(machine.scheduled().is_none());
        assert_eq!(harness.snapshot.lock().poll_calls, 0);
    }

    #[test]
    fn completion_sink_is_notified_exactly_once() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeCompleted);

        run_to_poll(&harness);

        assert_eq!(harness.completion.codes().len(), 1);
    }

    #[test]
    fn suspend_is_idempotent() {
        let harness = Harness::new();
        harness.system.lock().boot_not_ready_polls = u32::MAX;

        let mut machine = started(&harness, MergeConfig::new());
        assert!(machine.scheduled().is_some());

        machine.suspend();
        assert!(!machine.is_running());
        assert!(machine.scheduled().is_none());

        // Second suspension has no observable effect.
        machine.suspend();
        assert!(!machine.is_running());
        assert!(harness.completion.codes().is_empty());
    }

    #[test]
    fn fired_task_noops_after_suspend() {
        let harness = Harness::new();
        harness.system.lock().boot_not_ready_polls = u32::MAX;

        let mut machine = started(&harness, MergeConfig::new());
        machine.suspend();

        // A stale firing after suspension must do nothing.
        machine.fire_scheduled();
        assert!(machine.scheduled().is_none());
        assert!(harness.completion.codes().is_empty());
    }

    #[test]
    fn resume_restarts_from_the_boot_gate() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Merging);

        let mut machine = run_to_poll(&harness);
        assert_eq!(machine.run_state(), RunState::WaitingForMerge);

        machine.suspend();
        machine.resume();

        // Stateless resume: the gates run again from the top.
        assert!(machine.is_running());
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
    }

    #[test]
    fn start_after_completion_is_ignored() {
        let harness = Harness::new();
        harness.boot.lock().virtual_ab_enabled = false;

        let mut machine = started(&harness, MergeConfig::new());
        assert_eq!(harness.completion.codes().len(), 1);

        machine.start();
        assert!(!machine.is_running());
        assert_eq!(harness.completion.codes().len(), 1);
    }

    // ─── Gates ───

    #[test]
    fn boot_gate_reschedules_until_boot_completed() {
        let harness = Harness::new();
        harness.system.lock().boot_not_ready_polls = 3;

        let mut machine = started(&harness, MergeConfig::new());
        let (_, step, delay) = machine.scheduled().unwrap();
        assert_eq!(step, Step::WaitBootCompleted);
        assert_eq!(delay, Duration::from_secs(2));

        // Two more failed checks keep rescheduling the same step.
        machine.fire_scheduled();
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::WaitBootCompleted)
        );
        machine.fire_scheduled();
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::WaitBootCompleted)
        );

        // Fourth check succeeds and advances past both gates.
        machine.fire_scheduled();
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
    }

    #[test]
    fn slot_gate_reschedules_until_slot_marked_successful() {
        let harness = Harness::new();
        harness.boot.lock().not_successful_polls = 2;

        let mut machine = started(&harness, MergeConfig::new());
        let (_, step, delay) = machine.scheduled().unwrap();
        assert_eq!(step, Step::CheckSlotMarkedSuccessful);
        assert_eq!(delay, Duration::from_secs(2));

        machine.fire_scheduled();
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::CheckSlotMarkedSuccessful)
        );

        machine.fire_scheduled();
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
    }

    #[test]
    fn recovery_skips_both_gates() {
        let harness = Harness::new();
        harness.system.lock().boot_not_ready_polls = u32::MAX;
        harness.boot.lock().not_successful_polls = u32::MAX;
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::None);

        let mut machine = started(&harness, MergeConfig::new().with_recovery(true));
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
        machine.fire_scheduled();

        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    // ─── Merge delay ───

    #[test]
    fn configured_delay_is_applied_to_merge_initiation() {
        let harness = Harness::new();
        harness.system.lock().merge_delay_seconds = 30;

        let machine = started(&harness, MergeConfig::new());
        let (_, step, delay) = machine.scheduled().unwrap();
        assert_eq!(step, Step::StartMerge);
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn oversized_delay_is_clamped() {
        let harness = Harness::new();
        harness.system.lock().merge_delay_seconds = 86_400;

        let machine = started(&harness, MergeConfig::new());
        let (_, _, delay) = machine.scheduled().unwrap();
        assert_eq!(delay, Duration::from_secs(600));
    }

    #[test]
    fn merge_not_needed_skips_the_delay_entirely() {
        let harness = Harness::new();
        harness.snapshot.lock().merge_needed = false;
        harness.system.lock().merge_delay_seconds = 600;
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::None);

        started(&harness, MergeConfig::new());

        // The poll happened without any StartMerge task being armed.
        assert_eq!(harness.snapshot.lock().poll_calls, 1);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    // ─── Outcome dispatch ───

    #[test]
    fn outcome_none_cancels_update_and_succeeds() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::None);

        run_to_poll(&harness);

        assert_eq!(harness.snapshot.lock().cancel_calls, 1);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn outcome_none_with_failed_cancel_errors() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::None);
            snapshot.cancel_ok = false;
        }

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Error);
    }

    #[test]
    fn outcome_initiated_succeeds_without_cleanup() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Initiated);

        run_to_poll(&harness);

        assert_eq!(harness.snapshot.lock().cancel_calls, 0);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn outcome_merging_reschedules_without_completing() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Merging);

        let machine = run_to_poll(&harness);

        let (_, step, delay) = machine.scheduled().unwrap();
        assert_eq!(step, Step::WaitForMerge);
        assert_eq!(delay, Duration::from_secs(2));
        assert!(harness.completion.codes().is_empty());
    }

    #[test]
    fn outcome_merge_needs_reboot_errors() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeNeedsReboot);

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Error);
    }

    #[test]
    fn outcome_merge_completed_marks_other_slot_unbootable() {
        let harness = Harness::new();
        harness.boot.lock().current_slot = SlotId(0);
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeCompleted);

        run_to_poll(&harness);

        assert_eq!(harness.boot.lock().unbootable, vec![SlotId(1)]);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn outcome_merge_failed_reports_device_corrupted() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::MergeFailed);
            snapshot.failure_code = MergeFailureCode(12);
        }

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::DeviceCorrupted);
        let records = harness.telemetry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merge_failure_code, MergeFailureCode(12));
    }

    #[test]
    #[should_panic(expected = "unrecognized update state")]
    fn unrecognized_outcome_aborts() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Unrecognized(95));

        run_to_poll(&harness);
    }

    // ─── Cancellation recovery ───

    #[test]
    fn cancelled_with_successful_reset_succeeds() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Cancelled);

        run_to_poll(&harness);

        assert_eq!(harness.store.lock().reset_calls, vec![(false, false)]);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn cancelled_with_failed_reset_and_empty_marker_succeeds() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Cancelled);
        harness.store.lock().reset_ok = false;

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn cancelled_with_failed_reset_and_set_marker_errors() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Cancelled);
        {
            let mut store = harness.store.lock();
            store.reset_ok = false;
            store
                .values
                .insert(DYNAMIC_PARTITION_METADATA_UPDATED_KEY.to_string(), "1".to_string());
        }

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Error);
    }

    // ─── Merge initiation-and-wait ───

    #[test]
    fn unverified_initiates_merge_and_keeps_waiting() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Unverified);
            snapshot.poll_outcomes.push_back(MergeOutcome::Merging);
        }

        let machine = run_to_poll(&harness);

        assert_eq!(harness.snapshot.lock().initiate_calls, 1);
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::WaitForMerge)
        );
        assert!(harness.completion.codes().is_empty());
    }

    #[test]
    fn dsu_image_refuses_merge() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Unverified);
        harness.system.lock().dsu_image_running = true;

        run_to_poll(&harness);

        assert_eq!(harness.snapshot.lock().initiate_calls, 0);
        assert_eq!(harness.completion.only(), CompletionCode::Error);
    }

    #[test]
    fn failed_initiation_still_unverified_is_benign() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Unverified);
            snapshot.initiate_ok = false;
            snapshot.current_state = MergeOutcome::Unverified;
        }

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn failed_initiation_with_advanced_state_keeps_waiting() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            // Poll sees Unverified; initiation fails, but by the time the
            // state is re-read a manually triggered merge has advanced it.
            snapshot.poll_outcomes.push_back(MergeOutcome::Unverified);
            snapshot.poll_outcomes.push_back(MergeOutcome::MergeCompleted);
            snapshot.initiate_ok = false;
            snapshot.override_state_after_poll = Some(MergeOutcome::Merging);
        }

        run_to_poll(&harness);

        // The second poll saw MergeCompleted.
        assert_eq!(harness.snapshot.lock().poll_calls, 2);
        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    // ─── Metadata mount ───

    #[test]
    fn mount_failure_is_fatal_outside_recovery() {
        let harness = Harness::new();
        harness.snapshot.lock().mount_ok = false;

        run_to_poll(&harness);

        assert_eq!(harness.completion.only(), CompletionCode::Error);
    }

    #[test]
    fn mount_failure_is_benign_in_recovery() {
        let harness = Harness::new();
        harness.snapshot.lock().mount_ok = false;

        let mut machine = started(&harness, MergeConfig::new().with_recovery(true));
        machine.fire_scheduled();

        assert_eq!(harness.completion.only(), CompletionCode::Success);
    }

    #[test]
    fn mount_is_acquired_once_and_cached() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Merging);
            snapshot.poll_outcomes.push_back(MergeOutcome::Merging);
        }

        let mut machine = run_to_poll(&harness);
        machine.suspend();
        machine.resume();
        machine.fire_scheduled();

        assert_eq!(harness.snapshot.lock().mount_calls, 1);
    }

    #[test]
    fn recovery_recreate_error_is_fatal() {
        let harness = Harness::new();
        harness.snapshot.lock().recreate_result = CreateResult::Error;

        let mut machine = started(&harness, MergeConfig::new().with_recovery(true));
        machine.fire_scheduled();

        assert_eq!(harness.completion.only(), CompletionCode::Error);
        assert_eq!(harness.snapshot.lock().poll_calls, 0);
    }

    // ─── Progress delegate ───

    #[test]
    fn progress_is_rescaled_for_the_delegate() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Merging);
            snapshot.percentage = 37.5;
        }

        run_to_poll(&harness);

        assert_eq!(harness.delegate.fractions(), vec![0.375]);
    }

    #[test]
    fn logged_percentage_never_decreases() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.extend([
                MergeOutcome::Merging,
                MergeOutcome::Merging,
                MergeOutcome::Merging,
            ]);
            snapshot.percentage = 40.0;
        }

        let mut machine = run_to_poll(&harness);
        assert_eq!(machine.last_percentage, 40);

        // The capability briefly reports a lower percentage; the logged
        // high-water mark must not move backwards.
        harness.snapshot.lock().percentage = 20.0;
        machine.fire_scheduled();
        assert_eq!(machine.last_percentage, 40);

        harness.snapshot.lock().percentage = 55.0;
        machine.fire_scheduled();
        assert_eq!(machine.last_percentage, 55);
    }

    // ─── Telemetry ───

    #[test]
    fn completed_merge_emits_one_report() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Unverified);
            snapshot.poll_outcomes.push_back(MergeOutcome::MergeCompleted);
            snapshot.cow_file_size_bytes = 4096;
            snapshot.compression_used = true;
            snapshot.source_fingerprint = "vendor/source:14".to_string();
        }
        harness.boot.lock().features.retrofit = true;
        harness.system.lock().build_fingerprint = "vendor/target:15".to_string();
        harness.clock.set(10_000);

        let mut machine = started(&harness, MergeConfig::new());
        harness.clock.set(13_000);
        machine.fire_scheduled();

        let records = harness.telemetry.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.outcome, MergeOutcome::MergeCompleted);
        assert_eq!(record.resume_count, 0);
        assert!(record.vab_retrofit);
        assert_eq!(record.cow_file_size_bytes, 4096);
        assert!(record.compression_used);
        assert_eq!(record.boot_complete_time_ms, 10_000);
        assert_eq!(record.boot_complete_to_merge_start_time_ms, 3_000);
        assert_eq!(record.source_build_fingerprint, "vendor/source:14");
        assert_eq!(record.target_build_fingerprint, "vendor/target:15");
    }

    #[test]
    fn prior_failure_code_survives_a_successful_merge() {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::MergeCompleted);
            snapshot.failure_code = MergeFailureCode(7);
        }

        run_to_poll(&harness);

        // The code was stashed before the poll; the successful outcome must
        // not have cleared it.
        let records = harness.telemetry.records();
        assert_eq!(records[0].merge_failure_code, MergeFailureCode(7));
    }

    #[test]
    fn nothing_merged_outcomes_emit_no_report() {
        for outcome in [MergeOutcome::None, MergeOutcome::Initiated] {
            let harness = Harness::new();
            harness.snapshot.lock().poll_outcomes.push_back(outcome);

            run_to_poll(&harness);

            assert!(harness.telemetry.records().is_empty());
        }
    }

    #[test]
    fn recovery_emits_no_report() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeCompleted);

        let mut machine = started(&harness, MergeConfig::new().with_recovery(true));
        machine.fire_scheduled();

        assert_eq!(harness.completion.only(), CompletionCode::Success);
        assert!(harness.telemetry.records().is_empty());
    }

    #[test]
    fn disabled_telemetry_emits_no_report() {
        let harness = Harness::new();
        harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeCompleted);

        let mut machine = started(&harness, MergeConfig::new().with_telemetry_enabled(false));
        assert_eq!(
            machine.scheduled().map(|(_, step, _)| step),
            Some(Step::StartMerge)
        );
        machine.fire_scheduled();

        assert_eq!(harness.completion.only(), CompletionCode::Success);
        assert!(harness.telemetry.records().is_empty());
    }
}
