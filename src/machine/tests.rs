//! Edge-case and regression tests for the machine module.
//!
//! These cover scheduling-discipline corners and the numeric invariants.
//! Core behavioral tests live in machine.rs alongside the implementation.

use std::time::Duration;

use proptest::prelude::*;

use crate::machine::config::{clamp_merge_delay, MergeConfig};
use crate::machine::task::Step;
use crate::test_utils::Harness;
use crate::types::MergeOutcome;

// ─── Scheduling discipline ───

#[test]
fn rescheduled_gate_steps_get_fresh_task_ids() {
    let harness = Harness::new();
    harness.system.lock().boot_not_ready_polls = u32::MAX;

    let mut machine = harness.machine(MergeConfig::new());
    machine.start();

    let (first, _, _) = machine.scheduled().unwrap();
    machine.fire_scheduled();
    let (second, _, _) = machine.scheduled().unwrap();
    machine.fire_scheduled();
    let (third, _, _) = machine.scheduled().unwrap();

    assert!(first != second && second != third);
}

#[test]
fn at_most_one_task_is_armed_across_a_full_run() {
    let harness = Harness::new();
    {
        let mut snapshot = harness.snapshot.lock();
        snapshot.poll_outcomes.extend([
            MergeOutcome::Merging,
            MergeOutcome::Merging,
            MergeOutcome::MergeCompleted,
        ]);
    }
    harness.system.lock().boot_not_ready_polls = 2;
    harness.boot.lock().not_successful_polls = 1;

    let mut machine = harness.machine(MergeConfig::new());
    machine.start();

    // Drive to completion; arming a second task while one is armed would
    // panic inside ScheduledTask.
    let mut fires = 0;
    while machine.scheduled().is_some() {
        machine.fire_scheduled();
        fires += 1;
        assert!(fires < 32, "machine did not terminate");
    }
    assert!(machine.completion_code().is_some());
}

#[test]
fn stop_before_start_is_a_noop() {
    let harness = Harness::new();
    let mut machine = harness.machine(MergeConfig::new());

    machine.stop();

    assert!(!machine.is_running());
    assert!(machine.scheduled().is_none());
    assert!(harness.completion.codes().is_empty());
}

#[test]
fn repeated_suspend_resume_cycles_converge() {
    let harness = Harness::new();
    harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::Merging);

    let mut machine = harness.machine(MergeConfig::new());
    machine.start();

    for _ in 0..3 {
        machine.suspend();
        machine.resume();
    }

    // Still exactly one armed task, and the run can still finish.
    assert_eq!(
        machine.scheduled().map(|(_, step, _)| step),
        Some(Step::StartMerge)
    );
    harness.snapshot.lock().poll_outcomes.push_back(MergeOutcome::MergeCompleted);
    machine.fire_scheduled();
    while machine.scheduled().is_some() {
        machine.fire_scheduled();
    }
    assert_eq!(harness.completion.codes().len(), 1);
}

#[test]
fn suspend_stops_collaborator_queries() {
    let harness = Harness::new();
    harness.system.lock().boot_not_ready_polls = u32::MAX;

    let mut machine = harness.machine(MergeConfig::new());
    machine.start();
    machine.fire_scheduled();
    let checks_before = harness.system.lock().boot_checks;

    machine.suspend();
    machine.fire_scheduled();

    assert_eq!(harness.system.lock().boot_checks, checks_before);
}

// ─── Numeric invariants ───

proptest! {
    #[test]
    fn merge_delay_clamp_stays_within_bounds(seconds in any::<u64>()) {
        let delay = clamp_merge_delay(seconds);
        prop_assert!(delay <= Duration::from_secs(600));
        prop_assert_eq!(delay, Duration::from_secs(seconds.min(600)));
    }

    #[test]
    fn delegate_fraction_is_a_linear_rescale(percentage in 0.0f64..=100.0) {
        let harness = Harness::new();
        {
            let mut snapshot = harness.snapshot.lock();
            snapshot.poll_outcomes.push_back(MergeOutcome::Merging);
            snapshot.percentage = percentage;
        }

        let mut machine = harness.machine(MergeConfig::new());
        machine.start();
        machine.fire_scheduled();

        let fractions = harness.delegate.fractions();
        prop_assert_eq!(fractions.len(), 1);
        prop_assert!((0.0..=1.0).contains(&fractions[0]));
        prop_assert!((fractions[0] - percentage / 100.0).abs() < f64::EPSILON);
    }
}
