//! Single-outstanding delayed-task handle.
//!
//! The underlying scheduler may reuse task identifiers, so cancelling by
//! remembered ID is racy: a stale ID can name someone else's task by the
//! time the cancel lands. The handle here avoids the race by construction:
//! the armed entry is owned and move-only, and a firing callback consumes
//! it (acknowledges) before doing any work or making any further
//! scheduling decision.

use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Identifier of one armed task, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The step an armed task will run when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    WaitBootCompleted,
    CheckSlotMarkedSuccessful,
    StartMerge,
    WaitForMerge,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::WaitBootCompleted => "WaitBootCompleted",
            Step::CheckSlotMarkedSuccessful => "CheckSlotMarkedSuccessful",
            Step::StartMerge => "StartMerge",
            Step::WaitForMerge => "WaitForMerge",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct Armed {
    id: TaskId,
    step: Step,
    delay: Duration,
}

/// A cancelable delayed-callback handle with at most one armed entry.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    next_id: u64,
    armed: Option<Armed>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry is currently armed.
    pub fn is_scheduled(&self) -> bool {
        self.armed.is_some()
    }

    /// Arms a new delayed step.
    ///
    /// # Panics
    ///
    /// Panics if an entry is already armed. The previous entry must have
    /// been consumed or cancelled first; double-arming is a programming
    /// error, not a runtime condition.
    pub fn schedule(&mut self, step: Step, delay: Duration) -> TaskId {
        assert!(
            self.armed.is_none(),
            "scheduled task already armed; acknowledge or cancel it first"
        );
        let id = TaskId(self.next_id);
        self.next_id += 1;
        debug!(task_id = %id, step = %step, delay_ms = delay.as_millis() as u64, "armed task");
        self.armed = Some(Armed { id, step, delay });
        id
    }

    /// Consumes the armed entry at the start of its own firing.
    ///
    /// Returns `None` when nothing is armed (the entry was cancelled
    /// between the fire decision and this call).
    pub fn acknowledge(&mut self) -> Option<(TaskId, Step)> {
        let armed = self.armed.take()?;
        debug!(task_id = %armed.id, step = %armed.step, "executing task");
        Some((armed.id, armed.step))
    }

    /// Disarms the entry without running it.
    pub fn cancel(&mut self) -> Option<TaskId> {
        let armed = self.armed.take()?;
        debug!(task_id = %armed.id, step = %armed.step, "cancelled pending task");
        Some(armed.id)
    }

    /// The armed entry, if any, for deadline computation.
    pub fn armed(&self) -> Option<(TaskId, Step, Duration)> {
        self.armed.as_ref().map(|a| (a.id, a.step, a.delay))
    }
}
