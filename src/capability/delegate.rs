//! Progress delegate and completion sink.

use crate::types::CompletionCode;

/// Optional observer for merge progress.
pub trait ProgressDelegate {
    /// Called with the merge completion fraction in `[0, 1]`.
    ///
    /// The merge capability reports percentages in `[0, 100]`; the action
    /// rescales before forwarding.
    fn on_cleanup_progress(&self, fraction: f64);
}

/// Sink notified exactly once with the terminal result of a run.
///
/// The method consumes the sink, so a second notification for the same run
/// is unrepresentable rather than merely forbidden.
pub trait CompletionSink {
    fn on_action_complete(self: Box<Self>, code: CompletionCode);
}
