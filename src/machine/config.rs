//! Configuration for the merge state machine.
//!
//! The polling intervals are retry cadences, not deadlines: there is no
//! overall wall-clock timeout on the merge. Recovery and telemetry are
//! injected as explicit flags so both variants can be exercised in the
//! same test binary instead of behind conditional compilation.

use std::time::Duration;

/// Interval between checks of the boot-completed signal.
const CHECK_BOOT_COMPLETED_INTERVAL: Duration = Duration::from_secs(2);
/// Interval between checks of the slot-successful mark.
const CHECK_SLOT_MARKED_SUCCESSFUL_INTERVAL: Duration = Duration::from_secs(2);
/// Interval between merge polls.
const WAIT_FOR_MERGE_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on the administrator-configured merge delay.
const MAX_MERGE_DELAY_SECONDS: u64 = 600;

/// Configuration for a [`super::MergeStateMachine`].
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Interval for re-checking the boot-completed signal.
    pub boot_completed_interval: Duration,

    /// Interval for re-checking the slot-successful mark.
    pub slot_check_interval: Duration,

    /// Interval for re-polling an in-progress merge.
    pub merge_poll_interval: Duration,

    /// Whether this is a minimal recovery-boot environment.
    ///
    /// Recovery skips the boot and slot gates (they have no meaning
    /// there) and never reports telemetry.
    pub is_recovery: bool,

    /// Whether telemetry reporting is enabled at all.
    pub telemetry_enabled: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeConfig {
    /// Creates a configuration with production intervals.
    pub fn new() -> Self {
        MergeConfig {
            boot_completed_interval: CHECK_BOOT_COMPLETED_INTERVAL,
            slot_check_interval: CHECK_SLOT_MARKED_SUCCESSFUL_INTERVAL,
            merge_poll_interval: WAIT_FOR_MERGE_INTERVAL,
            is_recovery: false,
            telemetry_enabled: true,
        }
    }

    /// Marks this machine as running in a recovery-boot environment.
    pub fn with_recovery(mut self, is_recovery: bool) -> Self {
        self.is_recovery = is_recovery;
        self
    }

    /// Enables or disables telemetry reporting.
    pub fn with_telemetry_enabled(mut self, enabled: bool) -> Self {
        self.telemetry_enabled = enabled;
        self
    }
}

/// Clamps the administrator-configured merge delay to `[0, 600]` seconds.
pub fn clamp_merge_delay(seconds: u64) -> Duration {
    Duration::from_secs(seconds.min(MAX_MERGE_DELAY_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals_are_two_seconds() {
        let config = MergeConfig::new();
        assert_eq!(config.boot_completed_interval, Duration::from_secs(2));
        assert_eq!(config.slot_check_interval, Duration::from_secs(2));
        assert_eq!(config.merge_poll_interval, Duration::from_secs(2));
        assert!(!config.is_recovery);
        assert!(config.telemetry_enabled);
    }

    #[test]
    fn merge_delay_is_clamped_to_ten_minutes() {
        assert_eq!(clamp_merge_delay(0), Duration::ZERO);
        assert_eq!(clamp_merge_delay(30), Duration::from_secs(30));
        assert_eq!(clamp_merge_delay(600), Duration::from_secs(600));
        assert_eq!(clamp_merge_delay(601), Duration::from_secs(600));
        assert_eq!(clamp_merge_delay(u64::MAX), Duration::from_secs(600));
    }
}
