//! Boot-relative clock.
//!
//! Boot timing fields in the merge report are measured against the boot
//! clock, not wall time, so they stay meaningful across NTP adjustments.

use std::sync::OnceLock;
use std::time::Instant;

/// A clock measuring milliseconds since the device booted.
pub trait BootClock {
    fn now_ms(&self) -> i64;
}

/// Reads the kernel boot clock via `/proc/uptime`.
///
/// Falls back to a process-relative monotonic clock when the proc file is
/// unavailable (non-Linux hosts, sandboxed tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBootClock;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

impl BootClock for SystemBootClock {
    fn now_ms(&self) -> i64 {
        if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
            if let Some(secs) = uptime
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
            {
                return (secs * 1000.0) as i64;
            }
        }
        let start = *PROCESS_START.get_or_init(Instant::now);
        start.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemBootClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a >= 0);
    }
}
