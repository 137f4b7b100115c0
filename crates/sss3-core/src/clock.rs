//! Millisecond clock used to correlate logs and telemetry

use chrono::Utc;

/// Millisecond-resolution time source
///
/// The synchronized clock lives outside this crate; anything that can
/// answer "what time is it in epoch milliseconds" can be plugged in.
pub trait ClockSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock of the local host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
