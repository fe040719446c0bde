//! Utility functions and helpers
//!
//! Backoff, clock and formatting helpers shared by the feed, coordinator and
//! hashrate reporter.

use std::time::Duration;

/// Get current timestamp in seconds since Unix epoch
pub fn current_timestamp_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Format hash rate with SI units
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut rate = hashes_per_sec;
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Format a block number triple as `[prime region zone]`
pub fn format_numbers(numbers: &[u64; crate::types::HIERARCHY_DEPTH]) -> String {
    format!("[{} {} {}]", numbers[0], numbers[1], numbers[2])
}

/// Exponential backoff calculator
///
/// Starts at `initial`, multiplies by `multiplier` each attempt and never
/// exceeds `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    current: Option<Duration>,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: None,
            attempt: 0,
        }
    }

    /// Doubling backoff starting at one second
    pub fn doubling(max: Duration) -> Self {
        Self::new(Duration::from_secs(1), max, 2)
    }

    /// Get the next delay
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => previous
                .checked_mul(self.multiplier)
                .unwrap_or(self.max),
        }
        .min(self.max);

        self.current = Some(delay);
        self.attempt += 1;
        delay
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.current = None;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
