//! Fixed time windows aligned to the Unix epoch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unit of a rate limit interval, as reported by the exchange-info endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl IntervalUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            IntervalUnit::Second => Duration::from_secs(1),
            IntervalUnit::Minute => Duration::from_secs(60),
            IntervalUnit::Hour => Duration::from_secs(3600),
            IntervalUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Single-letter suffix used in interval labels and usage headers.
    pub fn letter(&self) -> char {
        match self {
            IntervalUnit::Second => 's',
            IntervalUnit::Minute => 'm',
            IntervalUnit::Hour => 'h',
            IntervalUnit::Day => 'd',
        }
    }
}

/// Quantizes timestamps into windows of a fixed size.
///
/// Window `n` covers `[n * size, (n + 1) * size)` milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClock {
    size_ms: u64,
}

impl WindowClock {
    /// Create a clock for `count` units. A zero-sized window is clamped to 1 ms.
    pub fn new(unit: IntervalUnit, count: u32) -> Self {
        let size_ms = unit.duration().as_millis() as u64 * u64::from(count);
        Self::from_millis(size_ms)
    }

    /// Create a clock with windows of `size_ms` milliseconds, at least 1.
    pub fn from_millis(size_ms: u64) -> Self {
        Self { size_ms: size_ms.max(1) }
    }

    /// Window length in milliseconds.
    pub fn size_ms(&self) -> u64 {
        self.size_ms
    }

    /// Index of the window containing `timestamp_ms`.
    pub fn window_id(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms / self.size_ms
    }

    /// Milliseconds until the window after the one containing `now_ms` begins.
    ///
    /// Always in `1..=size_ms`.
    pub fn ms_until_next_window(&self, now_ms: u64) -> u64 {
        self.size_ms - (now_ms % self.size_ms)
    }

    /// Epoch millis at which the window after `now_ms` begins.
    pub fn next_window_start(&self, now_ms: u64) -> u64 {
        now_ms + self.ms_until_next_window(now_ms)
    }
}

/// Human label for an interval, e.g. `1m`, `10s`, `1d`.
pub fn interval_label(unit: IntervalUnit, count: u32) -> String {
    format!("{}{}", count, unit.letter())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_duration() {
        assert_eq!(IntervalUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(IntervalUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(IntervalUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(IntervalUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_window_size() {
        assert_eq!(WindowClock::new(IntervalUnit::Second, 10).size_ms(), 10_000);
        assert_eq!(WindowClock::new(IntervalUnit::Minute, 5).size_ms(), 300_000);
        assert_eq!(WindowClock::new(IntervalUnit::Day, 1).size_ms(), 86_400_000);
        assert_eq!(WindowClock::new(IntervalUnit::Second, 0).size_ms(), 1);
    }

    #[test]
    fn test_window_id_and_boundary() {
        let clock = WindowClock::new(IntervalUnit::Minute, 1);

        assert_eq!(clock.window_id(0), 0);
        assert_eq!(clock.window_id(59_999), 0);
        assert_eq!(clock.window_id(60_000), 1);

        assert_eq!(clock.ms_until_next_window(60_000), 60_000);
        assert_eq!(clock.ms_until_next_window(60_001), 59_999);
        assert_eq!(clock.ms_until_next_window(119_999), 1);
        assert_eq!(clock.next_window_start(90_000), 120_000);
    }

    #[test]
    fn test_interval_label() {
        assert_eq!(interval_label(IntervalUnit::Minute, 1), "1m");
        assert_eq!(interval_label(IntervalUnit::Second, 10), "10s");
        assert_eq!(interval_label(IntervalUnit::Hour, 2), "2h");
        assert_eq!(interval_label(IntervalUnit::Day, 1), "1d");
    }

    #[test]
    fn test_unit_serde_uses_uppercase() {
        let unit: IntervalUnit = serde_json::from_str("\"MINUTE\"").unwrap();
        assert_eq!(unit, IntervalUnit::Minute);
        assert_eq!(serde_json::to_string(&IntervalUnit::Day).unwrap(), "\"DAY\"");
    }
}
