use serde::{Deserialize, Serialize};

pub const ONE_SECOND: i64 = 1000;
pub const ONE_MINUTE: i64 = 60 * ONE_SECOND;
pub const ONE_HOUR: i64 = 60 * ONE_MINUTE;
pub const ONE_DAY: i64 = 24 * ONE_HOUR;

/// TimeRange is an inclusive `[start, end]` range of millisecond timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Interval is a base write tick in milliseconds (e.g. 10s).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval(i64);

impl Interval {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// name returns the short form used for directory names, e.g. "10s", "1m".
    pub fn name(&self) -> String {
        let ms = self.0;
        if ms >= ONE_DAY && ms % ONE_DAY == 0 {
            format!("{}d", ms / ONE_DAY)
        } else if ms >= ONE_HOUR && ms % ONE_HOUR == 0 {
            format!("{}h", ms / ONE_HOUR)
        } else if ms >= ONE_MINUTE && ms % ONE_MINUTE == 0 {
            format!("{}m", ms / ONE_MINUTE)
        } else if ms >= ONE_SECOND && ms % ONE_SECOND == 0 {
            format!("{}s", ms / ONE_SECOND)
        } else {
            format!("{}ms", ms)
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self(10 * ONE_SECOND)
    }
}
