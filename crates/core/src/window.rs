//! Lookback window used to decide which tables are due for backup.

use chrono::{DateTime, Duration, Utc};

/// Default lookback window (24 hours).
pub const DEFAULT_LOOKBACK_SECS: u64 = 24 * 60 * 60;

/// "Recently modified" window ending at the scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    length: Duration,
}

impl Default for LookbackWindow {
    fn default() -> Self {
        Self::from_secs(DEFAULT_LOOKBACK_SECS)
    }
}

impl LookbackWindow {
    pub fn new(length: Duration) -> Self {
        Self { length }
    }

    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        Self::new(Duration::seconds(secs))
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Start of the window: `now - length`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.length)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// A table is due when it was modified at or after the cutoff.
    /// The boundary itself is inside the window.
    pub fn contains(&self, last_modified_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        last_modified_at >= self.cutoff(now)
    }
}
