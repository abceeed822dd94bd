//! # Timestamps
//!
//! UTC timestamp rendering for telemetry records.
//!
//! ## Formats
//!
//! | Format | Example | Fraction field |
//! |--------|---------|----------------|
//! | `legacy` | `2024-03-05T07:08:09.009Z` | seconds-of-minute, zero-padded to 3 digits |
//! | `millis` | `2024-03-05T07:08:09.250Z` | milliseconds |
//!
//! `legacy` is what deployed devices have always sent (the pattern
//! `yyyy-MM-dd'T'HH:mm:ss.sss` repeats the seconds field), so downstream
//! consumers keep parsing the same shape. `millis` is opt-in.

use chrono::{DateTime, Timelike, Utc};
use serde::Deserialize;

/// Rendering of the `time` payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    #[default]
    Legacy,
    Millis,
}

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Render `time` in the requested format.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use wearable_telemetry::telemetry::timestamp::{format_timestamp, TimestampFormat};
///
/// let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
/// assert_eq!(format_timestamp(t, TimestampFormat::Legacy), "2024-03-05T07:08:09.009Z");
/// assert_eq!(format_timestamp(t, TimestampFormat::Millis), "2024-03-05T07:08:09.000Z");
/// ```
pub fn format_timestamp(time: DateTime<Utc>, format: TimestampFormat) -> String {
    match format {
        TimestampFormat::Legacy => {
            format!("{}.{:03}Z", time.format("%Y-%m-%dT%H:%M:%S"), time.second())
        }
        TimestampFormat::Millis => time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;

    /// Clock frozen at a fixed instant
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }
}
