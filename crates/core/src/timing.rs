//! Timestamps and latency measurement
//!
//! Nanosecond wall-clock timestamps for latency logging, plus the
//! millisecond conversions the exchange REST API works in.

use std::time::{SystemTime, UNIX_EPOCH};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from time conversions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("Unrecognised date format: {0}")]
    InvalidDate(String),

    #[error("Timestamp out of range: {0}")]
    OutOfRange(i64),
}

/// Nanosecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch
    pub nanos: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        Self { nanos: nanos() }
    }

    /// Milliseconds since Unix epoch, the unit used on the wire
    pub fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    pub fn elapsed_nanos(&self) -> u64 {
        nanos().saturating_sub(self.nanos)
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.elapsed_nanos() / 1_000
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed_nanos() / 1_000_000
    }
}

/// Nanoseconds since Unix epoch from the system clock
#[inline]
pub fn nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Milliseconds since Unix epoch, as sent in the `timestamp` request field
#[inline]
pub fn millis() -> u64 {
    nanos() / 1_000_000
}

/// Convert an exchange millisecond timestamp into a UTC datetime
pub fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, TimeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(TimeError::OutOfRange(ms))
}

/// Convert a UTC datetime into exchange milliseconds
pub fn datetime_to_ms(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` (UTC) into milliseconds
pub fn parse_date_ms(input: &str) -> Result<i64, TimeError> {
    let trimmed = input.trim();

    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp_millis());
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| TimeError::InvalidDate(input.to_string()))
}

/// Scoped latency measurement, logged at debug level on drop
pub struct PerfTimer {
    start: Timestamp,
    name: String,
}

impl PerfTimer {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Timestamp::now(),
            name: name.into(),
        }
    }

    pub fn elapsed_nanos(&self) -> u64 {
        self.start.elapsed_nanos()
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed_micros()
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.start.elapsed_millis()
    }

    fn log_elapsed(&self) {
        let micros = self.elapsed_micros();
        if micros < 1000 {
            tracing::debug!("⏱️  {} took {}μs", self.name, micros);
        } else {
            tracing::debug!("⏱️  {} took {:.3}ms", self.name, micros as f64 / 1000.0);
        }
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        self.log_elapsed();
    }
}
