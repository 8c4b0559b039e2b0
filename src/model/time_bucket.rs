//! Coarse time buckets used to partition aggregation windows.
//!
//! Buckets are decimal-packed UTC timestamps, e.g. `202403051742` for the
//! minute 2024-03-05 17:42, so they sort chronologically and can be
//! truncated to coarser granularities by integer division.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Deserialize;

/// Granularity of a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl Downsampling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Returns the bucket containing `ts`.
    pub fn bucket(&self, ts: DateTime<Utc>) -> i64 {
        let month = i64::from(ts.year()) * 100 + i64::from(ts.month());
        let day = month * 100 + i64::from(ts.day());
        let hour = day * 100 + i64::from(ts.hour());
        match self {
            Self::Month => month,
            Self::Day => day,
            Self::Hour => hour,
            Self::Minute => hour * 100 + i64::from(ts.minute()),
        }
    }

    /// Returns the bucket for a unix timestamp in milliseconds.
    pub fn bucket_from_millis(&self, millis: i64) -> Option<i64> {
        DateTime::from_timestamp_millis(millis).map(|ts| self.bucket(ts))
    }

    /// Truncates a minute bucket to this granularity.
    pub fn from_minute_bucket(&self, minute: i64) -> i64 {
        match self {
            Self::Minute => minute,
            Self::Hour => minute / 100,
            Self::Day => minute / 10_000,
            Self::Month => minute / 1_000_000,
        }
    }
}

/// Builds the conventional `"{bucket}_{entity}"` record id.
pub fn entity_id(bucket: i64, entity: &str) -> String {
    format!("{bucket}_{entity}")
}
