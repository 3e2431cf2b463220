use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// How long a loaded interface descriptor stays cached past the message
/// that loaded it.
pub const INTERFACE_LIFESPAN: Duration = Duration::from_secs(600);
/// How often the device-level and any-device trigger tables are refreshed
/// from storage.
pub const DEVICE_TRIGGERS_LIFESPAN: Duration = Duration::from_secs(600);
/// Bound on the per-device `{interface, path}` cache.
pub const PATHS_CACHE_CAP: usize = 32;
/// Bound on decompressed control payloads.
pub const SAFE_INFLATE_MAX: usize = 10 * 1024 * 1024;
/// Fixed part of the tracker recovery sleep.
pub const BASE_BACKOFF_MS: u64 = 1_000;
/// Random part of the tracker recovery sleep, uniform in [0, this].
pub const RANDOM_BACKOFF_MS: u64 = 9_000;

const TICKS_PER_MILLI: i64 = 10_000;
const TICKS_PER_SEC: i64 = 10_000_000;

/// A point in time in decimicroseconds (100 ns ticks) since the Unix
/// epoch. This is the internal time unit everywhere; milliseconds only
/// appear at external boundaries (broker meta, database columns).
///
/// i64 ticks keep us clear of the year-2262 overflow that nanosecond
/// representations hit.
#[repr(transparent)]
#[derive(
    Debug, Hash, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_ticks(ticks: i64) -> Self {
        Timestamp(ticks)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis * TICKS_PER_MILLI)
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Timestamp(now.timestamp() * TICKS_PER_SEC + i64::from(now.timestamp_subsec_micros()) * 10)
    }

    pub fn as_ticks(&self) -> i64 {
        self.0
    }

    /// Whole milliseconds since the epoch.
    pub fn as_millis(&self) -> i64 {
        self.0 / TICKS_PER_MILLI
    }

    /// The sub-millisecond remainder, in 100 ns ticks.
    pub fn sub_millis(&self) -> i64 {
        self.0 % TICKS_PER_MILLI
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.as_millis())
            .single()
            .unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp::from_millis(dt.timestamp_millis())
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_ticks())
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        Duration::from_ticks(self.0 - rhs.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A span of time in decimicrosecond ticks.
#[repr(transparent)]
#[derive(
    Debug, Hash, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default,
)]
pub struct Duration(i64);

impl Duration {
    pub const fn from_ticks(ticks: i64) -> Self {
        Duration(ticks)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Duration(secs * TICKS_PER_SEC)
    }

    pub const fn as_ticks(&self) -> i64 {
        self.0
    }

    pub const fn as_secs(&self) -> i64 {
        self.0 / TICKS_PER_SEC
    }
}
