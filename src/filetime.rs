//! Windows FILETIME values as used by `accountExpires`, `pwdLastSet`,
//! `lastLogonTimestamp` and friends.

use chrono::{DateTime, Utc};

use crate::directory::Attributes;


const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE_SECS: i64 = 11_644_473_600;

/// Written to `accountExpires` for accounts that never expire.
pub const NEVER: i64 = i64::MAX;


/// The instant a FILETIME denotes; `None` for the "never" values `0` and
/// `i64::MAX` and for anything before 1601.
pub fn to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 || ticks == NEVER {
        return None;
    }
    let secs = ticks / TICKS_PER_SECOND - EPOCH_DIFFERENCE_SECS;
    let nanos = (ticks % TICKS_PER_SECOND) * NANOS_PER_TICK;
    DateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)
}

/// The FILETIME for an instant, truncated to 100 ns; `0` before 1601.
pub fn from_datetime(instant: &DateTime<Utc>) -> i64 {
    let secs = instant.timestamp() + EPOCH_DIFFERENCE_SECS;
    if secs < 0 {
        return 0;
    }
    let ticks = i64::from(instant.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    secs.checked_mul(TICKS_PER_SECOND)
        .and_then(|t| t.checked_add(ticks))
        .unwrap_or(NEVER)
}

impl Attributes {
    /// Reads the first value of a FILETIME attribute.
    pub fn filetime(&self, name: &str) -> Option<DateTime<Utc>> {
        let ticks: i64 = self.first_text(name)?.trim().parse().ok()?;
        to_datetime(ticks)
    }
}
