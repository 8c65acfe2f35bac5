//! Canonical timestamps.
//!
//! Every timestamp stored or reported by the engine is a string in
//! [`TIMESTAMP_FORMAT`], rendered in one configured zone. Parsing drops the
//! trailing zone token, so durations are computed on naive local times; the
//! zone exists for human readers and for callers of the status API.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Render format for every `times.*` string field.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

const TIMESTAMP_FORMAT_NO_ZONE: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical zone used when none is configured.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::US::Pacific;

/// A timestamp or zone name that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The string does not parse under [`TIMESTAMP_FORMAT`].
    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),
    /// The zone name is not in the tz database.
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

/// Current wall-clock time rendered in the canonical format.
pub fn timestamp_now(tz: Tz) -> String {
    Utc::now()
        .with_timezone(&tz)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

/// Parse a canonical timestamp back into a naive datetime.
///
/// The trailing zone abbreviation is stripped rather than interpreted, so
/// timestamps compare correctly as long as they were rendered in one zone.
pub fn parse_timestamp(ts: &str) -> Result<NaiveDateTime, ClockError> {
    let trimmed = match ts.rsplit_once(' ') {
        Some((head, _zone)) => head,
        None => ts,
    };
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT_NO_ZONE)
        .map_err(|_| ClockError::BadTimestamp(ts.to_string()))
}

/// Resolve a tz-database zone name (e.g. `US/Pacific`).
pub fn parse_timezone(name: &str) -> Result<Tz, ClockError> {
    Tz::from_str(name).map_err(|_| ClockError::UnknownTimezone(name.to_string()))
}

/// Elapsed time between two canonical timestamps, decomposed for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timedelta {
    /// Whole hours.
    pub hours: i64,
    /// Whole minutes past the hour.
    pub minutes: i64,
    /// Whole seconds past the minute.
    pub seconds: i64,
    /// The full span in seconds.
    pub total_seconds: i64,
}

impl fmt::Display for Timedelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hours {} min. {} sec. (total: {} sec.)",
            self.hours, self.minutes, self.seconds, self.total_seconds
        )
    }
}

/// Compute `end - start` for two canonical timestamps.
pub fn timedelta(start: &str, end: &str) -> Result<Timedelta, ClockError> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    let total_seconds = (end - start).num_seconds();

    let mut rest = total_seconds;
    let hours = rest / (60 * 60);
    rest -= hours * 60 * 60;
    let minutes = rest / 60;
    rest -= minutes * 60;

    Ok(Timedelta {
        hours,
        minutes,
        seconds: rest,
        total_seconds,
    })
}

/// The archive cutoff: local midnight today, minus `archive_days` days.
///
/// The cutoff is intentionally day-granular: the current time is truncated
/// to midnight before subtracting, so completion timestamps are effectively
/// compared by calendar date, not by a rolling 72-hour window.
pub fn archive_cutoff(tz: Tz, archive_days: u32) -> NaiveDateTime {
    let today = Utc::now().with_timezone(&tz).date_naive();
    let midnight = today
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time of day");
    midnight - Duration::days(i64::from(archive_days))
}

/// Whether a completion timestamp falls before the archive cutoff.
///
/// Unparseable timestamps are never archived.
pub fn is_before_cutoff(completed: &str, cutoff: NaiveDateTime) -> bool {
    match parse_timestamp(completed) {
        Ok(ts) => ts < cutoff,
        Err(_) => false,
    }
}
