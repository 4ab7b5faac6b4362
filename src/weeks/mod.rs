//! Time and week arithmetic for countme data.
//!
//! All aggregation works on integer "week numbers": fixed 7-day windows
//! counted from a reference Monday midnight UTC. The constants below are
//! part of the published data format and must not change.

use chrono::NaiveDate;
use thiserror::Error;

pub const DAY_SECONDS: i64 = 24 * 60 * 60;
pub const WEEK_SECONDS: i64 = 7 * DAY_SECONDS;

/// 00:00:00 Mon Jan 5 1970 (UTC) - the Monday the week grid is anchored to.
pub const COUNTME_EPOCH: i64 = 345_600;

/// The same epoch as a proleptic-Gregorian ordinal day, for weeknum-to-date
/// conversion.
pub const COUNTME_EPOCH_ORDINAL: i64 = 719_167;

/// Mon Feb 10 2020 (UTC). Countme data collection starts this week; raw rows
/// from before it are never aggregated.
pub const COUNTME_START_TIME: i64 = 1_581_292_800;
pub const COUNTME_START_WEEKNUM: i64 = 2614;

/// Default tolerance (seconds) for out-of-order log delivery. Log timestamps
/// jump backwards by at most a few minutes; a week only counts as complete
/// once the newest timestamp is this far past the week boundary.
pub const LOG_JITTER_WINDOW: i64 = 600;

/// Week number of a UNIX timestamp. Floor division, so the mapping is
/// monotonic even for (theoretical) pre-epoch timestamps.
pub fn weeknum(timestamp: i64) -> i64 {
    (timestamp - COUNTME_EPOCH).div_euclid(WEEK_SECONDS)
}

/// First timestamp belonging to `weeknum`. Inverse of [`weeknum`] on week
/// boundaries.
pub fn week_start_timestamp(weeknum: i64) -> i64 {
    weeknum * WEEK_SECONDS + COUNTME_EPOCH
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed log time field: {field:?}")]
pub struct TimeParseError {
    pub field: String,
}

/// Calendar date of one day within a week, weekday 0 (Mon) through 6 (Sun).
fn week_date(weeknum: i64, weekday: i64) -> Option<NaiveDate> {
    let ordinal = COUNTME_EPOCH_ORDINAL + 7 * weeknum + weekday;
    NaiveDate::from_num_days_from_ce_opt(i32::try_from(ordinal).ok()?)
}

/// Inclusive Monday-to-Sunday date range of a week, for human-readable
/// output. Returns `None` only for week numbers far outside the calendar.
pub fn week_date_range(weeknum: i64) -> Option<(NaiveDate, NaiveDate)> {
    Some((week_date(weeknum, 0)?, week_date(weeknum, 6)?))
}

const MONTH_ABBRS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn month_index(abbr: &str) -> Option<u32> {
    MONTH_ABBRS
        .iter()
        .position(|m| *m == abbr)
        .map(|i| i as u32 + 1)
}

/// Parse an httpd log time field (`DD/Mon/YYYY:HH:MM:SS +HHMM`) to UNIX
/// seconds.
///
/// This is deliberately hand-rolled string splitting rather than a format
/// string parse: the matcher runs over millions of lines and the fixed
/// layout makes a full parser unnecessary. `+0000`/`-0000` short-circuit
/// straight to UTC.
pub fn parse_log_time(field: &str) -> Result<i64, TimeParseError> {
    split_log_time(field).ok_or_else(|| TimeParseError {
        field: field.to_string(),
    })
}

fn split_log_time(field: &str) -> Option<i64> {
    let (stamp, offset) = field.split_once(' ')?;
    let mut parts = stamp.splitn(4, ':');
    let date = parts.next()?;
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = parts.next()?.parse().ok()?;
    let mut date_parts = date.splitn(3, '/');
    let day: u32 = date_parts.next()?.parse().ok()?;
    let month = month_index(date_parts.next()?)?;
    let year: i32 = date_parts.next()?.parse().ok()?;

    let local = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?
        .and_utc()
        .timestamp();
    Some(local - utc_offset_seconds(offset)?)
}

fn utc_offset_seconds(offset: &str) -> Option<i64> {
    if offset == "+0000" || offset == "-0000" {
        return Some(0);
    }
    if offset.len() != 5 || !offset.is_char_boundary(1) || !offset.is_char_boundary(3) {
        return None;
    }
    let sign = match offset.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i64 = offset[1..3].parse().ok()?;
    let minutes: i64 = offset[3..5].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weeknum_at_epoch_is_zero() {
        assert_eq!(weeknum(COUNTME_EPOCH), 0);
    }

    #[test]
    fn weeknum_of_known_timestamps() {
        assert_eq!(weeknum(1_683_208_046), 2782);
        assert_eq!(weeknum(COUNTME_START_TIME), COUNTME_START_WEEKNUM);
    }

    #[test]
    fn weeknum_round_trips_through_week_start() {
        for w in [0, 1, 2614, 2782, 2900] {
            assert_eq!(weeknum(week_start_timestamp(w)), w);
            assert_eq!(weeknum(week_start_timestamp(w) + WEEK_SECONDS - 1), w);
            assert_eq!(weeknum(week_start_timestamp(w) + WEEK_SECONDS), w + 1);
        }
    }

    #[test]
    fn week_date_range_of_start_week() {
        let (monday, sunday) = week_date_range(COUNTME_START_WEEKNUM).unwrap();
        assert_eq!(monday.to_string(), "2020-02-10");
        assert_eq!(sunday.to_string(), "2020-02-16");
    }

    #[test]
    fn week_zero_starts_at_the_epoch_date() {
        let (monday, _) = week_date_range(0).unwrap();
        assert_eq!(monday.to_string(), "1970-01-05");
    }

    #[test]
    fn parses_utc_log_time() {
        // 2021-05-31T00:00:05Z
        assert_eq!(
            parse_log_time("31/May/2021:00:00:05 +0000"),
            Ok(1_622_419_205)
        );
        // -0000 is UTC too
        assert_eq!(
            parse_log_time("31/May/2021:00:00:05 -0000"),
            Ok(1_622_419_205)
        );
    }

    #[test]
    fn parses_offset_log_time() {
        // 20:00:05 at -0400 is 00:00:05 UTC the next day
        assert_eq!(
            parse_log_time("30/May/2021:20:00:05 -0400"),
            Ok(1_622_419_205)
        );
        assert_eq!(
            parse_log_time("31/May/2021:05:30:05 +0530"),
            Ok(1_622_419_205)
        );
    }

    #[test]
    fn rejects_malformed_log_time() {
        for bad in [
            "",
            "31/May/2021:00:00:05",
            "31/Mai/2021:00:00:05 +0000",
            "2021-05-31T00:00:05 +0000",
            "31/May/2021:00:00:05 +00:00",
        ] {
            assert!(parse_log_time(bad).is_err(), "{bad:?} should not parse");
        }
    }
}
