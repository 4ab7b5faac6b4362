//! Record types for parsed log data, raw stores and weekly totals.
//!
//! Each persisted record type carries a static column table
//! (name + SQLite type, in schema order). The storage layer builds its
//! `CREATE TABLE` statements from these tables and verifies an existing
//! database against them before reading a single row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::weeks::weeknum;

/// Column name and SQLite column type, in schema order.
pub type ColumnSpec = (&'static str, &'static str);

/// A generic access-log line in combined log format, parsed but not yet
/// classified. Parsed once per line; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub host: String,
    pub identity: String,
    pub user: String,
    pub time: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub protocol: String,
    pub status: u16,
    pub nbytes: Option<u64>,
    pub referrer: String,
    pub user_agent: String,
}

/// Any mirrorlist/metalink hit, regardless of client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MirrorItem {
    pub timestamp: i64,
    pub host: String,
    pub repo_tag: Option<String>,
    pub repo_arch: Option<String>,
}

pub const MIRRORS_RAW_TABLE: &str = "mirrors_raw";
pub const MIRRORS_RAW_COLUMNS: &[ColumnSpec] = &[
    ("timestamp", "INTEGER NOT NULL"),
    ("host", "TEXT NOT NULL"),
    ("repo_tag", "TEXT"),
    ("repo_arch", "TEXT"),
];

/// One matched countme request: the canonical raw unit of data.
///
/// `sys_age` is the client's self-reported countme bucket. A negative value
/// is a sentinel: the request carried no countme parameter, and the row only
/// feeds the unique-IP metric stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CountmeItem {
    pub timestamp: i64,
    pub host: String,
    pub os_name: String,
    pub os_version: String,
    pub os_variant: String,
    pub os_arch: String,
    pub sys_age: i64,
    pub repo_tag: Option<String>,
    pub repo_arch: Option<String>,
}

impl CountmeItem {
    /// Replace absent optional fields with explicit empty strings. The raw
    /// store declares every column NOT NULL, so items must be normalized
    /// before insertion.
    pub fn normalized(mut self) -> Self {
        self.repo_tag = Some(self.repo_tag.unwrap_or_default());
        self.repo_arch = Some(self.repo_arch.unwrap_or_default());
        self
    }
}

pub const COUNTME_RAW_TABLE: &str = "countme_raw";
pub const COUNTME_RAW_COLUMNS: &[ColumnSpec] = &[
    ("timestamp", "INTEGER NOT NULL"),
    ("host", "TEXT NOT NULL"),
    ("os_name", "TEXT NOT NULL"),
    ("os_version", "TEXT NOT NULL"),
    ("os_variant", "TEXT NOT NULL"),
    ("os_arch", "TEXT NOT NULL"),
    ("sys_age", "INTEGER NOT NULL"),
    ("repo_tag", "TEXT NOT NULL"),
    ("repo_arch", "TEXT NOT NULL"),
];

/// Which metric stream a raw row belongs to. Both streams share the
/// `countme_raw` table; the sign of `sys_age` discriminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Genuine countme pings (`sys_age >= 0`).
    Countme,
    /// Sentinel rows counted only for unique-IP statistics (`sys_age < 0`).
    UniqueIp,
}

impl RecordClass {
    pub(crate) fn sql_predicate(self) -> &'static str {
        match self {
            RecordClass::Countme => "sys_age >= 0",
            RecordClass::UniqueIp => "sys_age < 0",
        }
    }
}

/// Grouping key for weekly aggregation: a [`CountmeItem`] with the timestamp
/// replaced by its week number. Two items with equal buckets belong to the
/// same statistical cohort for that week.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CountBucket {
    pub weeknum: i64,
    pub os_name: String,
    pub os_version: String,
    pub os_variant: String,
    pub os_arch: String,
    pub sys_age: i64,
    pub repo_tag: String,
    pub repo_arch: String,
}

impl CountBucket {
    pub fn from_item(item: &CountmeItem) -> Self {
        Self {
            weeknum: weeknum(item.timestamp),
            os_name: item.os_name.clone(),
            os_version: item.os_version.clone(),
            os_variant: item.os_variant.clone(),
            os_arch: item.os_arch.clone(),
            sys_age: item.sys_age,
            repo_tag: item.repo_tag.clone().unwrap_or_default(),
            repo_arch: item.repo_arch.clone().unwrap_or_default(),
        }
    }
}

/// One row of the distinct unique-IP projection for a day slice: a raw row
/// with timestamp and sys_age stripped, host retained.
#[derive(Debug, Clone, PartialEq, Eq, Hash, FromRow)]
pub struct UniqueIpRow {
    pub host: String,
    pub os_name: String,
    pub os_version: String,
    pub os_variant: String,
    pub os_arch: String,
    pub repo_tag: String,
    pub repo_arch: String,
}

impl UniqueIpRow {
    /// The totals bucket this distinct observation counts toward.
    /// `sys_age` collapses to the sentinel: the unique-IP stream ignores
    /// that dimension.
    pub fn into_bucket(self, weeknum: i64) -> CountBucket {
        CountBucket {
            weeknum,
            os_name: self.os_name,
            os_version: self.os_version,
            os_variant: self.os_variant,
            os_arch: self.os_arch,
            sys_age: UNIQUE_IP_SYS_AGE,
            repo_tag: self.repo_tag,
            repo_arch: self.repo_arch,
        }
    }
}

/// Sentinel `sys_age` for rows and totals of the unique-IP stream.
pub const UNIQUE_IP_SYS_AGE: i64 = -1;

/// A [`CountBucket`] with its aggregated hit count on the front: one row of
/// the totals store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TotalsItem {
    pub hits: i64,
    pub weeknum: i64,
    pub os_name: String,
    pub os_version: String,
    pub os_variant: String,
    pub os_arch: String,
    pub sys_age: i64,
    pub repo_tag: String,
    pub repo_arch: String,
}

impl TotalsItem {
    pub fn from_bucket(bucket: CountBucket, hits: i64) -> Self {
        Self {
            hits,
            weeknum: bucket.weeknum,
            os_name: bucket.os_name,
            os_version: bucket.os_version,
            os_variant: bucket.os_variant,
            os_arch: bucket.os_arch,
            sys_age: bucket.sys_age,
            repo_tag: bucket.repo_tag,
            repo_arch: bucket.repo_arch,
        }
    }
}

pub const COUNTME_TOTALS_TABLE: &str = "countme_totals";
pub const COUNTME_TOTALS_COLUMNS: &[ColumnSpec] = &[
    ("hits", "INTEGER NOT NULL"),
    ("weeknum", "INTEGER NOT NULL"),
    ("os_name", "TEXT NOT NULL"),
    ("os_version", "TEXT NOT NULL"),
    ("os_variant", "TEXT NOT NULL"),
    ("os_arch", "TEXT NOT NULL"),
    ("sys_age", "INTEGER NOT NULL"),
    ("repo_tag", "TEXT NOT NULL"),
    ("repo_arch", "TEXT NOT NULL"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weeks::{week_start_timestamp, WEEK_SECONDS};

    fn item(timestamp: i64, sys_age: i64) -> CountmeItem {
        CountmeItem {
            timestamp,
            host: "203.0.113.1".to_string(),
            os_name: "Fedora".to_string(),
            os_version: "38".to_string(),
            os_variant: "workstation".to_string(),
            os_arch: "x86_64".to_string(),
            sys_age,
            repo_tag: Some("fedora-38".to_string()),
            repo_arch: Some("x86_64".to_string()),
        }
    }

    #[test]
    fn bucket_replaces_timestamp_with_weeknum() {
        let start = week_start_timestamp(2900);
        let a = CountBucket::from_item(&item(start, 3));
        let b = CountBucket::from_item(&item(start + WEEK_SECONDS - 1, 3));
        assert_eq!(a, b);
        assert_eq!(a.weeknum, 2900);

        let next = CountBucket::from_item(&item(start + WEEK_SECONDS, 3));
        assert_ne!(a, next);
    }

    #[test]
    fn normalized_fills_missing_optionals() {
        let mut raw = item(0, 1);
        raw.repo_tag = None;
        let normalized = raw.normalized();
        assert_eq!(normalized.repo_tag.as_deref(), Some(""));
        assert_eq!(normalized.repo_arch.as_deref(), Some("x86_64"));
    }

    #[test]
    fn unique_row_bucket_uses_sentinel_sys_age() {
        let row = UniqueIpRow {
            host: "203.0.113.1".to_string(),
            os_name: "Fedora".to_string(),
            os_version: "38".to_string(),
            os_variant: "server".to_string(),
            os_arch: "aarch64".to_string(),
            repo_tag: "fedora-38".to_string(),
            repo_arch: "aarch64".to_string(),
        };
        let bucket = row.into_bucket(2900);
        assert_eq!(bucket.sys_age, UNIQUE_IP_SYS_AGE);
        assert_eq!(bucket.weeknum, 2900);
    }
}
