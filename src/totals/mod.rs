//! Incremental weekly aggregation of raw countme rows.
//!
//! Log lines arrive out of strict timestamp order, but never more than the
//! jitter window behind the newest line already seen. A week is therefore
//! only "complete" once the store's maximum timestamp is at least the jitter
//! window past the week's end; the week containing
//! `max_timestamp - jitter_window` stays provisional and is never counted.
//!
//! Each metric stream (countme pings, unique-IP observations) is aggregated
//! independently: the streams can have different min/max timestamps, so each
//! keeps its own high-water mark in the totals store. A week whose totals
//! are written is never revisited - re-running with unchanged raw data
//! writes nothing.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use anyhow::Result;
use indicatif::ProgressBar;
use tracing::{debug, info};

use crate::models::{CountBucket, RecordClass, TotalsItem};
use crate::storage::{RawStore, StorageResult, TotalsStore};
use crate::weeks::{
    week_date_range, week_start_timestamp, weeknum, COUNTME_START_WEEKNUM, DAY_SECONDS,
    LOG_JITTER_WINDOW,
};

#[derive(Debug, Clone)]
pub struct TotalsOptions {
    pub jitter_window_secs: i64,
    pub progress: bool,
}

impl Default for TotalsOptions {
    fn default() -> Self {
        Self {
            jitter_window_secs: LOG_JITTER_WINDOW,
            progress: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TotalsStats {
    pub countme_weeks: u64,
    pub countme_buckets: u64,
    pub unique_weeks: u64,
    pub unique_buckets: u64,
}

/// The half-open range of weeks whose raw data is complete for one metric
/// stream: from the later of the stream's first week and the configured
/// start week, up to (excluding) the provisional week. `None` when the
/// stream has no raw rows at all.
pub async fn complete_weeks(
    raw: &dyn RawStore,
    class: RecordClass,
    jitter_window_secs: i64,
) -> StorageResult<Option<Range<i64>>> {
    let Some(min_time) = raw.min_timestamp(Some(class)).await? else {
        return Ok(None);
    };
    let Some(max_time) = raw.max_timestamp(Some(class)).await? else {
        return Ok(None);
    };
    let start_week = weeknum(min_time).max(COUNTME_START_WEEKNUM);
    let provisional_week = weeknum(max_time - jitter_window_secs);
    Ok(Some(start_week..provisional_week))
}

/// Aggregate all newly-complete weeks of both metric streams from `raw` into
/// `totals`.
///
/// Only weeks strictly above the stream's current high-water mark are
/// counted, so each week is aggregated at most once over the store's
/// lifetime; the check short-circuits before any counting work when there is
/// nothing new.
pub async fn update_totals(
    raw: &dyn RawStore,
    totals: &dyn TotalsStore,
    opts: &TotalsOptions,
) -> Result<TotalsStats> {
    totals.init().await?;
    let mut stats = TotalsStats::default();

    for class in [RecordClass::Countme, RecordClass::UniqueIp] {
        let Some(weeks) = complete_weeks(raw, class, opts.jitter_window_secs).await? else {
            debug!(stream = ?class, "no raw data for stream");
            continue;
        };
        let high_water = totals.max_weeknum(class).await?.unwrap_or(-1);
        let first = weeks.start.max(high_water + 1);
        if first >= weeks.end {
            debug!(stream = ?class, high_water, "no new complete weeks");
            continue;
        }

        let bar = if opts.progress {
            Some(ProgressBar::new((weeks.end - first) as u64))
        } else {
            None
        };

        for week in first..weeks.end {
            if let Some(bar) = &bar {
                let rows = raw.week_count(week, class).await?;
                if let Some((monday, sunday)) = week_date_range(week) {
                    bar.set_message(format!("week {week} ({monday} -- {sunday}): {rows} rows"));
                }
            }

            let rows = match class {
                RecordClass::Countme => raw.week_bucket_counts(week).await?,
                RecordClass::UniqueIp => unique_week_counts(raw, week).await?,
            };
            totals.write_week(&rows).await?;

            match class {
                RecordClass::Countme => {
                    stats.countme_weeks += 1;
                    stats.countme_buckets += rows.len() as u64;
                }
                RecordClass::UniqueIp => {
                    stats.unique_weeks += 1;
                    stats.unique_buckets += rows.len() as u64;
                }
            }
            info!(week, buckets = rows.len(), stream = ?class, "aggregated week");
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
    }

    totals.write_index().await?;
    Ok(stats)
}

/// Count one week of the unique-IP stream.
///
/// The distinct (host, client identity, repo) projection is collected one
/// day slice at a time to bound each query's working set, deduplicated
/// across the whole week in memory, then counted per bucket with the
/// sys_age dimension collapsed to the sentinel.
async fn unique_week_counts(raw: &dyn RawStore, week: i64) -> StorageResult<Vec<TotalsItem>> {
    let start = week_start_timestamp(week);
    let mut seen = HashSet::new();
    for day in 0..7 {
        for row in raw.day_unique_rows(start + day * DAY_SECONDS).await? {
            seen.insert(row);
        }
    }

    let mut counts: HashMap<CountBucket, i64> = HashMap::new();
    for row in seen {
        *counts.entry(row.into_bucket(week)).or_default() += 1;
    }
    Ok(counts
        .into_iter()
        .map(|(bucket, hits)| TotalsItem::from_bucket(bucket, hits))
        .collect())
}
