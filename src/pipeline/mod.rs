//! Ingestion pipeline: drive a matcher over log sources and persist the
//! matched records.
//!
//! With dupcheck on, every record is looked up before being inserted on its
//! own, so re-running over an already-ingested log (after a crash, say) adds
//! nothing. With dupcheck off, records are inserted in transactional batches
//! for throughput; the caller guarantees the inputs don't overlap previous
//! runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use indicatif::ProgressBar;
use tracing::info;

use crate::matcher::{LogEvent, LogMatcher, MatchMode};
use crate::reader::{open_log, LogLines};
use crate::storage::{MirrorStore, RawStore};

/// Rows per transaction for bulk inserts when dupcheck is off.
const INSERT_BATCH_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub dupcheck: bool,
    pub index: bool,
    pub progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            dupcheck: true,
            index: true,
            progress: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub files: usize,
    pub matched: u64,
    pub inserted: u64,
    pub duplicates: u64,
}

fn file_spinner(enabled: bool, path: &Path) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let bar = ProgressBar::new_spinner();
    bar.set_message(path.display().to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    Some(bar)
}

/// Ingest countme-mode records from `paths` into a raw store.
///
/// Absent optional fields are normalized to empty strings before
/// persistence; the raw schema declares every column NOT NULL.
pub async fn ingest_countme(
    paths: &[PathBuf],
    store: &dyn RawStore,
    opts: &IngestOptions,
) -> Result<IngestStats> {
    store.init().await?;
    let mut stats = IngestStats::default();

    for path in paths {
        let bar = file_spinner(opts.progress, path);
        let lines = LogLines::new(open_log(path)?);
        let mut batch = Vec::new();

        for event in LogMatcher::new(MatchMode::Countme).match_lines(lines) {
            let LogEvent::Countme(item) = event? else {
                continue;
            };
            let item = item.normalized();
            stats.matched += 1;

            if opts.dupcheck {
                if store.has_item(&item).await? {
                    stats.duplicates += 1;
                } else {
                    store.insert_item(&item).await?;
                    stats.inserted += 1;
                }
            } else {
                batch.push(item);
                if batch.len() >= INSERT_BATCH_SIZE {
                    store.insert_items(&batch).await?;
                    stats.inserted += batch.len() as u64;
                    batch.clear();
                }
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }

        if !batch.is_empty() {
            store.insert_items(&batch).await?;
            stats.inserted += batch.len() as u64;
        }
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
        stats.files += 1;
        info!(
            path = %path.display(),
            matched = stats.matched,
            inserted = stats.inserted,
            "parsed log file"
        );
    }

    if opts.index {
        store.write_index().await?;
    }
    Ok(stats)
}

/// Ingest mirrors-mode records from `paths` into a mirror store.
pub async fn ingest_mirrors(
    paths: &[PathBuf],
    store: &dyn MirrorStore,
    opts: &IngestOptions,
) -> Result<IngestStats> {
    store.init().await?;
    let mut stats = IngestStats::default();

    for path in paths {
        let bar = file_spinner(opts.progress, path);
        let lines = LogLines::new(open_log(path)?);
        let mut batch = Vec::new();

        for event in LogMatcher::new(MatchMode::Mirrors).match_lines(lines) {
            let LogEvent::Mirror(item) = event? else {
                continue;
            };
            stats.matched += 1;

            if opts.dupcheck {
                if store.has_item(&item).await? {
                    stats.duplicates += 1;
                } else {
                    store.insert_item(&item).await?;
                    stats.inserted += 1;
                }
            } else {
                batch.push(item);
                if batch.len() >= INSERT_BATCH_SIZE {
                    store.insert_items(&batch).await?;
                    stats.inserted += batch.len() as u64;
                    batch.clear();
                }
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }

        if !batch.is_empty() {
            store.insert_items(&batch).await?;
            stats.inserted += batch.len() as u64;
        }
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
        stats.files += 1;
        info!(
            path = %path.display(),
            matched = stats.matched,
            inserted = stats.inserted,
            "parsed log file"
        );
    }

    if opts.index {
        store.write_index().await?;
    }
    Ok(stats)
}
