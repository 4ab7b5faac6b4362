use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CountmeItem, MirrorItem, RecordClass, TotalsItem, UniqueIpRow};

#[derive(Debug, Error)]
pub enum StorageError {
    /// An existing store's column set does not match the expected record
    /// type. Raised when the store is opened, before any row is read, so
    /// columns are never misinterpreted positionally.
    #[error("schema mismatch in table {table}: expected columns {expected:?}, found {found:?}")]
    SchemaMismatch {
        table: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Store of raw countme rows: append-side operations plus the range and
/// grouping queries weekly aggregation is built on.
///
/// Both metric streams (countme and unique-IP) live in one table; queries
/// that care take a [`RecordClass`] filter.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Create the table if it does not exist yet.
    async fn init(&self) -> StorageResult<()>;

    /// Create or refresh the secondary index on the time column.
    async fn write_index(&self) -> StorageResult<()>;

    async fn insert_item(&self, item: &CountmeItem) -> StorageResult<()>;

    /// Bulk insert in a single transaction.
    async fn insert_items(&self, items: &[CountmeItem]) -> StorageResult<()>;

    /// Exact-match lookup across all fields, the dedup primitive.
    async fn has_item(&self, item: &CountmeItem) -> StorageResult<bool>;

    /// Smallest timestamp in the store, optionally restricted to one metric
    /// stream. `None` when the store holds no matching rows.
    async fn min_timestamp(&self, class: Option<RecordClass>) -> StorageResult<Option<i64>>;

    /// Largest timestamp in the store, optionally restricted to one metric
    /// stream. `None` when the store holds no matching rows.
    async fn max_timestamp(&self, class: Option<RecordClass>) -> StorageResult<Option<i64>>;

    /// Number of rows of one stream within a week, for progress reporting.
    async fn week_count(&self, weeknum: i64, class: RecordClass) -> StorageResult<i64>;

    /// Countme-stream rows of one week, grouped into count buckets with the
    /// timestamp projected onto the week number.
    async fn week_bucket_counts(&self, weeknum: i64) -> StorageResult<Vec<TotalsItem>>;

    /// Distinct unique-IP projections for one day slice
    /// (`[day_start, day_start + DAY_SECONDS)`), sentinel rows only.
    async fn day_unique_rows(&self, day_start: i64) -> StorageResult<Vec<UniqueIpRow>>;
}

/// Store of raw mirrorlist/metalink hits (mirrors match mode).
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn init(&self) -> StorageResult<()>;
    async fn write_index(&self) -> StorageResult<()>;
    async fn insert_item(&self, item: &MirrorItem) -> StorageResult<()>;
    async fn insert_items(&self, items: &[MirrorItem]) -> StorageResult<()>;
    async fn has_item(&self, item: &MirrorItem) -> StorageResult<bool>;
}

/// Store of aggregated weekly totals for both metric streams.
#[async_trait]
pub trait TotalsStore: Send + Sync {
    async fn init(&self) -> StorageResult<()>;
    async fn write_index(&self) -> StorageResult<()>;

    /// Write one week's full set of bucket rows in a single transaction.
    /// Re-deriving an already-written week is a no-op, not an error.
    async fn write_week(&self, items: &[TotalsItem]) -> StorageResult<()>;

    /// Highest week number recorded for one metric stream, the incremental
    /// aggregation high-water mark. `None` when the stream has no totals
    /// yet.
    async fn max_weeknum(&self, class: RecordClass) -> StorageResult<Option<i64>>;

    /// All totals rows, ordered by week.
    async fn all_items(&self) -> StorageResult<Vec<TotalsItem>>;
}
