use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::{
    ColumnSpec, CountmeItem, MirrorItem, RecordClass, TotalsItem, UniqueIpRow,
    COUNTME_RAW_COLUMNS, COUNTME_RAW_TABLE, COUNTME_TOTALS_COLUMNS, COUNTME_TOTALS_TABLE,
    MIRRORS_RAW_COLUMNS, MIRRORS_RAW_TABLE,
};
use crate::storage::{MirrorStore, RawStore, StorageError, StorageResult, TotalsStore};
use crate::weeks::{week_start_timestamp, COUNTME_EPOCH, DAY_SECONDS, WEEK_SECONDS};

fn db_err(err: sqlx::Error) -> StorageError {
    StorageError::Other(err.into())
}

async fn open_pool(
    path: &Path,
    max_connections: u32,
    create_if_missing: bool,
) -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create_if_missing);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(db_err)
}

/// Compare an existing table's columns against the record type's static
/// column table. A missing table passes unless `require_table` is set
/// (readers need the table to exist; writers create it in `init`).
async fn check_schema(
    pool: &SqlitePool,
    table: &str,
    columns: &[ColumnSpec],
    require_table: bool,
) -> StorageResult<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info('{table}')"))
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    let found: Vec<String> = rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();
    let expected: Vec<String> = columns.iter().map(|(name, _)| (*name).to_string()).collect();

    if found.is_empty() && !require_table {
        return Ok(());
    }
    if found != expected {
        return Err(StorageError::SchemaMismatch {
            table: table.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn create_table_sql(table: &str, columns: &[ColumnSpec], unique_all: bool) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|(name, sql_type)| format!("{name} {sql_type}"))
        .collect();
    if unique_all {
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        defs.push(format!("UNIQUE({})", names.join(", ")));
    }
    format!("CREATE TABLE IF NOT EXISTS {table} ({})", defs.join(", "))
}

fn insert_sql(table: &str, columns: &[ColumnSpec], or_ignore: bool) -> String {
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    format!(
        "INSERT {}INTO {table} ({}) VALUES ({})",
        if or_ignore { "OR IGNORE " } else { "" },
        names.join(", "),
        placeholders.join(", ")
    )
}

fn index_sql(table: &str, timefield: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS {timefield}_idx ON {table} ({timefield})")
}

// ===== raw countme store =====

pub struct SqliteRawStore {
    pool: SqlitePool,
}

impl SqliteRawStore {
    /// Open (creating the file if needed) for ingestion. The schema of an
    /// existing table is verified before anything else happens.
    pub async fn open(path: &Path, max_connections: u32) -> StorageResult<Self> {
        let pool = open_pool(path, max_connections, true).await?;
        check_schema(&pool, COUNTME_RAW_TABLE, COUNTME_RAW_COLUMNS, false).await?;
        Ok(Self { pool })
    }

    /// Open an existing store for aggregation. The table must exist and
    /// match the expected schema.
    pub async fn open_existing(path: &Path, max_connections: u32) -> StorageResult<Self> {
        let pool = open_pool(path, max_connections, false).await?;
        check_schema(&pool, COUNTME_RAW_TABLE, COUNTME_RAW_COLUMNS, true).await?;
        Ok(Self { pool })
    }

    async fn timestamp_extremum(
        &self,
        func: &str,
        class: Option<RecordClass>,
    ) -> StorageResult<Option<i64>> {
        let sql = match class {
            Some(class) => format!(
                "SELECT {func}(timestamp) FROM {COUNTME_RAW_TABLE} WHERE {}",
                class.sql_predicate()
            ),
            None => format!("SELECT {func}(timestamp) FROM {COUNTME_RAW_TABLE}"),
        };
        sqlx::query_scalar::<_, Option<i64>>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}

fn bind_countme<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    item: &'q CountmeItem,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(item.timestamp)
        .bind(&item.host)
        .bind(&item.os_name)
        .bind(&item.os_version)
        .bind(&item.os_variant)
        .bind(&item.os_arch)
        .bind(item.sys_age)
        .bind(item.repo_tag.as_deref())
        .bind(item.repo_arch.as_deref())
}

#[async_trait]
impl RawStore for SqliteRawStore {
    async fn init(&self) -> StorageResult<()> {
        sqlx::query(&create_table_sql(
            COUNTME_RAW_TABLE,
            COUNTME_RAW_COLUMNS,
            false,
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_index(&self) -> StorageResult<()> {
        sqlx::query(&index_sql(COUNTME_RAW_TABLE, "timestamp"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_item(&self, item: &CountmeItem) -> StorageResult<()> {
        let sql = insert_sql(COUNTME_RAW_TABLE, COUNTME_RAW_COLUMNS, false);
        bind_countme(sqlx::query(&sql), item)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_items(&self, items: &[CountmeItem]) -> StorageResult<()> {
        let sql = insert_sql(COUNTME_RAW_TABLE, COUNTME_RAW_COLUMNS, false);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for item in items {
            bind_countme(sqlx::query(&sql), item)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn has_item(&self, item: &CountmeItem) -> StorageResult<bool> {
        let condition: Vec<String> = COUNTME_RAW_COLUMNS
            .iter()
            .map(|(name, _)| format!("{name} = ?"))
            .collect();
        let sql = format!(
            "SELECT COUNT(*) FROM {COUNTME_RAW_TABLE} WHERE {}",
            condition.join(" AND ")
        );
        let count: i64 = bind_countme(sqlx::query(&sql), item)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get(0);
        Ok(count > 0)
    }

    async fn min_timestamp(&self, class: Option<RecordClass>) -> StorageResult<Option<i64>> {
        self.timestamp_extremum("MIN", class).await
    }

    async fn max_timestamp(&self, class: Option<RecordClass>) -> StorageResult<Option<i64>> {
        self.timestamp_extremum("MAX", class).await
    }

    async fn week_count(&self, weeknum: i64, class: RecordClass) -> StorageResult<i64> {
        let start = week_start_timestamp(weeknum);
        let sql = format!(
            "SELECT COUNT(*) FROM {COUNTME_RAW_TABLE} \
             WHERE timestamp >= ? AND timestamp < ? AND {}",
            class.sql_predicate()
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(start)
            .bind(start + WEEK_SECONDS)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn week_bucket_counts(&self, weeknum: i64) -> StorageResult<Vec<TotalsItem>> {
        let start = week_start_timestamp(weeknum);
        let sql = format!(
            "SELECT COUNT(*) AS hits, \
             (timestamp - {COUNTME_EPOCH}) / {WEEK_SECONDS} AS weeknum, \
             os_name, os_version, os_variant, os_arch, sys_age, repo_tag, repo_arch \
             FROM {COUNTME_RAW_TABLE} \
             WHERE timestamp >= ? AND timestamp < ? AND {} \
             GROUP BY weeknum, os_name, os_version, os_variant, os_arch, sys_age, \
             repo_tag, repo_arch",
            RecordClass::Countme.sql_predicate()
        );
        sqlx::query_as::<_, TotalsItem>(&sql)
            .bind(start)
            .bind(start + WEEK_SECONDS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn day_unique_rows(&self, day_start: i64) -> StorageResult<Vec<UniqueIpRow>> {
        let sql = format!(
            "SELECT DISTINCT host, os_name, os_version, os_variant, os_arch, \
             repo_tag, repo_arch \
             FROM {COUNTME_RAW_TABLE} \
             WHERE timestamp >= ? AND timestamp < ? AND {}",
            RecordClass::UniqueIp.sql_predicate()
        );
        sqlx::query_as::<_, UniqueIpRow>(&sql)
            .bind(day_start)
            .bind(day_start + DAY_SECONDS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}

// ===== raw mirror store =====

pub struct SqliteMirrorStore {
    pool: SqlitePool,
}

impl SqliteMirrorStore {
    pub async fn open(path: &Path, max_connections: u32) -> StorageResult<Self> {
        let pool = open_pool(path, max_connections, true).await?;
        check_schema(&pool, MIRRORS_RAW_TABLE, MIRRORS_RAW_COLUMNS, false).await?;
        Ok(Self { pool })
    }
}

fn bind_mirror<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    item: &'q MirrorItem,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(item.timestamp)
        .bind(&item.host)
        .bind(item.repo_tag.as_deref())
        .bind(item.repo_arch.as_deref())
}

#[async_trait]
impl MirrorStore for SqliteMirrorStore {
    async fn init(&self) -> StorageResult<()> {
        sqlx::query(&create_table_sql(
            MIRRORS_RAW_TABLE,
            MIRRORS_RAW_COLUMNS,
            false,
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_index(&self) -> StorageResult<()> {
        sqlx::query(&index_sql(MIRRORS_RAW_TABLE, "timestamp"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_item(&self, item: &MirrorItem) -> StorageResult<()> {
        let sql = insert_sql(MIRRORS_RAW_TABLE, MIRRORS_RAW_COLUMNS, false);
        bind_mirror(sqlx::query(&sql), item)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_items(&self, items: &[MirrorItem]) -> StorageResult<()> {
        let sql = insert_sql(MIRRORS_RAW_TABLE, MIRRORS_RAW_COLUMNS, false);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for item in items {
            bind_mirror(sqlx::query(&sql), item)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn has_item(&self, item: &MirrorItem) -> StorageResult<bool> {
        // IS instead of = so absent repo values (NULL) still compare equal.
        let condition: Vec<String> = MIRRORS_RAW_COLUMNS
            .iter()
            .map(|(name, _)| format!("{name} IS ?"))
            .collect();
        let sql = format!(
            "SELECT COUNT(*) FROM {MIRRORS_RAW_TABLE} WHERE {}",
            condition.join(" AND ")
        );
        let count: i64 = bind_mirror(sqlx::query(&sql), item)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get(0);
        Ok(count > 0)
    }
}

// ===== totals store =====

pub struct SqliteTotalsStore {
    pool: SqlitePool,
}

impl SqliteTotalsStore {
    pub async fn open(path: &Path, max_connections: u32) -> StorageResult<Self> {
        let pool = open_pool(path, max_connections, true).await?;
        check_schema(&pool, COUNTME_TOTALS_TABLE, COUNTME_TOTALS_COLUMNS, false).await?;
        Ok(Self { pool })
    }
}

fn bind_totals<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    item: &'q TotalsItem,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(item.hits)
        .bind(item.weeknum)
        .bind(&item.os_name)
        .bind(&item.os_version)
        .bind(&item.os_variant)
        .bind(&item.os_arch)
        .bind(item.sys_age)
        .bind(&item.repo_tag)
        .bind(&item.repo_arch)
}

#[async_trait]
impl TotalsStore for SqliteTotalsStore {
    async fn init(&self) -> StorageResult<()> {
        sqlx::query(&create_table_sql(
            COUNTME_TOTALS_TABLE,
            COUNTME_TOTALS_COLUMNS,
            true,
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_index(&self) -> StorageResult<()> {
        sqlx::query(&index_sql(COUNTME_TOTALS_TABLE, "weeknum"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn write_week(&self, items: &[TotalsItem]) -> StorageResult<()> {
        let sql = insert_sql(COUNTME_TOTALS_TABLE, COUNTME_TOTALS_COLUMNS, true);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for item in items {
            bind_totals(sqlx::query(&sql), item)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn max_weeknum(&self, class: RecordClass) -> StorageResult<Option<i64>> {
        let sql = format!(
            "SELECT MAX(weeknum) FROM {COUNTME_TOTALS_TABLE} WHERE {}",
            class.sql_predicate()
        );
        sqlx::query_scalar::<_, Option<i64>>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn all_items(&self) -> StorageResult<Vec<TotalsItem>> {
        let names: Vec<&str> = COUNTME_TOTALS_COLUMNS
            .iter()
            .map(|(name, _)| *name)
            .collect();
        let sql = format!(
            "SELECT {} FROM {COUNTME_TOTALS_TABLE} ORDER BY weeknum",
            names.join(", ")
        );
        sqlx::query_as::<_, TotalsItem>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}
