//! Integration tests for log ingestion against a real SQLite store.

use std::path::PathBuf;

use countme::models::RecordClass;
use countme::pipeline::{ingest_countme, ingest_mirrors, IngestOptions};
use countme::storage::{RawStore, SqliteMirrorStore, SqliteRawStore};
use countme::weeks::week_start_timestamp;

const WEEK: i64 = 2900;

fn log_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .expect("timestamp in range")
        .format("%d/%b/%Y:%H:%M:%S +0000")
        .to_string()
}

fn countme_line(host: &str, timestamp: i64, variant: &str, countme: Option<i64>) -> String {
    let query = match countme {
        Some(age) => format!("repo=fedora-38&arch=x86_64&countme={age}"),
        None => "repo=fedora-38&arch=x86_64".to_string(),
    };
    format!(
        r#"{host} - - [{}] "GET /metalink?{query} HTTP/2.0" 200 4044 "-" "libdnf (Fedora 38; {variant}; Linux.x86_64)""#,
        log_time(timestamp)
    )
}

fn write_log(dir: &tempfile::TempDir, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, lines.join("\n") + "\n").expect("write log fixture");
    path
}

#[tokio::test]
async fn ingesting_twice_with_dupcheck_inserts_once() {
    let dir = tempfile::tempdir().unwrap();
    let start = week_start_timestamp(WEEK);
    let log = write_log(
        &dir,
        "access_log",
        &[
            countme_line("203.0.113.1", start + 10, "workstation", Some(1)),
            countme_line("203.0.113.2", start + 20, "workstation", Some(1)),
            countme_line("203.0.113.3", start + 30, "server", Some(1)),
        ],
    );

    let store = SqliteRawStore::open(&dir.path().join("raw.db"), 2)
        .await
        .unwrap();
    let opts = IngestOptions::default();

    let first = ingest_countme(&[log.clone()], &store, &opts).await.unwrap();
    assert_eq!(first.matched, 3);
    assert_eq!(first.inserted, 3);
    assert_eq!(first.duplicates, 0);

    let second = ingest_countme(&[log], &store, &opts).await.unwrap();
    assert_eq!(second.matched, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 3);

    assert_eq!(store.week_count(WEEK, RecordClass::Countme).await.unwrap(), 3);
}

#[tokio::test]
async fn bulk_mode_inserts_without_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let start = week_start_timestamp(WEEK);
    let log = write_log(
        &dir,
        "access_log",
        &[countme_line("203.0.113.1", start + 10, "workstation", Some(1))],
    );

    let store = SqliteRawStore::open(&dir.path().join("raw.db"), 2)
        .await
        .unwrap();
    let opts = IngestOptions {
        dupcheck: false,
        ..IngestOptions::default()
    };

    ingest_countme(&[log.clone()], &store, &opts).await.unwrap();
    ingest_countme(&[log], &store, &opts).await.unwrap();

    // no existence checks, so the second run duplicates the row
    assert_eq!(store.week_count(WEEK, RecordClass::Countme).await.unwrap(), 2);
}

#[tokio::test]
async fn one_malformed_line_does_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let start = week_start_timestamp(WEEK);
    let bad = countme_line("203.0.113.9", start + 40, "server", Some(7)).replace("countme=7", "countme=pony");
    let log = write_log(
        &dir,
        "access_log",
        &[
            countme_line("203.0.113.1", start + 10, "workstation", Some(1)),
            bad,
            "totally not a log line".to_string(),
            countme_line("203.0.113.2", start + 20, "workstation", Some(1)),
        ],
    );

    let store = SqliteRawStore::open(&dir.path().join("raw.db"), 2)
        .await
        .unwrap();
    let stats = ingest_countme(&[log], &store, &IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(stats.matched, 2);
    assert_eq!(stats.inserted, 2);
}

#[tokio::test]
async fn rows_without_countme_parameter_become_sentinel_rows() {
    let dir = tempfile::tempdir().unwrap();
    let start = week_start_timestamp(WEEK);
    let log = write_log(
        &dir,
        "access_log",
        &[
            countme_line("203.0.113.1", start + 10, "workstation", Some(1)),
            countme_line("203.0.113.2", start + 20, "workstation", None),
        ],
    );

    let store = SqliteRawStore::open(&dir.path().join("raw.db"), 2)
        .await
        .unwrap();
    ingest_countme(&[log], &store, &IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(store.week_count(WEEK, RecordClass::Countme).await.unwrap(), 1);
    assert_eq!(store.week_count(WEEK, RecordClass::UniqueIp).await.unwrap(), 1);

    let min_countme = store
        .min_timestamp(Some(RecordClass::Countme))
        .await
        .unwrap();
    assert_eq!(min_countme, Some(start + 10));
    let min_unique = store
        .min_timestamp(Some(RecordClass::UniqueIp))
        .await
        .unwrap();
    assert_eq!(min_unique, Some(start + 20));
}

#[tokio::test]
async fn empty_store_reports_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRawStore::open(&dir.path().join("raw.db"), 2)
        .await
        .unwrap();
    store.init().await.unwrap();

    assert_eq!(store.min_timestamp(None).await.unwrap(), None);
    assert_eq!(store.max_timestamp(None).await.unwrap(), None);
}

#[tokio::test]
async fn mirrors_mode_ingests_all_hits() {
    let dir = tempfile::tempdir().unwrap();
    let start = week_start_timestamp(WEEK);
    // a curl hit that countme mode would reject
    let curl = format!(
        r#"198.51.100.7 - - [{}] "GET /mirrorlist?repo=epel-9&arch=aarch64 HTTP/1.1" 404 - "-" "curl/7.76.1""#,
        log_time(start + 5)
    );
    // no query string at all, so repo_tag/repo_arch are absent (NULL)
    let bare = format!(
        r#"198.51.100.8 - - [{}] "GET /metalink HTTP/1.1" 200 123 "-" "wget/1.21""#,
        log_time(start + 6)
    );
    let log = write_log(
        &dir,
        "access_log",
        &[
            curl,
            bare,
            countme_line("203.0.113.1", start + 10, "workstation", Some(1)),
        ],
    );

    let store = SqliteMirrorStore::open(&dir.path().join("mirrors.db"), 2)
        .await
        .unwrap();
    let stats = ingest_mirrors(&[log.clone()], &store, &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.matched, 3);
    assert_eq!(stats.inserted, 3);

    // dedup works for rows with absent (NULL) repo values too
    let again = ingest_mirrors(&[log], &store, &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.duplicates, 3);
}
