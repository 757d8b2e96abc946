use duckdb::types::Value as DbValue;
use duckdb::Connection;
use serde_json::{json, Map, Value as Json};
use tempfile::TempDir;

use walstore::{
    check_database_health, CollectionConfig, CollectionStorage, ScalarValue, StorageDate,
    StorageError,
};

fn data(value: Json) -> Map<String, Json> {
    value.as_object().cloned().expect("object payload")
}

fn config(base: &TempDir) -> CollectionConfig {
    CollectionConfig {
        base_dir: base.path().to_string_lossy().into_owned(),
        duckdb_flush_interval_seconds: 3600,
        ..CollectionConfig::default()
    }
}

fn date() -> StorageDate {
    StorageDate::parse("2025-01-15").expect("date")
}

#[test]
fn typed_value_routes_into_exactly_one_column() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = config(&tmp);

    let storage = CollectionStorage::open(date(), cfg).expect("open");
    storage
        .store(
            "p",
            data(json!({"label": "Age"})),
            Some("age"),
            Some("info"),
            Some(32i64.into()),
            None,
            None,
        )
        .expect("store int");
    storage
        .store(
            "p",
            data(json!({"label": "Age"})),
            Some("age"),
            Some("info"),
            Some("thirty".into()),
            None,
            None,
        )
        .expect("store text");
    storage.close().expect("close");

    // History keeps both versions; latest keeps only the newest.
    let history = Connection::open(tmp.path().join("storage_history.duckdb")).expect("history");
    let rows: Vec<(i64, DbValue, DbValue)> = {
        let mut stmt = history
            .prepare(
                "SELECT version, value_int, value_string FROM storage_history \
                 WHERE key = 'p' ORDER BY version",
            )
            .expect("prepare");
        let mut rows = stmt.query([]).expect("query");
        let mut out = Vec::new();
        while let Some(row) = rows.next().expect("row") {
            out.push((
                row.get(0).expect("version"),
                row.get(1).expect("value_int"),
                row.get(2).expect("value_string"),
            ));
        }
        out
    };
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, 1);
    assert!(matches!(rows[0].1, DbValue::BigInt(32)));
    assert!(matches!(rows[0].2, DbValue::Null));
    assert_eq!(rows[1].0, 2);
    assert!(matches!(rows[1].1, DbValue::Null));
    assert_eq!(rows[1].2, DbValue::Text("thirty".to_string()));

    let latest = Connection::open(tmp.path().join("storage_latest.duckdb")).expect("latest");
    let count: i64 = latest
        .query_row("SELECT count(*) FROM storage_latest WHERE key = 'p'", [], |row| {
            row.get(0)
        })
        .expect("count");
    assert_eq!(count, 1);
    let (value_string, value_int, value_float): (DbValue, DbValue, DbValue) = latest
        .query_row(
            "SELECT value_string, value_int, value_float \
             FROM storage_latest WHERE key = 'p'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("latest row");
    assert_eq!(value_string, DbValue::Text("thirty".to_string()));
    assert!(matches!(value_int, DbValue::Null));
    assert!(matches!(value_float, DbValue::Null));
}

#[test]
fn latest_table_feeds_lazy_loads_after_reopen() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = config(&tmp);

    let storage = CollectionStorage::open(date(), cfg.clone()).expect("open");
    storage
        .store(
            "p",
            data(json!({"label": "Name"})),
            Some("name"),
            Some("info"),
            Some("Ada".into()),
            None,
            None,
        )
        .expect("store");
    storage.close().expect("close");

    let reopened = CollectionStorage::open(date(), cfg).expect("reopen");
    // Nothing is scanned at startup; the first read pulls the collection.
    let record = reopened
        .get_item("p", "info", "name")
        .expect("get")
        .expect("lazy-loaded record");
    assert_eq!(record.value, Some(ScalarValue::Text("Ada".to_string())));
    assert_eq!(record.data["label"], "Name");
    assert_eq!(record.version, 1);

    let by_collection = reopened
        .get_key("p", Some("info"))
        .expect("get")
        .expect("collection view");
    assert!(by_collection["info"].contains_key("name"));

    reopened.close().expect("close reopened");
}

#[test]
fn get_key_without_collection_reads_cache_only() {
    let tmp = TempDir::new().expect("tmp");
    let storage = CollectionStorage::open(date(), config(&tmp)).expect("open");

    assert!(storage.get_key("missing", None).expect("get").is_none());

    storage
        .store(
            "p",
            data(json!({"x": 1})),
            Some("i"),
            Some("c"),
            None,
            None,
            None,
        )
        .expect("store");
    let all = storage.get_key("p", None).expect("get").expect("cached key");
    assert!(all["c"].contains_key("i"));

    storage.close().expect("close");
}

#[test]
fn defaults_normalize_to_empty_names_and_recover() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = config(&tmp);
    let storage = CollectionStorage::open(date(), cfg.clone()).expect("open");
    storage
        .store("p", data(json!({"x": 1})), None, None, None, None, None)
        .expect("store with defaults");
    storage.close().expect("close");

    let reopened = CollectionStorage::open(date(), cfg).expect("reopen");
    let record = reopened
        .get_item("p", "", "")
        .expect("get")
        .expect("sentinel identity");
    assert_eq!(record.collection_name, "");
    assert_eq!(record.item_name, "");
    reopened.close().expect("close reopened");
}

#[test]
fn close_backs_up_databases_into_the_date_directory() {
    let tmp = TempDir::new().expect("tmp");
    let storage = CollectionStorage::open(date(), config(&tmp)).expect("open");
    storage
        .store("p", data(json!({"x": 1})), Some("i"), Some("c"), None, None, None)
        .expect("store");
    storage.close().expect("close");

    let backup_dir = tmp.path().join("2025-01-15");
    assert!(backup_dir.join("storage_history.duckdb.backup").exists());
    assert!(backup_dir.join("storage_latest.duckdb.backup").exists());
}

#[test]
fn retention_prunes_directories_older_than_the_window() {
    let tmp = TempDir::new().expect("tmp");
    for dir in ["2025-12-20", "2025-12-22", "2025-12-23", "notes"] {
        std::fs::create_dir_all(tmp.path().join(dir)).expect("seed dir");
    }

    let cfg = CollectionConfig {
        retain_days: 3,
        ..config(&tmp)
    };
    let storage =
        CollectionStorage::open(StorageDate::parse("2025-12-24").expect("date"), cfg)
            .expect("open");
    storage.close().expect("close");

    assert!(!tmp.path().join("2025-12-20").exists());
    assert!(tmp.path().join("2025-12-22").exists());
    assert!(tmp.path().join("2025-12-23").exists());
    assert!(tmp.path().join("2025-12-24").exists());
    // Non-date directories are not retention's business.
    assert!(tmp.path().join("notes").exists());
}

#[test]
fn rebuild_latest_from_history_is_idempotent() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = config(&tmp);
    let storage = CollectionStorage::open(date(), cfg).expect("open");
    for n in 1..=3i64 {
        storage
            .store(
                "p",
                data(json!({"n": n})),
                Some("i"),
                Some("c"),
                Some(n.into()),
                None,
                None,
            )
            .expect("store");
    }
    storage.flush_data_to_duckdb().expect("flush");

    let first = storage.rebuild_latest_from_history().expect("rebuild");
    let second = storage.rebuild_latest_from_history().expect("rebuild again");
    assert_eq!(first, 1);
    assert_eq!(second, first);

    let record = storage
        .get_item("p", "c", "i")
        .expect("get")
        .expect("record");
    assert_eq!(record.version, 3);
    assert_eq!(record.value, Some(ScalarValue::Int(3)));

    storage.close().expect("close");
}

#[test]
fn health_check_accepts_absent_and_healthy_files() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = config(&tmp);

    assert!(check_database_health(
        &tmp.path().join("storage_history.duckdb"),
        "storage_history",
        None,
    ));

    let storage = CollectionStorage::open(date(), cfg).expect("open");
    storage
        .store("p", data(json!({"x": 1})), Some("i"), Some("c"), None, None, None)
        .expect("store");
    storage.close().expect("close");

    assert!(check_database_health(
        &tmp.path().join("storage_history.duckdb"),
        "storage_history",
        None,
    ));
    // A wrong table name is a failed probe.
    assert!(!check_database_health(
        &tmp.path().join("storage_history.duckdb"),
        "no_such_table",
        None,
    ));
}

#[test]
fn store_after_close_is_rejected() {
    let tmp = TempDir::new().expect("tmp");
    let storage = CollectionStorage::open(date(), config(&tmp)).expect("open");
    storage.close().expect("close");
    let err = storage
        .store("p", data(json!({"x": 1})), None, None, None, None, None)
        .expect_err("store after close");
    assert!(matches!(err, StorageError::ReadOnly));
}
