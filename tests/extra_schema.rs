use duckdb::types::Value as DbValue;
use duckdb::Connection;
use serde_json::{json, Map, Value as Json};
use tempfile::TempDir;

use walstore::{
    CollectionConfig, CollectionStorage, DatedStorage, StorageDate, StorageError, WalConfig,
};

fn data(value: Json) -> Map<String, Json> {
    value.as_object().cloned().expect("object payload")
}

fn extra(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(n, t)| (n.to_string(), t.to_string()))
        .collect()
}

fn date() -> StorageDate {
    StorageDate::parse("2025-01-15").expect("date")
}

#[test]
fn reserved_name_rejects_construction_in_both_modes() {
    let tmp = TempDir::new().expect("tmp");

    let err = match DatedStorage::open(
        date(),
        "data.duckdb",
        WalConfig {
            base_dir: tmp.path().to_string_lossy().into_owned(),
            extra_schema: extra(&[("timestamp", "string")]),
            ..WalConfig::default()
        },
    ) {
        Ok(_) => panic!("reserved name must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, StorageError::ExtraSchema(_)));

    let err = match CollectionStorage::open(
        date(),
        CollectionConfig {
            base_dir: tmp.path().to_string_lossy().into_owned(),
            extra_schema: extra(&[("collection_name", "string")]),
            ..CollectionConfig::default()
        },
    ) {
        Ok(_) => panic!("reserved name must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, StorageError::ExtraSchema(_)));

    // Rejection precedes any on-disk creation.
    assert!(!tmp.path().join("2025-01-15").exists());
    assert!(!tmp.path().join("storage_history.duckdb").exists());
}

#[test]
fn unknown_type_rejects_construction() {
    let tmp = TempDir::new().expect("tmp");
    let err = match DatedStorage::open(
        date(),
        "data.duckdb",
        WalConfig {
            base_dir: tmp.path().to_string_lossy().into_owned(),
            extra_schema: extra(&[("customer", "weirdtype")]),
            ..WalConfig::default()
        },
    ) {
        Ok(_) => panic!("unknown type must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, StorageError::ExtraSchema(_)));
}

#[test]
fn dated_extra_columns_store_values_and_nulls() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = WalConfig {
        base_dir: tmp.path().to_string_lossy().into_owned(),
        duckdb_flush_interval_seconds: 3600,
        extra_schema: extra(&[
            ("customer_id", "int64"),
            ("price", "float64"),
            ("is_active", "bool"),
            ("notes", "string"),
        ]),
        ..WalConfig::default()
    };

    let storage = DatedStorage::open(date(), "data.duckdb", cfg).expect("open");
    storage
        .store(
            "order_1",
            data(json!({
                "order_name": "Test Order",
                "customer_id": 12345,
                "price": 99.99,
                "is_active": true,
                "notes": "First order",
            })),
            Some("worker1"),
            None,
            None,
        )
        .expect("store full");
    storage
        .store(
            "order_2",
            data(json!({
                "order_name": "Partial Order",
                "customer_id": 67890,
            })),
            Some("worker1"),
            None,
            None,
        )
        .expect("store partial");
    storage.flush_data_to_duckdb().expect("flush");
    storage.close().expect("close");

    let conn =
        Connection::open(tmp.path().join("2025-01-15/data.duckdb")).expect("open database");
    let row = |key: &str| -> (DbValue, DbValue, DbValue, DbValue) {
        conn.query_row(
            "SELECT customer_id, price, is_active, notes FROM storage_data WHERE key = ?",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .expect("row")
    };

    let (customer, price, active, notes) = row("order_1");
    assert!(matches!(customer, DbValue::BigInt(12345)));
    assert!(matches!(price, DbValue::Double(p) if (p - 99.99).abs() < 1e-9));
    assert_eq!(active, DbValue::Boolean(true));
    assert_eq!(notes, DbValue::Text("First order".to_string()));

    let (customer, price, active, notes) = row("order_2");
    assert!(matches!(customer, DbValue::BigInt(67890)));
    assert!(matches!(price, DbValue::Null));
    assert!(matches!(active, DbValue::Null));
    assert!(matches!(notes, DbValue::Null));
}

#[test]
fn collection_extra_columns_reach_history_and_latest() {
    let tmp = TempDir::new().expect("tmp");
    let cfg = CollectionConfig {
        base_dir: tmp.path().to_string_lossy().into_owned(),
        duckdb_flush_interval_seconds: 3600,
        extra_schema: extra(&[
            ("priority", "int32"),
            ("score", "float64"),
            ("category", "string"),
        ]),
        ..CollectionConfig::default()
    };

    let storage = CollectionStorage::open(date(), cfg).expect("open");
    storage
        .store(
            "task_1",
            data(json!({
                "label": "High Priority Task",
                "priority": 1,
                "score": 95.5,
                "category": "urgent",
            })),
            Some("item_a"),
            Some("tasks"),
            Some(100i64.into()),
            None,
            None,
        )
        .expect("store full");
    storage
        .store(
            "task_2",
            data(json!({
                "label": "Low Priority Task",
                "priority": 5,
            })),
            Some("item_b"),
            Some("tasks"),
            Some(50i64.into()),
            None,
            None,
        )
        .expect("store partial");
    storage.close().expect("close");

    for file in ["storage_history.duckdb", "storage_latest.duckdb"] {
        let table = file.trim_end_matches(".duckdb");
        let conn = Connection::open(tmp.path().join(file)).expect("open database");
        let (priority, score, category): (DbValue, DbValue, DbValue) = conn
            .query_row(
                &format!("SELECT priority, score, category FROM {table} WHERE key = 'task_1'"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("task_1 row");
        assert!(matches!(priority, DbValue::Int(1)));
        assert!(matches!(score, DbValue::Double(s) if (s - 95.5).abs() < 1e-9));
        assert_eq!(category, DbValue::Text("urgent".to_string()));

        let (priority, score, category): (DbValue, DbValue, DbValue) = conn
            .query_row(
                &format!("SELECT priority, score, category FROM {table} WHERE key = 'task_2'"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("task_2 row");
        assert!(matches!(priority, DbValue::Int(5)));
        assert!(matches!(score, DbValue::Null));
        assert!(matches!(category, DbValue::Null));
    }
}

#[test]
fn parquet_export_carries_extra_columns() {
    let tmp = TempDir::new().expect("tmp");
    let export_dir = tmp.path().join("parquet_output");
    let cfg = WalConfig {
        base_dir: tmp.path().to_string_lossy().into_owned(),
        duckdb_flush_interval_seconds: 3600,
        parquet_path: Some(export_dir.to_string_lossy().into_owned()),
        extra_schema: extra(&[("customer_id", "int64"), ("price", "float64")]),
        ..WalConfig::default()
    };

    let storage = DatedStorage::open(date(), "data2.duckdb", cfg).expect("open");
    storage
        .store(
            "order_export",
            data(json!({
                "order_name": "Export Test",
                "customer_id": 11111,
                "price": 50.0,
            })),
            Some("exporter"),
            None,
            None,
        )
        .expect("store");
    storage.flush_data_to_duckdb().expect("flush");

    let out = storage
        .export_to_parquet(None)
        .expect("export")
        .expect("data exported");
    assert_eq!(out, export_dir);

    let exported = export_dir.join("process_name=exporter/date=2025-01-15/data.parquet");
    assert!(exported.is_file());

    // Read the exported file back through DuckDB and check the columns.
    let conn = Connection::open_in_memory().expect("memory db");
    let (customer, price): (DbValue, DbValue) = conn
        .query_row(
            &format!(
                "SELECT customer_id, price FROM read_parquet('{}')",
                exported.to_string_lossy()
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("parquet row");
    assert!(matches!(customer, DbValue::BigInt(11111)));
    assert!(matches!(price, DbValue::Double(p) if (p - 50.0).abs() < 1e-9));

    storage.close().expect("close");
}
