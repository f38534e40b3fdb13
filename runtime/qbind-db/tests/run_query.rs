#![cfg(feature = "sqlite")]

use qbind_db::sqlite::{SqliteConnector, SqliteOpenMode};
use qbind_db::{
    Connection, Connector, Credentials, ItemPayload, ParameterDescriptor, QueryError,
    QueryOptions, QueryRequest, run_query,
};
use tempfile::TempDir;

fn seeded_db() -> (TempDir, Credentials) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("orders.db");
    let creds = Credentials::new(format!("sqlite:{}", path.display()));
    let conn = SqliteConnector::default().connect(&creds).expect("open");
    conn.connection()
        .execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, category TEXT, total REAL);
             INSERT INTO orders VALUES
               (1, 'acme', 'tools', 10.0),
               (2, 'acme', 'toys', 4.5),
               (3, 'globex', 'tools', 99.0),
               (4, 'initech', 'food', 1.25);",
        )
        .expect("seed");
    conn.close().expect("close");
    (dir, creds)
}

#[test]
fn expanded_list_and_plain_params_together() {
    let (_dir, creds) = seeded_db();
    let request = QueryRequest::new(
        "SELECT id, customer FROM orders WHERE customer IN (:cust) AND category = :cat ORDER BY id",
    )
    .param(ParameterDescriptor::text("cust", "acme,globex").expanded())
    .param(ParameterDescriptor::text("cat", "tools"));

    let items = run_query(&SqliteConnector::default(), &creds, &request).expect("run");
    assert_eq!(items.len(), 2);
    let ids: Vec<_> = items
        .iter()
        .map(|item| match &item.json {
            ItemPayload::Row(row) => row["id"].clone(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![serde_json::json!(1), serde_json::json!(3)]);
}

#[test]
fn no_matching_rows_yields_no_items() {
    let (_dir, creds) = seeded_db();
    let request = QueryRequest::new("SELECT id FROM orders WHERE id IN (:ids)")
        .param(ParameterDescriptor::number("ids", "40,41").expanded());
    let items = run_query(&SqliteConnector::default(), &creds, &request).expect("run");
    assert!(items.is_empty());
}

#[test]
fn metadata_wraps_whole_result() {
    let (_dir, creds) = seeded_db();
    let request = QueryRequest::new("SELECT id, total FROM orders WHERE total > :min ORDER BY id")
        .param(ParameterDescriptor::number("min", "5"))
        .options(QueryOptions {
            include_metadata: true,
            row_limit: 0,
        });
    let items = run_query(&SqliteConnector::default(), &creds, &request).expect("run");
    assert_eq!(items.len(), 1);
    let json = serde_json::to_value(&items[0]).expect("encode");
    assert_eq!(json["json"]["rowCount"], 2);
    assert_eq!(json["json"]["metaData"][1]["name"], "total");
    assert_eq!(json["json"]["rows"][1]["total"], 99.0);
}

#[test]
fn writes_are_committed_immediately() {
    let (_dir, creds) = seeded_db();
    let update = QueryRequest::new("DELETE FROM orders WHERE category = :cat")
        .param(ParameterDescriptor::text("cat", "tools"));
    let items = run_query(&SqliteConnector::default(), &creds, &update).expect("delete");
    assert!(items.is_empty());

    let count = QueryRequest::new("SELECT COUNT(*) AS n FROM orders");
    let items = run_query(&SqliteConnector::default(), &creds, &count).expect("count");
    let json = serde_json::to_value(&items[0]).expect("encode");
    assert_eq!(json["json"]["n"], 2);
}

#[test]
fn read_only_connector_rejects_writes() {
    let (_dir, creds) = seeded_db();
    let connector = SqliteConnector {
        mode: SqliteOpenMode::ReadOnly,
    };
    let request = QueryRequest::new("DELETE FROM orders");
    let err = run_query(&connector, &creds, &request).unwrap_err();
    assert!(matches!(err, QueryError::QueryExecution(_)));
}

#[test]
fn unmatched_placeholder_fails_before_connecting() {
    let creds = Credentials::new("sqlite:/nonexistent/dir/never.db");
    let request = QueryRequest::new("SELECT 1").param(ParameterDescriptor::text("x", "1"));
    let err = run_query(&SqliteConnector::default(), &creds, &request).unwrap_err();
    assert!(matches!(err, QueryError::ParameterBinding { .. }));
}

#[test]
fn missing_database_directory_is_a_connection_error() {
    let creds = Credentials::new("sqlite:/nonexistent/dir/never.db");
    let err = run_query(
        &SqliteConnector::default(),
        &creds,
        &QueryRequest::new("SELECT 1"),
    )
    .unwrap_err();
    assert!(matches!(err, QueryError::Connection(_)));
}
