//! SQLite driver for qbind.

use crate::{
    BindMap, BindValue, ColumnMeta, Connection, Connector, Credentials, DriverError, ExecOptions,
    ResultEnvelope, Row,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{OpenFlags, ToSql};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT_MS: u64 = 100;

#[derive(Clone, Copy, Debug, Default)]
pub enum SqliteOpenMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

pub struct SqliteConn {
    conn: rusqlite::Connection,
}

fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) => {
            DriverError::with_code(err.to_string(), code.extended_code.to_string())
        }
        _ => DriverError::new(err.to_string()),
    }
}

/// Strips the optional `sqlite:` / `sqlite://` scheme from a connection string.
pub fn database_path(connection_string: &str) -> &str {
    let trimmed = connection_string.trim();
    trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed)
}

impl SqliteConn {
    pub fn open(path: &Path, mode: SqliteOpenMode) -> Result<Self, rusqlite::Error> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = rusqlite::Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.pragma_update(None, "query_only", 1)?;
        }
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

fn to_sql_value(value: &BindValue) -> SqlValue {
    match value {
        BindValue::Number(num) if num.fract() == 0.0 && num.abs() < i64::MAX as f64 => {
            SqlValue::Integer(*num as i64)
        }
        BindValue::Number(num) => SqlValue::Real(*num),
        BindValue::Text(text) => SqlValue::Text(text.clone()),
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(num) => num.into(),
        ValueRef::Real(num) => serde_json::Number::from_f64(num)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
        ValueRef::Blob(bytes) => BASE64.encode(bytes).into(),
    }
}

// SQLite is in autocommit mode outside an explicit transaction, which
// `ExecOptions::auto_commit` always asks for.
impl Connection for SqliteConn {
    fn execute(
        &mut self,
        sql: &str,
        binds: &BindMap,
        options: &ExecOptions,
    ) -> Result<ResultEnvelope, DriverError> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        let meta_data = options.extended_metadata.then(|| {
            stmt.columns()
                .iter()
                .map(|column| ColumnMeta {
                    name: column.name().to_string(),
                    db_type: column.decl_type().map(str::to_string),
                })
                .collect::<Vec<_>>()
        });
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let named: Vec<(String, SqlValue)> = binds
            .iter()
            .map(|(name, value)| (format!(":{name}"), to_sql_value(value)))
            .collect();
        let params: Vec<(&str, &dyn ToSql)> = named
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        if columns.is_empty() {
            let affected = stmt.execute(params.as_slice()).map_err(driver_error)?;
            let mut envelope = ResultEnvelope::affected(affected as u64);
            envelope.meta_data = meta_data;
            return Ok(envelope);
        }

        let mut rows = stmt.query(params.as_slice()).map_err(driver_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut record = Row::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                let value = row.get_ref(idx).map_err(driver_error)?;
                record.insert(name.clone(), to_json(value));
            }
            out.push(record);
        }
        Ok(ResultEnvelope::from_rows(out, meta_data))
    }

    fn close(self) -> Result<(), DriverError> {
        self.conn.close().map_err(|(_, err)| driver_error(err))
    }
}

/// Opens a SQLite database named by the connection string. User, password
/// and thin mode do not apply to SQLite and are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteConnector {
    pub mode: SqliteOpenMode,
}

impl Connector for SqliteConnector {
    type Connection = SqliteConn;

    fn connect(&self, credentials: &Credentials) -> Result<SqliteConn, DriverError> {
        let path = database_path(&credentials.connection_string);
        if path.is_empty() {
            return Err(DriverError::new("empty SQLite connection string"));
        }
        SqliteConn::open(Path::new(path), self.mode).map_err(driver_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionResult, ParameterDescriptor, QueryError, QueryOptions, compile, execute};

    fn memory() -> SqliteConn {
        let conn = SqliteConnector::default()
            .connect(&Credentials::new("sqlite::memory:"))
            .expect("open");
        conn.connection()
            .execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, raw BLOB);
                 INSERT INTO t VALUES (1, 'one', 1.5, NULL), (2, 'two', 2.5, x'0102'), (3, 'three', NULL, NULL);",
            )
            .expect("seed");
        conn
    }

    #[test]
    fn connection_string_schemes() {
        assert_eq!(database_path("sqlite::memory:"), ":memory:");
        assert_eq!(database_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(database_path("sqlite:data.db"), "data.db");
        assert_eq!(database_path(" data.db "), "data.db");
    }

    #[test]
    fn expanded_in_list_selects_rows() {
        let compiled = compile(
            "SELECT id, name FROM t WHERE id IN (:ids) ORDER BY id",
            &[ParameterDescriptor::number("ids", "1,3").expanded()],
        )
        .expect("compile");
        let result = execute(memory(), compiled, &QueryOptions::default()).expect("execute");
        let ExecutionResult::RowSet(rows) = result else {
            panic!("expected row set");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[1]["name"], "three");
        let keys: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(keys, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn value_mapping_and_metadata() {
        let compiled = compile(
            "SELECT id, score, raw FROM t WHERE name = :name",
            &[ParameterDescriptor::text("name", "two")],
        )
        .expect("compile");
        let options = QueryOptions {
            include_metadata: true,
            row_limit: 0,
        };
        let ExecutionResult::FullResult(envelope) =
            execute(memory(), compiled, &options).expect("execute")
        else {
            panic!("expected full result");
        };
        assert_eq!(envelope.row_count, 1);
        assert_eq!(envelope.rows[0]["score"], 2.5);
        assert_eq!(envelope.rows[0]["raw"], "AQI=");
        let meta = envelope.meta_data.expect("metadata");
        assert_eq!(meta[0].name, "id");
        assert_eq!(meta[0].db_type.as_deref(), Some("INTEGER"));
        assert_eq!(meta[1].db_type.as_deref(), Some("REAL"));
    }

    #[test]
    fn dml_reports_rows_affected() {
        let compiled = compile(
            "UPDATE t SET name = :name WHERE id IN (:ids)",
            &[
                ParameterDescriptor::text("name", "renamed"),
                ParameterDescriptor::number("ids", "1,2").expanded(),
            ],
        )
        .expect("compile");
        let options = QueryOptions {
            include_metadata: true,
            row_limit: 0,
        };
        let ExecutionResult::FullResult(envelope) =
            execute(memory(), compiled, &options).expect("execute")
        else {
            panic!("expected full result");
        };
        assert_eq!(envelope.rows_affected, Some(2));
        assert!(envelope.rows.is_empty());
    }

    #[test]
    fn driver_errors_surface_as_execution_errors() {
        let compiled = compile("SELECT * FROM missing", &[]).expect("compile");
        let err = execute(memory(), compiled, &QueryOptions::default()).unwrap_err();
        match err {
            QueryError::QueryExecution(cause) => {
                assert!(cause.message.contains("no such table"));
                assert!(cause.code.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fetch_first_clause_is_rejected_by_sqlite() {
        let compiled = compile("SELECT id FROM t", &[])
            .expect("compile")
            .with_row_limit(10);
        let err = execute(memory(), compiled, &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, QueryError::QueryExecution(_)));
    }

    #[test]
    fn empty_connection_string_is_rejected() {
        let err = SqliteConnector::default()
            .connect(&Credentials::new("sqlite:"))
            .err()
            .expect("error");
        assert!(err.message.contains("empty"));
    }
}
