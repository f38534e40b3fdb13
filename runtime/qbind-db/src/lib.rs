//! Named-parameter SQL execution for qbind.
//!
//! A query invocation compiles `:name` placeholders into a bind map
//! (expanding comma-separated list parameters into `IN (...)` references),
//! optionally appends a row limit clause, runs the statement on a freshly
//! opened connection and projects the result into output items.

mod compile;
mod connection;
mod error;
mod execute;
mod limit;
mod param;
mod project;
#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub mod postgres;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

use serde::{Deserialize, Serialize};

pub use compile::{BindMap, CompiledQuery, compile};
pub use connection::{
    ColumnMeta, Connection, Connector, Credentials, ExecOptions, ResultEnvelope, Row,
};
pub use error::{DriverError, QueryError};
pub use execute::{ExecutionResult, QueryOptions, execute};
pub use limit::apply_limit;
pub use param::{BindValue, DataType, ParamValue, ParameterDescriptor};
pub use project::{ItemPayload, OutputItem, project};

/// One query invocation as submitted by a host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn param(mut self, param: ParameterDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Compiles, connects, executes and projects one request.
///
/// Compilation runs before the connection is opened, so a binding error
/// never costs a connection.
pub fn run_query<K: Connector>(
    connector: &K,
    credentials: &Credentials,
    request: &QueryRequest,
) -> Result<Vec<OutputItem>, QueryError> {
    let compiled = compile(&request.sql, &request.params)?.with_row_limit(request.options.row_limit);
    tracing::debug!(
        binds = compiled.binds().len(),
        row_limit = request.options.row_limit,
        include_metadata = request.options.include_metadata,
        "running query"
    );
    let connection = connector
        .connect(credentials)
        .map_err(QueryError::Connection)?;
    let result = execute(connection, compiled, &request.options)?;
    Ok(project(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::tests::{MockConn, row};
    use std::cell::Cell;
    use std::sync::atomic::Ordering;

    struct MockConnector {
        conn: MockConn,
        connects: Cell<usize>,
        refuse: bool,
    }

    impl MockConnector {
        fn new(conn: MockConn) -> Self {
            Self {
                conn,
                connects: Cell::new(0),
                refuse: false,
            }
        }
    }

    impl Connector for MockConnector {
        type Connection = MockConn;

        fn connect(&self, _credentials: &Credentials) -> Result<MockConn, DriverError> {
            self.connects.set(self.connects.get() + 1);
            if self.refuse {
                return Err(DriverError::new("listener refused connection"));
            }
            Ok(self.conn.clone())
        }
    }

    #[test]
    fn pipeline_compiles_limits_and_projects() {
        let conn = MockConn {
            rows: vec![row(1), row(2), row(3)],
            ..MockConn::default()
        };
        let seen = conn.seen.clone();
        let closes = conn.closes.clone();
        let connector = MockConnector::new(conn);
        let request = QueryRequest::new("SELECT id FROM t WHERE id IN (:ids)")
            .param(ParameterDescriptor::number("ids", "1,2,3").expanded())
            .options(QueryOptions {
                include_metadata: false,
                row_limit: 100,
            });

        let items = run_query(&connector, &Credentials::default(), &request).expect("run");
        assert_eq!(items.len(), 3);
        assert_eq!(connector.connects.get(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let seen = seen.lock().unwrap();
        let (sql, binds, _) = &seen[0];
        assert!(sql.starts_with("SELECT id FROM t WHERE id IN (:ids"));
        assert!(sql.ends_with(") fetch first 100 rows only"));
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn binding_error_skips_connection() {
        let connector = MockConnector::new(MockConn::default());
        let request = QueryRequest::new("SELECT :n").param(ParameterDescriptor::number("n", "x"));
        let err = run_query(&connector, &Credentials::default(), &request).unwrap_err();
        assert!(matches!(err, QueryError::ParameterBinding { .. }));
        assert_eq!(connector.connects.get(), 0);
    }

    #[test]
    fn connect_failure_is_reported() {
        let mut connector = MockConnector::new(MockConn::default());
        connector.refuse = true;
        let request = QueryRequest::new("SELECT 1 FROM dual");
        let err = run_query(&connector, &Credentials::default(), &request).unwrap_err();
        assert!(matches!(err, QueryError::Connection(_)));
    }

    #[test]
    fn metadata_request_yields_single_item() {
        let connector = MockConnector::new(MockConn::default());
        let request = QueryRequest::new("SELECT 1 FROM dual").options(QueryOptions {
            include_metadata: true,
            row_limit: 0,
        });
        let items = run_query(&connector, &Credentials::default(), &request).expect("run");
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0].json, ItemPayload::Result(_)));
    }

    #[test]
    fn request_decodes_from_host_json() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"sql":"SELECT * FROM t WHERE a = :a","params":[{"name":"a","value":"x"}],"options":{"includeMetadata":true}}"#,
        )
        .expect("decode");
        assert_eq!(request.params.len(), 1);
        assert!(request.options.include_metadata);
        assert_eq!(request.options.row_limit, 0);
    }
}
