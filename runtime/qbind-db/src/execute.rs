//! Query executor with scoped connection release.

use serde::{Deserialize, Serialize};

use crate::{CompiledQuery, Connection, ExecOptions, QueryError, ResultEnvelope, Row};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub include_metadata: bool,
    /// `0` means no limit.
    pub row_limit: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionResult {
    RowSet(Vec<Row>),
    FullResult(ResultEnvelope),
}

/// A connection that is closed exactly once when dropped.
///
/// Release failures are logged and swallowed so they never replace the
/// outcome of the statement that ran on the connection.
struct ScopedConnection<C: Connection> {
    conn: Option<C>,
}

impl<C: Connection> ScopedConnection<C> {
    fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    fn release(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close() {
                let err = QueryError::ConnectionRelease(err);
                tracing::warn!(error = %err, "connection release failed");
            }
        }
    }
}

impl<C: Connection> AsMut<C> for ScopedConnection<C> {
    fn as_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .expect("ScopedConnection value missing (already released)")
    }
}

impl<C: Connection> Drop for ScopedConnection<C> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

/// Runs `query` on `connection` with autocommit and always releases the
/// connection afterwards.
pub fn execute<C: Connection>(
    connection: C,
    query: CompiledQuery,
    options: &QueryOptions,
) -> Result<ExecutionResult, QueryError> {
    let (sql, binds) = query.into_parts();
    let exec_options = ExecOptions {
        auto_commit: true,
        extended_metadata: options.include_metadata,
    };
    let mut scoped = ScopedConnection::new(connection);
    let outcome = scoped.as_mut().execute(&sql, &binds, &exec_options);
    scoped.release();

    let envelope = outcome.map_err(QueryError::QueryExecution)?;
    tracing::debug!(rows = envelope.row_count, "query executed");
    Ok(if options.include_metadata {
        ExecutionResult::FullResult(envelope)
    } else {
        ExecutionResult::RowSet(envelope.rows)
    })
}
