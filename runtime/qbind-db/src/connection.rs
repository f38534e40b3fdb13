//! The connection capability the executor runs against.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{BindMap, DriverError};

/// Column name to value, in select-list order.
pub type Row = IndexMap<String, serde_json::Value>;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub connection_string: String,
    pub thin_mode: bool,
}

impl Credentials {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connection_string", &self.connection_string)
            .field("thin_mode", &self.thin_mode)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecOptions {
    pub auto_commit: bool,
    pub extended_metadata: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_type: Option<String>,
}

/// Full driver result: rows plus counts and, on request, column metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Vec<ColumnMeta>>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl ResultEnvelope {
    pub fn from_rows(rows: Vec<Row>, meta_data: Option<Vec<ColumnMeta>>) -> Self {
        Self {
            meta_data,
            row_count: rows.len(),
            rows,
            rows_affected: None,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }
}

/// A live database connection. `close` consumes it; both calls may fail.
pub trait Connection {
    fn execute(
        &mut self,
        sql: &str,
        binds: &BindMap,
        options: &ExecOptions,
    ) -> Result<ResultEnvelope, DriverError>;

    fn close(self) -> Result<(), DriverError>;
}

/// Opens connections from credentials.
pub trait Connector {
    type Connection: Connection;

    fn connect(&self, credentials: &Credentials) -> Result<Self::Connection, DriverError>;
}
