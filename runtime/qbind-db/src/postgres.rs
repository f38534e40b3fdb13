//! Postgres driver for qbind.
//!
//! Each `PgConn` owns a current-thread tokio runtime that drives the
//! connection task, so the blocking `Connection` calls can sit on top of
//! `tokio-postgres`. Named `:name` placeholders are rewritten to `$n` before
//! the statement is prepared, and bind values are converted to the types the
//! server inferred for each parameter.

use bytes::BytesMut;
use crate::compile::is_ident_char;
use crate::{
    BindMap, BindValue, ColumnMeta, Connection, Connector, Credentials, DriverError, ExecOptions,
    ResultEnvelope, Row,
};
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{Format, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

#[derive(Clone, Debug)]
pub struct PgConnector {
    pub connect_timeout: Duration,
    /// Extra PEM root certificate trusted next to the native roots.
    pub ssl_root_cert: Option<PathBuf>,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            ssl_root_cert: None,
        }
    }
}

pub struct PgConn {
    runtime: Runtime,
    client: Client,
    driver: JoinHandle<()>,
}

fn driver_error(err: tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db) => DriverError::with_code(db.message(), db.code().code()),
        None => DriverError::new(err.to_string()),
    }
}

/// Is `connection_string` a Postgres URL?
pub fn is_postgres_url(connection_string: &str) -> bool {
    let trimmed = connection_string.trim_start();
    trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://")
}

impl Connector for PgConnector {
    type Connection = PgConn;

    fn connect(&self, credentials: &Credentials) -> Result<PgConn, DriverError> {
        let mut config = Config::from_str(&credentials.connection_string)
            .map_err(|err| DriverError::new(format!("invalid Postgres DSN: {err}")))?;
        if !credentials.user.is_empty() {
            config.user(credentials.user.as_str());
        }
        if !credentials.password.is_empty() {
            config.password(credentials.password.as_str());
        }
        config.connect_timeout(self.connect_timeout);

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| DriverError::new(format!("failed to start Postgres runtime: {err}")))?;
        let (client, driver) = if config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = runtime
                .block_on(config.connect(NoTls))
                .map_err(driver_error)?;
            let driver = runtime.spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(error = %err, "Postgres connection error");
                }
            });
            (client, driver)
        } else {
            let tls = build_tls_connector(self.ssl_root_cert.as_deref())?;
            let (client, connection) = runtime
                .block_on(config.connect(tls))
                .map_err(driver_error)?;
            let driver = runtime.spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(error = %err, "Postgres connection error");
                }
            });
            (client, driver)
        };
        Ok(PgConn {
            runtime,
            client,
            driver,
        })
    }
}

// tokio-postgres runs each statement outside a transaction unless one is
// opened explicitly, which gives the autocommit `ExecOptions` asks for.
impl Connection for PgConn {
    fn execute(
        &mut self,
        sql: &str,
        binds: &BindMap,
        options: &ExecOptions,
    ) -> Result<ResultEnvelope, DriverError> {
        let (text, order) = positional_sql(sql, binds);
        let client = &self.client;
        self.runtime.block_on(async {
            let statement = client.prepare(&text).await.map_err(driver_error)?;
            if statement.params().len() != order.len() {
                return Err(DriverError::new(format!(
                    "statement expects {} parameters, {} bound",
                    statement.params().len(),
                    order.len()
                )));
            }
            let mut params = Vec::with_capacity(order.len());
            for (name, ty) in order.iter().zip(statement.params()) {
                let value = binds
                    .get(name)
                    .ok_or_else(|| DriverError::new(format!("no bind value for :{name}")))?;
                params.push(to_pg_param(name, value, ty)?);
            }
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|param| &**param as &(dyn ToSql + Sync))
                .collect();

            let meta_data = options.extended_metadata.then(|| {
                statement
                    .columns()
                    .iter()
                    .map(|column| ColumnMeta {
                        name: column.name().to_string(),
                        db_type: Some(column.type_().name().to_string()),
                    })
                    .collect::<Vec<_>>()
            });

            if statement.columns().is_empty() {
                let affected = client
                    .execute(&statement, &refs)
                    .await
                    .map_err(driver_error)?;
                let mut envelope = ResultEnvelope::affected(affected);
                envelope.meta_data = meta_data;
                return Ok(envelope);
            }

            let rows = client
                .query(&statement, &refs)
                .await
                .map_err(driver_error)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut record = Row::with_capacity(row.len());
                for (idx, column) in row.columns().iter().enumerate() {
                    record.insert(
                        column.name().to_string(),
                        column_value(row, idx, column.type_())?,
                    );
                }
                out.push(record);
            }
            Ok(ResultEnvelope::from_rows(out, meta_data))
        })
    }

    fn close(self) -> Result<(), DriverError> {
        let PgConn {
            runtime,
            client,
            driver,
        } = self;
        drop(client);
        runtime
            .block_on(driver)
            .map_err(|err| DriverError::new(format!("Postgres connection task failed: {err}")))
    }
}

/// Rewrites `:name` placeholders that have a bind value into `$n`, skipping
/// quoted text and `::` casts. Repeated names share one position.
fn positional_sql(sql: &str, binds: &BindMap) -> (String, Vec<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                out.push(ch);
            }
            ':' if matches!(chars.peek(), Some((_, ':'))) => {
                chars.next();
                out.push_str("::");
            }
            ':' => {
                let start = idx + 1;
                let mut end = start;
                while let Some(&(pos, next)) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    end = pos + next.len_utf8();
                    chars.next();
                }
                let name = &sql[start..end];
                if binds.contains_key(name) {
                    let position = match order.iter().position(|seen| seen == name) {
                        Some(found) => found + 1,
                        None => {
                            order.push(name.to_string());
                            order.len()
                        }
                    };
                    out.push_str(&format!("${position}"));
                } else {
                    out.push(':');
                    out.push_str(name);
                }
            }
            _ => out.push(ch),
        }
    }
    (out, order)
}

fn integral<T: TryFrom<i64>>(name: &str, num: f64) -> Result<T, DriverError> {
    let out_of_range =
        || DriverError::new(format!("parameter :{name} value {num} does not fit the column type"));
    if num.fract() != 0.0 || num.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    T::try_from(num as i64).map_err(|_| out_of_range())
}

/// A value sent in the text wire format; the server parses it as whatever
/// type it inferred for the parameter.
#[derive(Debug)]
struct TextParam(String);

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        out.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

fn to_pg_param(name: &str, value: &BindValue, ty: &Type) -> Result<Box<dyn ToSql + Sync>, DriverError> {
    let num = match value {
        BindValue::Text(text) => return Ok(Box::new(TextParam(text.clone()))),
        BindValue::Number(num) => *num,
    };
    let param: Box<dyn ToSql + Sync> = match ty.name() {
        "int2" => Box::new(integral::<i16>(name, num)?),
        "int4" => Box::new(integral::<i32>(name, num)?),
        "int8" => Box::new(integral::<i64>(name, num)?),
        "float4" => Box::new(num as f32),
        "float8" => Box::new(num),
        // numeric, text and anything else take the decimal text form
        _ => Box::new(TextParam(num.to_string())),
    };
    Ok(param)
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, DriverError> {
    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::from)),
        "int2" => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(Value::from)),
        "int4" => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(Value::from)),
        "int8" => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::from)),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|num| Value::from(f64::from(num)))),
        "float8" => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::from)),
        "json" | "jsonb" => row.try_get::<_, Option<Value>>(idx),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(|id| Value::from(id.to_string()))),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(|date| Value::from(date.to_string()))),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|ts| Value::from(ts.to_string()))),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|ts| Value::from(ts.to_rfc3339()))),
        // Text-like types decode as strings; anything else becomes null.
        _ => {
            return Ok(row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null));
        }
    };
    value
        .map(|v| v.unwrap_or(Value::Null))
        .map_err(driver_error)
}

fn build_tls_connector(extra_root: Option<&Path>) -> Result<MakeRustlsConnect, DriverError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(error = %err, "failed to load a native root certificate");
    }
    roots.add_parsable_certificates(native.certs);
    if let Some(path) = extra_root {
        let pem = std::fs::read(path)
            .map_err(|err| DriverError::new(format!("failed to read {}: {err}", path.display())))?;
        let mut cursor = std::io::Cursor::new(pem);
        let certs = rustls_pemfile::certs(&mut cursor)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| DriverError::new(err.to_string()))?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|err| DriverError::new(err.to_string()))?;
        }
    }
    if roots.is_empty() {
        return Err(DriverError::new("no root certificates available for TLS"));
    }
    let tls_config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|err| DriverError::new(err.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}
