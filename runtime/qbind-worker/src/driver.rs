use qbind_db::postgres::{PgConn, PgConnector, is_postgres_url};
use qbind_db::sqlite::{SqliteConn, SqliteConnector};
use qbind_db::{
    BindMap, Connection, Connector, Credentials, DriverError, ExecOptions, ResultEnvelope,
};

/// Picks the driver from the connection string: Postgres URLs go to
/// Postgres, `sqlite:` strings to SQLite. Anything else is refused so a
/// mistyped name never creates a fresh database file.
#[derive(Clone, Debug, Default)]
pub struct AnyConnector {
    pub sqlite: SqliteConnector,
    pub postgres: PgConnector,
}

pub enum AnyConn {
    Sqlite(SqliteConn),
    Postgres(PgConn),
}

impl Connector for AnyConnector {
    type Connection = AnyConn;

    fn connect(&self, credentials: &Credentials) -> Result<AnyConn, DriverError> {
        let target = credentials.connection_string.trim_start();
        if is_postgres_url(target) {
            self.postgres.connect(credentials).map(AnyConn::Postgres)
        } else if target.starts_with("sqlite:") {
            self.sqlite.connect(credentials).map(AnyConn::Sqlite)
        } else {
            Err(DriverError::new(format!(
                "unsupported connection string '{target}': expected a postgres:// URL or a sqlite: path"
            )))
        }
    }
}

impl Connection for AnyConn {
    fn execute(
        &mut self,
        sql: &str,
        binds: &BindMap,
        options: &ExecOptions,
    ) -> Result<ResultEnvelope, DriverError> {
        match self {
            AnyConn::Sqlite(conn) => conn.execute(sql, binds, options),
            AnyConn::Postgres(conn) => conn.execute(sql, binds, options),
        }
    }

    fn close(self) -> Result<(), DriverError> {
        match self {
            AnyConn::Sqlite(conn) => conn.close(),
            AnyConn::Postgres(conn) => conn.close(),
        }
    }
}
