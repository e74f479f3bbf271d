//! PostgreSQL backend for dbfan-query
//!
//! Provides a `Connector` that opens a `tokio-postgres` client on first use and an
//! `Executor` that streams prepared-statement results through a `RowCursor`.

mod cursor;
mod types;

pub use cursor::PgCursor;
pub use types::{PgParam, PgText};

use async_trait::async_trait;
use dbfan_query::{
    BackendKind, Connector, DataError, Executor, Query, Result, RowCursor, Statement, Value,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

fn default_port() -> u16 {
    5432
}

/// Connection settings for one PostgreSQL target
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// TLS is not available; `true` is rejected at connect time
    #[serde(default)]
    pub ssl_mode: bool,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl PostgresConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            database: database.into(),
            ssl_mode: false,
            connect_timeout_secs: None,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish_non_exhaustive()
    }
}

/// Builds PostgreSQL executors from a `PostgresConfig`
pub struct PostgresConnector {
    config: PostgresConfig,
}

impl PostgresConnector {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn describe(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.config.username, self.config.host, self.config.port, self.config.database
        )
    }

    async fn connect(&self) -> Result<Arc<dyn Executor>> {
        let config = &self.config;

        if config.ssl_mode {
            return Err(DataError::invalid_configuration(
                "ssl_mode = true is not supported, TLS connections are unavailable",
            ));
        }

        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.username)
            .dbname(&config.database)
            .ssl_mode(SslMode::Disable);
        if !config.password.is_empty() {
            pg.password(&config.password);
        }
        if let Some(secs) = config.connect_timeout_secs {
            pg.connect_timeout(Duration::from_secs(secs));
        }

        debug!(
            "Connecting to PostgreSQL: {}@{}:{}/{}",
            config.username, config.host, config.port, config.database
        );

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| DataError::connection_failed(BackendKind::Postgres, e))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        if let Err(e) = client.simple_query("SELECT 1").await {
            driver.abort();
            return Err(DataError::connection_failed(BackendKind::Postgres, e));
        }

        debug!(
            "Successfully connected to PostgreSQL database: {}",
            config.database
        );

        Ok(Arc::new(PostgresExecutor {
            client: Arc::new(RwLock::new(client)),
            driver,
        }))
    }
}

/// A live PostgreSQL connection
pub struct PostgresExecutor {
    client: Arc<RwLock<Client>>,
    driver: JoinHandle<()>,
}

fn bind(params: &[Value]) -> Vec<PgParam> {
    params.iter().cloned().map(PgParam).collect()
}

/// Render a driver error with the server's detail and hint when present
fn describe_error(e: &tokio_postgres::Error) -> String {
    let Some(db_error) = e.as_db_error() else {
        return e.to_string();
    };

    let mut msg = db_error.message().to_string();
    if let Some(detail) = db_error.detail() {
        msg.push_str(&format!("\nDetail: {}", detail));
    }
    if let Some(hint) = db_error.hint() {
        msg.push_str(&format!("\nHint: {}", hint));
    }
    if let Some(position) = db_error.position() {
        msg.push_str(&format!("\nPosition: {:?}", position));
    }
    msg
}

fn query_error(sql: &str, e: tokio_postgres::Error) -> DataError {
    error!("PostgreSQL query failed: {}", e);
    error!("Failed SQL: {}", sql);
    DataError::query_failed(format!("{}\n\nQuery: {}", describe_error(&e), sql))
}

#[async_trait]
impl Executor for PostgresExecutor {
    async fn run_query(
        &self,
        query: &Query,
        params: &[Value],
        _limit: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let sql = query.require_text(BackendKind::Postgres)?;
        let client = self.client.read().await;

        debug!("Executing SQL: {}", sql);

        let statement = client.prepare(sql).await.map_err(|e| query_error(sql, e))?;
        let bound = bind(params);
        let stream = client
            .query_raw(&statement, bound.iter().map(|p| p as &dyn ToSql))
            .await
            .map_err(|e| query_error(sql, e))?;

        Ok(Box::new(PgCursor::new(&statement, stream)))
    }

    async fn run_exec(&self, query: &Query, params: &[Value]) -> Result<u64> {
        let sql = query.require_text(BackendKind::Postgres)?;
        let client = self.client.read().await;
        let bound = bind(params);

        let affected = client
            .execute_raw(sql, bound.iter().map(|p| p as &dyn ToSql))
            .await
            .map_err(|e| query_error(sql, e))?;

        debug!("SQL affected {} rows", affected);
        Ok(affected)
    }

    async fn run_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        let mut client = self.client.write().await;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| DataError::query_failed(format!("BEGIN failed: {}", describe_error(&e))))?;

        let mut total = 0;
        for statement in statements {
            // Dropping the transaction on error rolls it back
            let sql = statement.query.require_text(BackendKind::Postgres)?;
            let bound = bind(&statement.params);
            total += transaction
                .execute_raw(sql, bound.iter().map(|p| p as &dyn ToSql))
                .await
                .map_err(|e| query_error(sql, e))?;
        }

        transaction
            .commit()
            .await
            .map_err(|e| {
                DataError::query_failed(format!("COMMIT failed: {}", describe_error(&e)))
            })?;

        debug!(
            "Committed {} statements, {} rows affected",
            statements.len(),
            total
        );
        Ok(total)
    }

    async fn close(&self) -> Result<()> {
        self.driver.abort();
        Ok(())
    }

    /// The driver task ends when the server closes the connection
    fn is_alive(&self) -> bool {
        !self.driver.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PostgresConfig {
        PostgresConfig::new("db.internal", 5433, "app", "s3cret", "orders")
    }

    #[test]
    fn test_describe_hides_password() {
        let connector = PostgresConnector::new(config());
        let described = connector.describe();
        assert_eq!(described, "postgres://app@db.internal:5433/orders");
        assert!(!format!("{:?}", config()).contains("s3cret"));
    }

    #[test]
    fn test_config_defaults() {
        let config: PostgresConfig = serde_json::from_str(
            r#"{"host": "localhost", "username": "u", "database": "d"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 5432);
        assert!(config.password.is_empty());
        assert!(!config.ssl_mode);
        assert_eq!(config.connect_timeout_secs, None);
    }

    #[tokio::test]
    async fn test_ssl_mode_is_rejected() {
        let mut config = config();
        config.ssl_mode = true;
        let err = PostgresConnector::new(config).connect().await.err().unwrap();
        assert!(matches!(err, DataError::InvalidConfiguration(_)));
    }
}
