//! Backend handles: one lazily-connected executor per logical database entry.

use crate::cursor::{materialize, RowCursor};
use crate::error::{DataError, Result};
use crate::escape;
use crate::request::Statement;
use crate::types::{BackendKind, Query, Record, Value};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Builds a ready-to-use executor for one backend kind
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Connection target for display purposes (without password)
    fn describe(&self) -> String;

    /// Construct the client and verify it is alive
    async fn connect(&self) -> Result<Arc<dyn Executor>>;
}

/// Query capability of a live backend connection
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a query and return its cursor. `limit` is a fetch hint for backends
    /// that can push it down; the materializer enforces it regardless.
    async fn run_query(
        &self,
        query: &Query,
        params: &[Value],
        limit: usize,
    ) -> Result<Box<dyn RowCursor>>;

    /// Execute a statement, returning the affected count
    async fn run_exec(&self, query: &Query, params: &[Value]) -> Result<u64>;

    /// Execute statements atomically, returning the summed affected count
    async fn run_in_transaction(&self, _statements: &[Statement]) -> Result<u64> {
        Err(DataError::operation_not_supported(
            "transactions are not supported by this backend",
        ))
    }

    /// Release the connection
    async fn close(&self) -> Result<()>;

    /// False once the underlying connection is known to be gone
    fn is_alive(&self) -> bool {
        true
    }
}

enum HandleState {
    Uninitialized,
    Ready(Arc<dyn Executor>),
}

/// One logical database entry with a lazily established connection
pub struct BackendHandle {
    id: String,
    connector: Arc<dyn Connector>,
    state: Mutex<HandleState>,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            id: id.into(),
            connector,
            state: Mutex::new(HandleState::Uninitialized),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.connector.kind()
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, HandleState::Ready(_))
    }

    /// Connect if not yet connected. The lifecycle lock is held across the connect
    /// so concurrent callers never construct a second connection.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.executor().await.map(|_| ())
    }

    async fn executor(&self) -> Result<Arc<dyn Executor>> {
        let mut state = self.state.lock().await;

        if let HandleState::Ready(executor) = &*state {
            if executor.is_alive() {
                return Ok(executor.clone());
            }

            warn!("Connection to target {} was lost, reconnecting", self.id);
            if let Err(e) = executor.close().await {
                debug!("Closing lost connection for {} failed: {}", self.id, e);
            }
            *state = HandleState::Uninitialized;
        }

        debug!(
            "Connecting target {} ({}): {}",
            self.id,
            self.kind(),
            self.describe()
        );

        let executor = self.connector.connect().await.map_err(|e| match e {
            DataError::ConnectionFailed { .. } => e,
            other => DataError::connection_failed(self.kind(), other),
        })?;

        *state = HandleState::Ready(executor.clone());
        debug!("Target {} is ready", self.id);
        Ok(executor)
    }

    /// Run a query and materialize at most `limit` records
    pub async fn materialized_query(
        &self,
        query: &Query,
        params: &[Value],
        limit: usize,
    ) -> Result<Vec<Record>> {
        let executor = self.executor().await?;
        let cursor = executor.run_query(query, params, limit).await?;
        materialize(cursor, limit).await
    }

    /// Execute a statement and return the affected count
    pub async fn exec(&self, query: &Query, params: &[Value]) -> Result<u64> {
        let executor = self.executor().await?;
        executor.run_exec(query, params).await
    }

    /// Execute statements in one transaction; any failure rolls back
    pub async fn exec_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        let executor = self.executor().await?;
        executor.run_in_transaction(statements).await
    }

    /// Generate a 32-character hex id, preferring the backend's own generator
    pub async fn generate_id(&self) -> String {
        if let Some(sql) = id_query(self.kind()) {
            match self.materialized_query(&Query::from(sql), &[], 1).await {
                Ok(records) => {
                    let generated = records
                        .into_iter()
                        .next()
                        .and_then(|record| record.get("id").cloned())
                        .map(|value| value.to_string())
                        .filter(|id| !id.is_empty());
                    if let Some(id) = generated {
                        return id;
                    }
                }
                Err(e) => warn!("Falling back to a local id for {}: {}", self.id, e),
            }
        }

        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Escape a value for text substitution into this backend's query language
    pub fn escape_literal(&self, value: &str) -> String {
        escape::escape_literal(self.kind(), value)
    }

    /// Release the connection. No-op when never connected.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, HandleState::Uninitialized);

        match previous {
            HandleState::Ready(executor) => {
                debug!("Closing target {}", self.id);
                executor.close().await
            }
            HandleState::Uninitialized => Ok(()),
        }
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .finish()
    }
}

fn id_query(kind: BackendKind) -> Option<&'static str> {
    match kind {
        BackendKind::Postgres => Some("SELECT replace(gen_random_uuid()::text, '-', '') AS id"),
        BackendKind::Sqlite => Some("SELECT lower(hex(randomblob(16))) AS id"),
        BackendKind::MongoDb | BackendKind::Elasticsearch | BackendKind::Redis => None,
    }
}
