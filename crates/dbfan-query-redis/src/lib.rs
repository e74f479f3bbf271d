//! Redis backend for dbfan-query
//!
//! A query is a command line such as `HGETALL user:1` or `LRANGE jobs 0 -1`,
//! with bound params appended as extra arguments. Replies are flattened into
//! records:
//! - nil: no records
//! - array or set: one `{value}` record per element
//! - map (and `HGETALL` pairs): one `{field, value}` record per entry
//! - anything else: a single `{value}` record
//!
//! With `sentinel` configured, the master address is looked up from the
//! sentinels on every connect.

use async_trait::async_trait;
use dbfan_query::{
    BackendKind, BufferedCursor, Connector, DataError, Executor, Query, Result, RowCursor,
    Statement, Value,
};
use redis::aio::ConnectionManager;
use redis::{Cmd, IntoConnectionInfo, RedisError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

fn default_host() -> String {
    "localhost:6379".to_string()
}

/// Sentinels that know the current master of a monitored group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// `host:port` of each sentinel, asked in order
    pub addresses: Vec<String>,
    pub master_name: String,
}

/// Connection settings for one Redis target. `url` wins over `host`/`db`;
/// `sentinel` wins over both, connecting to the resolved master's `db`.
#[derive(Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            db: 0,
            password: None,
            sentinel: None,
        }
    }
}

impl RedisConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_sentinel(
        mut self,
        addresses: Vec<String>,
        master_name: impl Into<String>,
    ) -> Self {
        self.sentinel = Some(SentinelConfig {
            addresses,
            master_name: master_name.into(),
        });
        self
    }

    /// Client for `host`, or for the configured address when `None`
    fn client(&self, host: Option<&str>) -> Result<redis::Client> {
        let info = match (&self.url, host) {
            (Some(url), None) => url.as_str().into_connection_info(),
            (_, host) => format!("redis://{}/{}", host.unwrap_or(self.host.as_str()), self.db)
                .into_connection_info(),
        };

        let mut info = info.map_err(|e| {
            DataError::invalid_configuration(format!("Invalid Redis address: {}", e))
        })?;
        if self.password.is_some() {
            info.redis.password = self.password.clone();
        }

        redis::Client::open(info).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            DataError::connection_failed(BackendKind::Redis, e)
        })
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("db", &self.db)
            .field("has_url", &self.url.is_some())
            .field("sentinel", &self.sentinel)
            .finish_non_exhaustive()
    }
}

/// `host:port` of the master from a `SENTINEL get-master-addr-by-name` reply
fn master_address(reply: Option<(String, u16)>) -> Option<String> {
    reply.map(|(ip, port)| format!("{}:{}", ip, port))
}

/// Ask each sentinel in turn for the master's address
async fn resolve_master(sentinel: &SentinelConfig) -> Result<String> {
    if sentinel.addresses.is_empty() {
        return Err(DataError::invalid_configuration(
            "Redis sentinel needs at least one address",
        ));
    }

    let mut last_error = String::new();
    for address in &sentinel.addresses {
        debug!("Asking sentinel {} for master {}", address, sentinel.master_name);

        let client = match redis::Client::open(format!("redis://{}", address)) {
            Ok(client) => client,
            Err(e) => {
                warn!("Invalid sentinel address {}: {}", address, e);
                last_error = format!("{}: {}", address, e);
                continue;
            }
        };

        let reply = match client.get_multiplexed_async_connection().await {
            Ok(mut connection) => {
                redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(&sentinel.master_name)
                    .query_async::<Option<(String, u16)>>(&mut connection)
                    .await
            }
            Err(e) => Err(e),
        };

        match reply.map(master_address) {
            Ok(Some(master)) => {
                debug!(
                    "Sentinel {} reports master {} at {}",
                    address, sentinel.master_name, master
                );
                return Ok(master);
            }
            Ok(None) => {
                warn!("Sentinel {} does not know master {}", address, sentinel.master_name);
                last_error = format!("{} does not know {}", address, sentinel.master_name);
            }
            Err(e) => {
                warn!("Sentinel {} unreachable: {}", address, e);
                last_error = format!("{}: {}", address, e);
            }
        }
    }

    error!("No sentinel resolved master {}", sentinel.master_name);
    Err(DataError::connection_failed(
        BackendKind::Redis,
        format!("no sentinel resolved master {} ({})", sentinel.master_name, last_error),
    ))
}

pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn describe(&self) -> String {
        if let Some(sentinel) = &self.config.sentinel {
            return format!(
                "redis+sentinel://{}/{}/{}",
                sentinel.addresses.join(","),
                sentinel.master_name,
                self.config.db
            );
        }

        match &self.config.url {
            Some(url) => match (url.find("://"), url.rfind('@')) {
                (Some(scheme_end), Some(at)) if at > scheme_end => {
                    format!("{}{}", &url[..scheme_end + 3], &url[at + 1..])
                }
                _ => url.clone(),
            },
            None => format!("redis://{}/{}", self.config.host, self.config.db),
        }
    }

    async fn connect(&self) -> Result<Arc<dyn Executor>> {
        debug!("Creating Redis client for {}", self.describe());

        let client = match &self.config.sentinel {
            Some(sentinel) => {
                let master = resolve_master(sentinel).await?;
                self.config.client(Some(&master))?
            }
            None => self.config.client(None)?,
        };
        let mut connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            DataError::connection_failed(BackendKind::Redis, e)
        })?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|e| DataError::connection_failed(BackendKind::Redis, e))?;

        debug!("Redis client created successfully");

        Ok(Arc::new(RedisExecutor { connection }))
    }
}

pub struct RedisExecutor {
    connection: ConnectionManager,
}

/// Split a command line into a command with its arguments, params appended
fn build_command(line: &str, params: &[Value]) -> Result<(String, Cmd)> {
    let mut parts = line.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| DataError::invalid_query("Empty Redis command"))?
        .to_ascii_uppercase();

    let mut cmd = redis::cmd(&name);
    for part in parts {
        cmd.arg(part);
    }
    for param in params {
        match param {
            Value::Null => cmd.arg(""),
            Value::Bool(b) => cmd.arg(i64::from(*b)),
            Value::Int(i) => cmd.arg(*i),
            Value::Float(f) => cmd.arg(*f),
            Value::Text(s) => cmd.arg(s.as_str()),
        };
    }

    Ok((name, cmd))
}

fn command_error(name: &str, e: RedisError) -> DataError {
    error!("Redis {} failed: {}", name, e);
    DataError::query_failed(format!("Redis {} failed: {}", name, e))
}

/// Render one reply element as a JSON cell
fn reply_to_json(reply: redis::Value) -> serde_json::Value {
    use redis::Value as Reply;
    use serde_json::Value as Json;

    match reply {
        Reply::Nil => Json::Null,
        Reply::Int(i) => Json::from(i),
        Reply::Double(f) => match serde_json::Number::from_f64(f) {
            Some(n) => Json::Number(n),
            None => Json::String(f.to_string()),
        },
        Reply::Boolean(b) => Json::Bool(b),
        Reply::Okay => Json::String("OK".to_string()),
        Reply::SimpleString(s) => Json::String(s),
        Reply::BulkString(bytes) => Json::String(String::from_utf8_lossy(&bytes).into_owned()),
        Reply::VerbatimString { text, .. } => Json::String(text),
        Reply::Array(items) | Reply::Set(items) => {
            Json::Array(items.into_iter().map(reply_to_json).collect())
        }
        Reply::Map(entries) => Json::Object(
            entries
                .into_iter()
                .map(|(k, v)| (reply_to_text(k), reply_to_json(v)))
                .collect(),
        ),
        other => Json::String(format!("{:?}", other)),
    }
}

fn reply_to_text(reply: redis::Value) -> String {
    match reply_to_json(reply) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn field_row(field: redis::Value, value: redis::Value) -> Map<String, serde_json::Value> {
    let mut row = Map::new();
    row.insert("field".to_string(), json!(reply_to_text(field)));
    row.insert("value".to_string(), reply_to_json(value));
    row
}

fn value_row(value: redis::Value) -> Map<String, serde_json::Value> {
    let mut row = Map::new();
    row.insert("value".to_string(), reply_to_json(value));
    row
}

/// Flatten a reply into documents
fn reply_rows(command: &str, reply: redis::Value) -> Vec<Map<String, serde_json::Value>> {
    use redis::Value as Reply;

    match reply {
        Reply::Nil => Vec::new(),
        Reply::Map(entries) => entries
            .into_iter()
            .map(|(field, value)| field_row(field, value))
            .collect(),
        // RESP2 encodes hashes as flat field/value arrays
        Reply::Array(items) if command == "HGETALL" => {
            let mut rows = Vec::with_capacity(items.len() / 2);
            let mut items = items.into_iter();
            while let (Some(field), Some(value)) = (items.next(), items.next()) {
                rows.push(field_row(field, value));
            }
            rows
        }
        Reply::Array(items) | Reply::Set(items) => items.into_iter().map(value_row).collect(),
        other => vec![value_row(other)],
    }
}

/// Affected count of a write reply
fn affected(reply: &redis::Value) -> u64 {
    match reply {
        redis::Value::Int(n) => (*n).max(0) as u64,
        redis::Value::Nil => 0,
        _ => 1,
    }
}

#[async_trait]
impl Executor for RedisExecutor {
    async fn run_query(
        &self,
        query: &Query,
        params: &[Value],
        _limit: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let line = query.require_text(BackendKind::Redis)?;
        let (name, cmd) = build_command(line, params)?;
        let mut connection = self.connection.clone();

        debug!("Executing Redis command: {}", name);

        let reply: redis::Value = cmd
            .query_async(&mut connection)
            .await
            .map_err(|e| command_error(&name, e))?;

        Ok(Box::new(BufferedCursor::from_documents(reply_rows(&name, reply))))
    }

    async fn run_exec(&self, query: &Query, params: &[Value]) -> Result<u64> {
        let line = query.require_text(BackendKind::Redis)?;
        let (name, cmd) = build_command(line, params)?;
        let mut connection = self.connection.clone();

        let reply: redis::Value = cmd
            .query_async(&mut connection)
            .await
            .map_err(|e| command_error(&name, e))?;

        Ok(affected(&reply))
    }

    /// MULTI/EXEC. Redis aborts only on commands rejected while queueing; a
    /// command failing at execution does not undo the others.
    async fn run_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for statement in statements {
            let line = statement.query.require_text(BackendKind::Redis)?;
            let (_, cmd) = build_command(line, &statement.params)?;
            pipe.add_command(cmd);
        }

        let mut connection = self.connection.clone();
        let replies: Vec<redis::Value> = pipe
            .query_async(&mut connection)
            .await
            .map_err(|e| command_error("MULTI/EXEC", e))?;

        Ok(replies.iter().map(affected).sum())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager closes when its last clone drops
        Ok(())
    }
}
