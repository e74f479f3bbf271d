pub mod batch;
pub mod exec;
pub mod id;
pub mod ping;
pub mod query;
pub mod targets;

pub use batch::BatchCommand;
pub use exec::{ExecCommand, TransactionCommand};
pub use id::IdCommand;
pub use ping::PingCommand;
pub use query::QueryCommand;
pub use targets::TargetsCommand;

use anyhow::Context;
use dbfan_config::Settings;
use dbfan_query::{BackendHandle, HandleRegistry, Value};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Handle for one configured target
pub(crate) async fn open_target(
    registry: &HandleRegistry,
    target: &str,
) -> anyhow::Result<Arc<BackendHandle>> {
    registry
        .resolve(target)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

/// A command-line parameter: a JSON scalar when it parses as one, text otherwise
pub(crate) fn parse_param(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ (serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Number(_)
        | serde_json::Value::String(_))) => Value::from_json(value),
        _ => Value::Text(raw.to_string()),
    }
}

pub(crate) fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|param| parse_param(param)).collect()
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
