//! Dispatch a file of query requests

use super::{load_settings, print_json};
use anyhow::Context;
use clap::Args;
use dbfan_config::Settings;
use dbfan_query::{Dispatcher, Outcome, QueryRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args)]
pub struct BatchCommand {
    /// JSON array of `{target, query, params?, limit?}` objects
    pub file: PathBuf,
}

pub(crate) fn read_requests(
    path: &Path,
    default_limit: usize,
) -> anyhow::Result<Vec<QueryRequest>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let requests: Vec<QueryRequest> = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid request file {}", path.display()))?;

    Ok(requests
        .into_iter()
        .map(|request| request.with_default_limit(default_limit))
        .collect())
}

impl BatchCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        let outcomes = rt.block_on(self.run(&settings))?;
        print_json(&outcomes)
    }

    pub(crate) async fn run(&self, settings: &Settings) -> anyhow::Result<Vec<Outcome>> {
        let requests = read_requests(&self.file, settings.dispatch.default_limit)?;

        let registry = Arc::new(settings.build_registry().await);
        let dispatcher =
            Dispatcher::new(registry.clone()).with_options(settings.dispatch_options());
        let outcomes = dispatcher.dispatch(requests).await;
        registry.close_all().await;

        Ok(outcomes?)
    }
}
