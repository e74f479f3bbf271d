//! Fan one query out over several targets

use super::{load_settings, parse_params, print_json};
use clap::Args;
use dbfan_config::Settings;
use dbfan_query::{BatchTemplate, Dispatcher, Outcome};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Args)]
pub struct QueryCommand {
    /// Target to query (repeatable)
    #[arg(long = "target", required = true)]
    pub targets: Vec<String>,

    /// Maximum records per target
    #[arg(long)]
    pub limit: Option<usize>,

    /// Positional parameter bound in order (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Query text, or a JSON payload for document and search backends
    pub query: String,
}

impl QueryCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        let outcomes = rt.block_on(self.run(&settings))?;
        print_json(&outcomes)
    }

    pub(crate) async fn run(&self, settings: &Settings) -> anyhow::Result<Vec<Outcome>> {
        // 0 means unset, like an omitted flag
        let limit = self
            .limit
            .filter(|limit| *limit > 0)
            .unwrap_or(settings.dispatch.default_limit);
        let mut template = BatchTemplate::new(self.targets.clone(), self.query.as_str(), limit);
        template.params = parse_params(&self.params);

        debug!(
            "Dispatching query to {} targets (limit {})",
            template.targets.len(),
            limit
        );

        let registry = Arc::new(settings.build_registry().await);
        let dispatcher =
            Dispatcher::new(registry.clone()).with_options(settings.dispatch_options());
        let outcomes = dispatcher.dispatch_batch(&template).await;
        registry.close_all().await;

        Ok(outcomes?)
    }
}
