//! Connectivity check

use super::load_settings;
use clap::Args;
use colored::Colorize;
use dbfan_config::Settings;
use dbfan_query::Outcome;
use futures::future::join_all;
use std::path::Path;
use tracing::debug;

#[derive(Args)]
pub struct PingCommand {
    /// Only ping these targets (repeatable); defaults to all
    #[arg(long = "target")]
    pub targets: Vec<String>,
}

impl PingCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        let mut outcomes = rt.block_on(self.run(&settings));
        outcomes.sort_by(|a, b| a.target.cmp(&b.target));

        for outcome in &outcomes {
            if outcome.is_success() {
                println!("{} {}", "OK  ".bright_green().bold(), outcome.target);
            } else {
                println!(
                    "{} {}: {}",
                    "FAIL".bright_red().bold(),
                    outcome.target,
                    outcome.error.bright_white()
                );
            }
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            anyhow::bail!("{} of {} targets unreachable", failed, outcomes.len());
        }
        Ok(())
    }

    pub(crate) async fn run(&self, settings: &Settings) -> Vec<Outcome> {
        let registry = settings.build_registry().await;

        let outcomes = if self.targets.is_empty() {
            registry.ping_all().await
        } else {
            debug!("Pinging {} selected targets", self.targets.len());
            join_all(self.targets.iter().map(|target| {
                let registry = &registry;
                async move {
                    let result = match registry.resolve(target).await {
                        Ok(handle) => handle.ensure_ready().await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => Outcome::success(target.clone(), Vec::new()),
                        Err(e) => Outcome::failure(target.clone(), e),
                    }
                }
            }))
            .await
        };

        registry.close_all().await;
        outcomes
    }
}
