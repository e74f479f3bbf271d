//! Id generation through a target

use super::{load_settings, open_target};
use clap::Args;
use dbfan_config::Settings;
use std::path::Path;

#[derive(Args)]
pub struct IdCommand {
    #[arg(long)]
    pub target: String,
}

impl IdCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        println!("{}", rt.block_on(self.run(&settings))?);
        Ok(())
    }

    pub(crate) async fn run(&self, settings: &Settings) -> anyhow::Result<String> {
        let registry = settings.build_registry().await;
        let handle = open_target(&registry, &self.target).await?;
        let id = handle.generate_id().await;
        registry.close_all().await;
        Ok(id)
    }
}
