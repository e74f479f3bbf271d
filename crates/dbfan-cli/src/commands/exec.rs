//! Statements that change data

use super::{load_settings, open_target, parse_params, print_json};
use clap::Args;
use dbfan_config::Settings;
use dbfan_query::{Query, Statement};
use serde_json::json;
use std::path::Path;

#[derive(Args)]
pub struct ExecCommand {
    #[arg(long)]
    pub target: String,

    /// Positional parameter bound in order (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

    pub statement: String,
}

impl ExecCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        let affected = rt.block_on(self.run(&settings))?;
        print_json(&json!({ "target": self.target, "affected": affected }))
    }

    pub(crate) async fn run(&self, settings: &Settings) -> anyhow::Result<u64> {
        let registry = settings.build_registry().await;
        let handle = open_target(&registry, &self.target).await?;
        let result = handle
            .exec(&Query::from(self.statement.as_str()), &parse_params(&self.params))
            .await;
        registry.close_all().await;
        Ok(result?)
    }
}

#[derive(Args)]
pub struct TransactionCommand {
    #[arg(long)]
    pub target: String,

    /// Statements run in order; any failure rolls all of them back
    #[arg(required = true)]
    pub statements: Vec<String>,
}

impl TransactionCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        let rt = tokio::runtime::Runtime::new()?;
        let affected = rt.block_on(self.run(&settings))?;
        print_json(&json!({ "target": self.target, "affected": affected }))
    }

    pub(crate) async fn run(&self, settings: &Settings) -> anyhow::Result<u64> {
        let statements: Vec<Statement> = self
            .statements
            .iter()
            .map(|statement| Statement::new(statement.as_str()))
            .collect();

        let registry = settings.build_registry().await;
        let handle = open_target(&registry, &self.target).await?;
        let result = handle.exec_in_transaction(&statements).await;
        registry.close_all().await;
        Ok(result?)
    }
}
