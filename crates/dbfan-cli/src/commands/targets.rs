//! List configured targets

use super::{load_settings, print_json};
use clap::Args;
use dbfan_config::Settings;
use serde::Serialize;
use std::path::Path;

#[derive(Args)]
pub struct TargetsCommand {}

#[derive(Debug, Serialize)]
pub(crate) struct TargetSummary {
    pub id: String,
    pub kind: String,
    pub family: String,
}

pub(crate) fn summarize(settings: &Settings) -> Vec<TargetSummary> {
    settings
        .targets
        .iter()
        .map(|target| {
            let kind = target.backend.kind();
            TargetSummary {
                id: target.id.clone(),
                kind: kind.to_string(),
                family: kind.family().to_string(),
            }
        })
        .collect()
}

impl TargetsCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        let settings = load_settings(config)?;
        print_json(&summarize(&settings))
    }
}
