//! Target settings for dbfan
//!
//! Settings come from a TOML, YAML or JSON file (format picked from the
//! extension) with `DBFAN__`-prefixed environment overrides layered on top,
//! e.g. `DBFAN__DISPATCH__MAX_CONCURRENCY=4`.

mod backend;

pub use backend::BackendConfig;

use dbfan_query::{DispatchOptions, HandleRegistry, DEFAULT_LIMIT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "DBFAN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {details}")]
    InvalidConfiguration { details: String },
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub targets: Vec<TargetSettings>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSettings {
    pub id: String,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Row cap used when a request does not set one
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            task_timeout_ms: None,
            max_concurrency: None,
            default_limit: default_limit(),
        }
    }
}

impl Settings {
    /// Load and validate settings from a file plus environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading settings from {}", path.display());

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        debug!("Loaded {} targets", settings.targets.len());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::InvalidConfiguration {
                details: "no targets configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(ConfigError::InvalidConfiguration {
                    details: "target id must not be empty".to_string(),
                });
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::InvalidConfiguration {
                    details: format!("duplicate target id: {}", target.id),
                });
            }
        }

        if self.dispatch.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidConfiguration {
                details: "dispatch.max_concurrency must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn target(&self, id: &str) -> Option<&TargetSettings> {
        self.targets.iter().find(|target| target.id == id)
    }

    /// Register a handle per target. Nothing connects until first use.
    pub async fn build_registry(&self) -> HandleRegistry {
        let registry = HandleRegistry::new();
        for target in &self.targets {
            registry
                .register(target.id.clone(), target.backend.connector())
                .await;
        }
        registry
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        let mut options = DispatchOptions::default();
        if let Some(ms) = self.dispatch.task_timeout_ms {
            options = options.with_task_timeout(Duration::from_millis(ms));
        }
        if let Some(max) = self.dispatch.max_concurrency {
            options = options.with_max_concurrency(max);
        }
        options
    }
}
