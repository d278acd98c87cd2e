use std::{
    collections::HashMap,
    fs::{self, File},
    io::prelude::*,
    path::Path,
    time::Duration,
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::runner::RunSpec;

/// Benchmark settings, loaded from a TOML file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BenchConfig {
    /// Number of units of work per run.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Maximum units of work in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Header read timeout (seconds) applied by the test server.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    /// How long (milliseconds) the client keeps idle connections pooled.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Bytes of response body quoted in validation failures.
    #[serde(default = "default_body_preview")]
    pub body_preview: usize,

    /// Upper bound (seconds) on graceful shutdown of the test server.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Set TCP_NODELAY on dialed connections.
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    #[serde(flatten)]
    pub other_fields: HashMap<String, toml::Value>,
}

fn default_iterations() -> usize {
    10_000
}

fn default_concurrency() -> usize {
    50
}

fn default_read_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    100
}

fn default_body_preview() -> usize {
    crate::handler::BODY_PREVIEW
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_nodelay() -> bool {
    true
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            concurrency: default_concurrency(),
            read_timeout: default_read_timeout(),
            idle_timeout: default_idle_timeout(),
            body_preview: default_body_preview(),
            shutdown_grace: default_shutdown_grace(),
            nodelay: default_nodelay(),
            other_fields: HashMap::new(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, BenchConfigLoadError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;

        for field in &config.other_fields {
            warn!(
                "Unknown configuration '{}' with value {:?}",
                field.0, field.1
            );
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let config_str = toml::to_string(&self)?;
        let mut file = File::create(path)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    pub fn run_spec(&self) -> RunSpec {
        RunSpec::new(self.iterations, self.concurrency)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchConfigLoadError {
    #[error("Could not open config")]
    Io(#[from] std::io::Error),
    #[error("Could not parse")]
    Parse(#[from] toml::de::Error),
}
