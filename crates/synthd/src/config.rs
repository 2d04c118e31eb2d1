//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use synth_lib::WorkloadSpec;

const DEFAULT_CONFIG_FILE: &str = "synthd.toml";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SynthdConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Wall-clock pause between two simulated ticks, in milliseconds
    #[serde(default = "default_tick_pause")]
    pub tick_pause_ms: u64,

    /// Write the maxima files of a statistics pass here before replaying
    #[serde(default)]
    pub prerun_dir: Option<PathBuf>,

    /// Keep serving health and metrics after the replay has finished
    #[serde(default = "default_linger")]
    pub linger: bool,

    #[serde(default)]
    pub workload: WorkloadSpec,
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_pause() -> u64 {
    0
}

fn default_linger() -> bool {
    true
}

impl Default for SynthdConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            tick_pause_ms: default_tick_pause(),
            prerun_dir: None,
            linger: default_linger(),
            workload: WorkloadSpec::default(),
        }
    }
}

impl SynthdConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let (path, required) = match std::env::var("SYNTHD_CONFIG") {
            Ok(path) => (path, true),
            Err(_) => (DEFAULT_CONFIG_FILE.to_string(), false),
        };
        Self::load_from(&path, required)
    }

    pub fn load_from(path: &str, required: bool) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(required))
            .add_source(
                config::Environment::with_prefix("SYNTHD")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("workload.cpu_traces")
                    .with_list_parse_key("workload.gpu_traces")
                    .with_list_parse_key("workload.memory_traces")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        config
            .try_deserialize()
            .context("Invalid synthd configuration")
    }
}
