//! Pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::device::traits::FormatType;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub device: DeviceConfig,
    pub bench: BenchConfig,
}

/// How long the engine keeps buffer guards for submitted jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardPolicy {
    /// Keep every guard until `clear()` is called
    #[default]
    Retain,
    /// Release a job's guards once its result has been queued
    PerJob,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub ready_timeout_ms: u64,
    pub queue_capacity: usize,
    pub batch_size: Option<u32>,
    pub output_format: FormatType,
    pub guard_policy: GuardPolicy,
}

impl EngineConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.ready_timeout_ms == 0 {
            return Err(EngineError::Config("ready_timeout_ms must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 1000,
            queue_capacity: 16,
            batch_size: None,
            output_format: FormatType::Float32,
            guard_policy: GuardPolicy::Retain,
        }
    }
}

/// Simulated accelerator settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub devices: usize,
    pub workers: usize,
    pub max_in_flight: usize,
    pub latency_ms: u64,
}

impl DeviceConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            workers: 2,
            max_in_flight: 4,
            latency_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    pub model_path: PathBuf,
    pub frames: usize,
    pub clear_every: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/resnet_v1_50.toml"),
            frames: 256,
            clear_every: 32,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            device: DeviceConfig::default(),
            bench: BenchConfig::default(),
        }
    }
}
