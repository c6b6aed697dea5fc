pub mod amp;
pub mod bench;
pub mod config;
pub mod dist;
pub mod memory;
pub mod nn;
pub mod profiler;
pub mod telemetry;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        ron::to_string(self).context("failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}
