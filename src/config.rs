use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

pub const DEFAULT_SPATIAL_THRESHOLD: f64 = 20.0;
pub const DEFAULT_FILL_BATCH_SIZE: usize = 50;
pub const DEFAULT_SEQUENCE_BATCH_WINDOW: usize = 200;
pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 6;

/// Tuning knobs for [crate::graph::Graph].
///
/// The `max_*` values are retention allowances for [crate::graph::Graph::uncache]: the given
/// number of most-recently-accessed unused entities of each family survive an uncache pass.
/// All of them default to zero, meaning everything outside the caller's exclusion sets is
/// evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfiguration {
    pub max_sequences: usize,
    pub max_unused_images: usize,
    pub max_unused_prestored_images: usize,
    pub max_unused_tiles: usize,
    /// Radius in metres within which two images are spatial neighbours.
    pub spatial_threshold: f64,
    pub fill_batch_size: usize,
    pub sequence_batch_window: usize,
    pub max_concurrent_batches: usize,
}

impl Default for GraphConfiguration {
    fn default() -> Self {
        GraphConfiguration {
            max_sequences: 0,
            max_unused_images: 0,
            max_unused_prestored_images: 0,
            max_unused_tiles: 0,
            spatial_threshold: DEFAULT_SPATIAL_THRESHOLD,
            fill_batch_size: DEFAULT_FILL_BATCH_SIZE,
            sequence_batch_window: DEFAULT_SEQUENCE_BATCH_WINDOW,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
        }
    }
}

impl GraphConfiguration {
    pub fn validate(&self) -> Result<(), GraphError> {
        if !(self.spatial_threshold.is_finite() && self.spatial_threshold > 0.0) {
            return Err(GraphError::Config(format!(
                "spatial_threshold must be a positive number of metres, got {}",
                self.spatial_threshold
            )));
        }
        if self.fill_batch_size == 0 || self.max_concurrent_batches == 0 {
            return Err(GraphError::Config(
                "fill_batch_size and max_concurrent_batches must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_configuration(&self) -> Result<GraphConfiguration, GraphError>;
    fn set_configuration(&self, config: &GraphConfiguration) -> Result<(), GraphError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_configuration(&self) -> Result<GraphConfiguration, GraphError> {
        tracing::debug!("Attempting to read graph configuration from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using default graph configuration.");
            return Ok(GraphConfiguration::default());
        }
        let content = read_to_string(&self.path)?;
        let config: GraphConfiguration = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn set_configuration(&self, config: &GraphConfiguration) -> Result<(), GraphError> {
        tracing::debug!("Attempting to write graph configuration to: {:?}", &self.path);
        config.validate()?;
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
