use crate::ensemble::ModelAlignment;
use crate::render::RenderSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LABEL_INDEX: &str = "/opt/labelset/Schaefer2018_200Parcels_17Networks_order.csv";
pub const DEFAULT_MODEL_DIR: &str = "/opt/model";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings that stay fixed across subjects. Command-line flags override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub label_index: PathBuf,
    pub model_dir: PathBuf,
    pub alignment: ModelAlignment,
    /// Also write `<prefix>_regional_stats.csv` during a full run.
    pub write_regional_statistics: bool,
    pub render: RenderSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            label_index: PathBuf::from(DEFAULT_LABEL_INDEX),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            alignment: ModelAlignment::default(),
            write_regional_statistics: true,
            render: RenderSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
