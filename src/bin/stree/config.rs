use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stree::TreeOptions;
use thiserror::Error;

use super::LayoutArgs;

/// Contents of a `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub tree: TreeOptions,
}

/// Loads tree options from `path` (defaults when absent) and applies flag overrides.
pub fn load_options(path: Option<&Path>, layout: &LayoutArgs) -> Result<TreeOptions, ConfigError> {
    let mut options = match path {
        Some(path) => read_file(path)?.tree,
        None => TreeOptions::default(),
    };
    if let Some(block_size) = layout.block_size {
        options.block_size = block_size;
    }
    if let Some(block_head_size) = layout.block_head_size {
        options.block_head_size = block_head_size;
    }
    if let Some(max_blocks) = layout.max_blocks {
        options.max_blocks = Some(max_blocks);
    }
    if layout.no_flow {
        options.flow_kinds.clear();
    }
    options
        .validate()
        .map_err(|source| ConfigError::Invalid { source })?;
    Ok(options)
}

pub fn render(options: &TreeOptions) -> Result<String, ConfigError> {
    let raw = RawConfig {
        tree: options.clone(),
    };
    toml::to_string_pretty(&raw).map_err(|source| ConfigError::Serialize { source })
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("invalid tree options: {source}")]
    Invalid { source: stree::StreeError },
}
