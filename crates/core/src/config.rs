use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TESSERA_DATA_DIR";

/// Halo applied to tiled axes that do not declare their own.
pub const DEFAULT_HALO: usize = 32;

/// Options consumed by the tiled executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunOptions {
    /// When false, planning and partitioning are skipped entirely and the
    /// model is invoked once on the whole fitted array.
    pub tiling_enabled: bool,
    /// Minimum number of tiles the planner should produce.
    pub number_of_tiles: usize,
    /// Samples per prediction along batch axes.
    pub batch_size: usize,
    /// Directory for disk-backed output stores. When set it is cleared of
    /// stale files before the run and retained afterwards; when unset a
    /// scratch directory is used and removed at the end of the run.
    pub cache_directory: Option<PathBuf>,
    /// Halo for tiled axes without an explicit one.
    pub default_halo: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tiling_enabled: true,
            number_of_tiles: 1,
            batch_size: 1,
            cache_directory: None,
            default_halo: DEFAULT_HALO,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.number_of_tiles == 0 {
            bail!("number_of_tiles must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub execution: RunOptions,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .execution
            .validate()
            .with_context(|| format!("invalid execution options in {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TESSERA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}
