// ========================================================================================
//                                Run configuration
// ========================================================================================
//
// Both subcommands are driven by a TOML file. Relative paths inside a config file are
// resolved against the directory that contains it. `prepare` also writes a
// `layout.toml` next to the ray weight files so `solve` knows the matrix layout and how
// many ray weight sets were staged without repeating them in its own config.

use crate::debug::DebugRayRequest;
use crate::fabric::PoolSettings;
use crate::nodes::LayerStdDev;
use crate::retry::RetryPolicy;
use crate::task::SitePairs;
use crate::types::{MatrixLayout, SiteId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LAYOUT_FILE_NAME: &str = "layout.toml";
const DEFAULT_CLEANUP_FREQUENCY: u64 = 10;
const DEFAULT_ELEMENT_LIMIT: usize = 50_000_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let toml_string = toml::to_string_pretty(value)?;
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_err)?);
    file.write_all(toml_string.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

// ========================================================================================
//                                  Solve config
// ========================================================================================

/// One requested site pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitePairEntry {
    pub site_a: SiteId,
    pub site_b: SiteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker threads. Defaults to the number of logical CPUs.
    pub threads: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub batch_size: Option<usize>,
    /// Evict idle cached blocks after every this many tasks. Zero disables eviction.
    pub cleanup_frequency: u64,
    /// Run every task on the orchestrating thread instead of a pool.
    pub inline: bool,
}

impl WorkerConfig {
    /// Pool tuning with every unset value taken from the machine defaults.
    pub fn pool_settings(&self) -> PoolSettings {
        let defaults = PoolSettings::default();
        let workers = self.threads.unwrap_or(defaults.workers).max(1);
        PoolSettings {
            workers,
            max_in_flight: self.max_in_flight.unwrap_or(workers * 4),
            batch_size: self.batch_size.unwrap_or(workers),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: None,
            max_in_flight: None,
            batch_size: None,
            cleanup_frequency: DEFAULT_CLEANUP_FREQUENCY,
            inline: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub ray_weight_dir: PathBuf,
    pub nonrep_dir: PathBuf,
    pub block_servers: Vec<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub site_pairs: Vec<SitePairEntry>,
    #[serde(default)]
    pub debug_rays: Vec<DebugRayRequest>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: RunConfig = read_toml(path)?;
        let base = config_dir(path);
        resolve(&base, &mut config.ray_weight_dir);
        resolve(&base, &mut config.nonrep_dir);
        resolve(&base, &mut config.output_dir);
        for server in &mut config.block_servers {
            resolve(&base, server);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(self, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one block server root must be listed in `block_servers`.".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "`retry.attempts` must be at least 1.".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured pairs grouped by site A.
    pub fn site_pair_map(&self) -> SitePairs {
        let mut pairs = SitePairs::new();
        for entry in &self.site_pairs {
            pairs.entry(entry.site_a).or_default().insert(entry.site_b);
        }
        pairs
    }
}

// ========================================================================================
//                                 Staged layout
// ========================================================================================

/// What `prepare` staged, as recorded next to the ray weight files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedLayout {
    pub matrix_size: usize,
    pub block_size: usize,
    pub set_count: u32,
    pub p_pseudo_columns: usize,
    pub s_pseudo_columns: usize,
    pub site_pair_set: bool,
}

impl StagedLayout {
    pub fn layout(&self) -> Result<MatrixLayout, ConfigError> {
        MatrixLayout::new(self.matrix_size, self.block_size).map_err(ConfigError::Invalid)
    }

    pub fn load(ray_weight_dir: &Path) -> Result<Self, ConfigError> {
        read_toml(&ray_weight_dir.join(LAYOUT_FILE_NAME))
    }

    pub fn save(&self, ray_weight_dir: &Path) -> Result<PathBuf, ConfigError> {
        fs::create_dir_all(ray_weight_dir).map_err(|source| ConfigError::Io {
            path: ray_weight_dir.to_path_buf(),
            source,
        })?;
        let path = ray_weight_dir.join(LAYOUT_FILE_NAME);
        write_toml(self, &path)?;
        Ok(path)
    }
}

// ========================================================================================
//                                 Prepare config
// ========================================================================================

fn default_element_limit() -> usize {
    DEFAULT_ELEMENT_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareConfig {
    pub matrix_size: usize,
    pub block_size: usize,
    /// Binary column map of the covariance matrix.
    pub column_map: PathBuf,
    /// Tab-separated active node list: `vertex layer node slowness_p slowness_s`.
    pub point_map: PathBuf,
    /// Tab-separated rays: `phase site source weights`, weights as `node:weight;...`.
    pub rays: PathBuf,
    pub ray_weight_dir: PathBuf,
    pub nonrep_dir: PathBuf,
    /// A ray weight set stops taking new (phase, site) groups once it holds more
    /// elements than this.
    #[serde(default = "default_element_limit")]
    pub element_limit: usize,
    /// Also stage the unpartitioned set used for site-pair covariance.
    #[serde(default)]
    pub stage_site_pairs: bool,
    #[serde(default)]
    pub layer_std_dev_p: Vec<LayerStdDev>,
    #[serde(default)]
    pub layer_std_dev_s: Vec<LayerStdDev>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl PrepareConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: PrepareConfig = read_toml(path)?;
        let base = config_dir(path);
        for path in [
            &mut config.column_map,
            &mut config.point_map,
            &mut config.rays,
            &mut config.ray_weight_dir,
            &mut config.nonrep_dir,
        ] {
            resolve(&base, path);
        }
        config.layout()?;
        Ok(config)
    }

    pub fn layout(&self) -> Result<MatrixLayout, ConfigError> {
        MatrixLayout::new(self.matrix_size, self.block_size).map_err(ConfigError::Invalid)
    }
}
