//! Configuration loading with JSON file support and environment variable
//! overrides.
//!
//! Pattern: `COHORT_*` environment variables override config file values.
//! Example: `COHORT_BATCH_SIZE=32` overrides `batch_size`.

use crate::utils::error::{CohortError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::debug;

fn default_batch_size() -> usize {
    64
}

fn default_shuffle_seed() -> u64 {
    42
}

fn default_num_parallel_readers() -> usize {
    1
}

fn default_mini_batch_size() -> usize {
    64
}

/// Per-reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReaderConfig {
    /// Directory holding the raw data files
    #[serde(default)]
    pub file_dir: Option<String>,

    /// Sample file name
    #[serde(default)]
    pub data_filename: Option<String>,

    /// Label file name
    #[serde(default)]
    pub label_filename: Option<String>,

    /// Samples per minibatch for this reader
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Skip shuffling and walk the data in stored order
    #[serde(default)]
    pub first_n: bool,

    /// Hard cap on the number of samples used
    #[serde(default)]
    pub max_sample_count: Option<usize>,

    /// Fraction of the data set to use, in [0, 1]
    #[serde(default)]
    pub use_percent: Option<f64>,

    /// Fraction held out for validation, in [0, 1]
    #[serde(default)]
    pub validation_percent: Option<f64>,

    /// Base seed for the deterministic shuffle sequence
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: u64,
}

impl ReaderConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| CohortError::Config(format!("failed to parse reader config: {}", e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `COHORT_*` overrides on top of whatever was loaded.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env::<usize>("COHORT_BATCH_SIZE") {
            debug!(batch_size = v, "env override");
            self.batch_size = v;
        }
        if let Some(v) = parse_env::<bool>("COHORT_FIRST_N") {
            self.first_n = v;
        }
        if let Some(v) = parse_env::<f64>("COHORT_USE_PERCENT") {
            self.use_percent = Some(v);
        }
        if let Some(v) = parse_env::<f64>("COHORT_VALIDATION_PERCENT") {
            self.validation_percent = Some(v);
        }
        if let Some(v) = parse_env::<u64>("COHORT_SHUFFLE_SEED") {
            self.shuffle_seed = v;
        }
    }
}

/// World layout and input pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Ranks per model replica; zero means the whole world is one model
    #[serde(default)]
    pub procs_per_model: usize,

    /// Requested parallel data readers per model
    #[serde(default = "default_num_parallel_readers")]
    pub num_parallel_readers: usize,

    /// Maximum minibatch size per reader
    #[serde(default = "default_mini_batch_size")]
    pub mini_batch_size: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            procs_per_model: 0,
            num_parallel_readers: default_num_parallel_readers(),
            mini_batch_size: default_mini_batch_size(),
        }
    }
}

impl TopologyConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| CohortError::Config(format!("failed to parse topology config: {}", e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env::<usize>("COHORT_PROCS_PER_MODEL") {
            debug!(procs_per_model = v, "env override");
            self.procs_per_model = v;
        }
        if let Some(v) = parse_env::<usize>("COHORT_NUM_PARALLEL_READERS") {
            self.num_parallel_readers = v;
        }
        if let Some(v) = parse_env::<usize>("COHORT_MINI_BATCH_SIZE") {
            self.mini_batch_size = v;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
