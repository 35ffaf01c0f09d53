//! Simulation configuration.
//!
//! [`SimConfig`] is read once at world construction. Every field has a
//! default, so a config file only needs to name what it overrides. Files
//! are RON, TOML or JSON, picked by extension.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported config format: {file}")]
    UnsupportedFormat { file: PathBuf },
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },
    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

pub fn detect_format(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Tiles per chunk edge.
    pub chunk_size: u32,
    /// Ticks per second of real time.
    pub tick_rate: u32,
    /// Maximum proportional rounds per flow subgraph per tick.
    pub flow_iteration_cap: u32,
    /// Worker threads. `None` uses the machine's available parallelism.
    pub worker_count: Option<usize>,
    pub world_width: u32,
    pub world_height: u32,
    /// Failed re-checks a blocked task survives before it fails.
    pub task_retry_limit: u32,
    /// A* node expansions allowed per path search.
    pub path_search_limit: u32,
    /// Ticks a unit may wait on an occupied tile before it is rerouted.
    pub task_stall_limit: u32,
    /// Executed commands kept for inspection. 0 keeps none.
    pub command_history: usize,
    /// Committed snapshots kept in the history ring.
    pub snapshot_history: usize,
    /// Attempts per tick before it is discarded.
    pub max_tick_attempts: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            tick_rate: 60,
            flow_iteration_cap: 4,
            worker_count: None,
            world_width: 1024,
            world_height: 1024,
            task_retry_limit: 3,
            path_search_limit: 4096,
            task_stall_limit: 8,
            command_history: 0,
            snapshot_history: 8,
            max_tick_attempts: 2,
        }
    }
}

impl SimConfig {
    /// Explicit counts are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 64),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, 64),
        }
    }

    /// Length of one tick in real time.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be at least 1"));
        }
        if self.tick_rate == 0 {
            return Err(invalid("tick_rate", "must be at least 1"));
        }
        if self.flow_iteration_cap == 0 {
            return Err(invalid("flow_iteration_cap", "must be at least 1"));
        }
        if self.worker_count == Some(0) {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.world_width == 0 || self.world_height == 0 {
            return Err(invalid("world_width/world_height", "must be non-zero"));
        }
        if self.world_width > i32::MAX as u32 || self.world_height > i32::MAX as u32 {
            return Err(invalid("world_width/world_height", "exceeds i32 range"));
        }
        if self.path_search_limit == 0 {
            return Err(invalid("path_search_limit", "must be at least 1"));
        }
        if self.task_stall_limit == 0 {
            return Err(invalid("task_stall_limit", "must be at least 1"));
        }
        if self.snapshot_history == 0 {
            return Err(invalid("snapshot_history", "must be at least 1"));
        }
        if self.max_tick_attempts == 0 {
            return Err(invalid("max_tick_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<SimConfig, ConfigError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content, format).map_err(|detail| ConfigError::Parse {
        file: path.to_path_buf(),
        detail,
    })?;
    config.validate()?;
    Ok(config)
}

/// Parse config text in the given format. Does not validate.
pub fn parse_config(content: &str, format: Format) -> Result<SimConfig, String> {
    match format {
        Format::Ron => ron::from_str(content).map_err(|e| e.to_string()),
        Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    }
}
