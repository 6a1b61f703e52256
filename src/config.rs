//! Configuration: pipeline settings file and application paths.
//!
//! `PipelineConfig` is a serde JSON file; every field has a default so partial
//! files load. `PathConfig` decides where that file (and the log) live.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::entities::{CaptureBundleSpec, CaptureId, Dimensions};

/// Default settings file name inside the config directory
pub const CONFIG_FILE: &str = "capture.json";
/// Default log file name inside the data directory
pub const LOG_FILE: &str = "capture.log";

const APP_DIR: &str = "capture-coord";
const CONFIG_DIR_ENV: &str = "CAPTURE_CONFIG_DIR";

// ============================================================================
// Pipeline settings
// ============================================================================

/// Settings for one capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads for ingestion and fusion (0 = 75% of CPU cores)
    pub workers: usize,
    pub width: u32,
    pub height: u32,
    /// Input queue depth; bounds the bundle size
    pub queue_depth: usize,
    /// Capture ids of one fusion cycle, in fusion order
    pub bundle: Vec<CaptureId>,
    /// Devices the simulated platform exposes
    pub devices: Vec<String>,
    /// Fused cycles to run before shutting down
    pub cycles: u64,
    /// Simulated device release latency
    pub release_delay_ms: u64,
    /// Simulated delay between hardware frames
    pub frame_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            width: 64,
            height: 48,
            queue_depth: 4,
            bundle: vec![1, 2, 3],
            devices: vec!["0".to_string(), "1".to_string()],
            cycles: 5,
            release_delay_ms: 20,
            frame_interval_ms: 2,
        }
    }
}

impl PipelineConfig {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Load settings, falling back to defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Effective worker count (75% of cores for workers when unset, min 1)
    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            (num_cpus::get() * 3 / 4).max(1)
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    pub fn bundle_spec(&self) -> CaptureBundleSpec {
        self.bundle.iter().copied().collect()
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Create PathConfig from CLI arguments and environment variables
    ///
    /// Priority: CLI args → ENV var (CAPTURE_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Platform paths:
/// - Linux: ~/.config/capture-coord/{name}
/// - macOS: ~/Library/Application Support/capture-coord/{name}
/// - Windows: %APPDATA%\capture-coord\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Get path to a data file (logs)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Ensure that configuration and data directories exist
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }

    // Only create data_dir if it's different from config_dir
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }

    Ok(())
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join(APP_DIR);
    }
    PathBuf::from(".")
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = dirs_next::data_dir() {
        return dir.join(APP_DIR);
    }
    PathBuf::from(".")
}
