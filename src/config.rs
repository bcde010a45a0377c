//! Configuration for bi-forecast.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (BI_FORECAST_HOME, BI_FORECAST_DATA, LOG_FORMAT, LOG_LEVEL, LOG_FILE)
//! 2. Config file (.bi-forecast/config.yaml)
//! 3. Defaults (~/.bi-forecast)
//!
//! Config file discovery:
//! - Searches current directory and parents for .bi-forecast/config.yaml
//! - `paths.home` is relative to the .bi-forecast/ directory
//! - `data.path` and `logging.file` are relative to the project root (parent of .bi-forecast/)

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{CsvSourceConfig, InsightConfig};
use crate::core::PipelineConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".bi-forecast";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub data: Option<CsvSourceConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub insight: InsightConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the config directory)
    pub home: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file, in the same format without colors
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Open the log file for appending, creating its directory
    pub fn open_file(&self) -> Result<Option<Mutex<File>>> {
        let Some(path) = &self.file else {
            return Ok(None);
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Ok(Some(Mutex::new(file)))
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory: registry, forecasts, run logs
    pub home: PathBuf,
    /// CSV data source, if one is configured
    pub data: Option<CsvSourceConfig>,
    pub pipeline: PipelineConfig,
    pub insight: InsightConfig,
    pub logging: LoggingConfig,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Model registry journal ($HOME/registry/models.jsonl)
    pub fn registry_path(&self) -> PathBuf {
        self.home.join("registry").join("models.jsonl")
    }

    /// Forecast store journal ($HOME/forecasts/forecasts.jsonl)
    pub fn forecasts_path(&self) -> PathBuf {
        self.home.join("forecasts").join("forecasts.jsonl")
    }

    /// Run event logs ($HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Per-entity run lock files ($HOME/locks)
    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Environment overrides, read once so resolution stays testable
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    data: Option<PathBuf>,
    log_format: Option<String>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("BI_FORECAST_HOME").ok().map(PathBuf::from),
            data: std::env::var("BI_FORECAST_DATA").ok().map(PathBuf::from),
            log_format: std::env::var("LOG_FORMAT").ok(),
            log_level: std::env::var("LOG_LEVEL").ok(),
            log_file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
        }
    }
}

/// Resolve configuration from an optional config file plus overrides
fn resolve(config_file: Option<PathBuf>, env: EnvOverrides) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let (mut home, mut data, pipeline, insight, mut logging) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        // Project root is the parent of .bi-forecast/
        let base_dir = config_dir.parent().unwrap_or(Path::new("."));

        let home = config
            .paths
            .home
            .as_ref()
            .map(|h| resolve_path(config_dir, Path::new(h)))
            .unwrap_or_else(|| default_home.clone());

        let data = config.data.map(|mut data| {
            data.path = resolve_path(base_dir, &data.path);
            data
        });

        let mut logging = config.logging;
        logging.file = logging.file.map(|file| resolve_path(base_dir, &file));

        (home, data, config.pipeline, config.insight, logging)
    } else {
        (
            default_home,
            None,
            PipelineConfig::default(),
            InsightConfig::default(),
            LoggingConfig::default(),
        )
    };

    if let Some(env_home) = env.home {
        home = env_home;
    }
    if let Some(env_data) = env.data {
        data = Some(match data {
            Some(mut existing) => {
                existing.path = env_data;
                existing
            }
            None => CsvSourceConfig::new(env_data),
        });
    }
    if let Some(format) = env.log_format {
        logging.format = format;
    }
    if let Some(level) = env.log_level {
        logging.level = level;
    }
    if let Some(file) = env.log_file {
        logging.file = Some(file);
    }

    Ok(ResolvedConfig {
        home,
        data,
        pipeline,
        insight,
        logging,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_config_file(&cwd));
    resolve(config_file, EnvOverrides::from_env())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Load configuration from an explicit file, still honoring env overrides
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    resolve(Some(path.to_path_buf()), EnvOverrides::from_env())
}

/// Logging settings of the config a command runs with.
///
/// `config_file` is the `--config` path when given. A config that fails to
/// load yields the defaults; the command reports the error itself.
pub fn logging_for(config_file: Option<&Path>) -> LoggingConfig {
    let logging = match config_file {
        Some(path) => load_from(path).map(|cfg| cfg.logging),
        None => config().map(|cfg| cfg.logging.clone()),
    };
    logging.unwrap_or_default()
}
