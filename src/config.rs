//! Configuration for retrain paths and backends.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RETRAIN_HOME, RETRAIN_ARTIFACTS)
//! 2. Config file (.retrain/config.yaml)
//! 3. Defaults (~/.retrain)
//!
//! Config file discovery:
//! - Searches current directory and parents for .retrain/config.yaml
//! - `paths.home` is relative to the .retrain/ directory; the other paths
//!   are relative to the project root (the parent of .retrain/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::ProjectCommand;
use crate::store::fs::DEFAULT_ARTIFACT_NAME;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".retrain";
const DEFAULT_BUCKET: &str = "models";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub builder: Option<BuilderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory: runs, endpoints, locks, build logs
    pub home: Option<String>,
    /// Object-store root holding the artifact bucket
    pub artifacts: Option<String>,
    /// Inference results root
    pub results: Option<String>,
    /// Directory of per-family pipeline definitions
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub bucket: Option<String>,
    pub artifact_name: Option<String>,
}

/// Which build backend runs the stage jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderBackend {
    #[default]
    Process,
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuilderConfig {
    #[serde(default)]
    pub backend: BuilderBackend,
    /// Build service URL (http backend)
    pub base_url: Option<String>,
    /// Project name -> command (process backend)
    #[serde(default)]
    pub projects: HashMap<String, ProjectCommand>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Object-store root
    pub artifacts: PathBuf,
    /// Inference results root
    pub results: PathBuf,
    /// Pipeline definitions directory
    pub pipelines: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store: StoreSettings,
    pub builder: BuilderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub bucket: String,
    pub artifact_name: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            artifact_name: DEFAULT_ARTIFACT_NAME.to_string(),
        }
    }
}

impl ResolvedConfig {
    /// Per-run event logs
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Endpoint registry records
    pub fn endpoints_dir(&self) -> PathBuf {
        self.home.join("endpoints")
    }

    /// Single-flight lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    /// Build job logs of the process backend
    pub fn builds_dir(&self) -> PathBuf {
        self.home.join("builds")
    }

    /// Root of the model artifact bucket
    pub fn bucket_root(&self) -> PathBuf {
        self.artifacts.join(&self.store.bucket)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

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

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge environment, config file and defaults
fn resolve_config(
    config_file: Option<(&Path, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_path, config) = match config_file {
        Some((path, config)) => (Some(path), config),
        None => (None, ConfigFile::default()),
    };

    // .retrain/ and the project root containing it
    let config_dir = config_path.and_then(Path::parent);
    let base_dir = config_dir.and_then(Path::parent);

    let from_file = |dir: Option<&Path>, value: &Option<String>| -> Option<PathBuf> {
        match (dir, value) {
            (Some(dir), Some(value)) => Some(resolve_path(dir, value)),
            (None, Some(value)) => Some(PathBuf::from(value)),
            _ => None,
        }
    };

    let home = env("RETRAIN_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(config_dir, &config.paths.home))
        .unwrap_or(default_home);

    let artifacts = env("RETRAIN_ARTIFACTS")
        .map(PathBuf::from)
        .or_else(|| from_file(base_dir, &config.paths.artifacts))
        .unwrap_or_else(|| home.join("artifacts"));

    let results = from_file(base_dir, &config.paths.results).unwrap_or_else(|| home.join("results"));
    let pipelines =
        from_file(base_dir, &config.paths.pipelines).unwrap_or_else(|| home.join("pipelines"));

    let defaults = StoreSettings::default();
    let store = match config.store {
        Some(store) => StoreSettings {
            bucket: store.bucket.unwrap_or(defaults.bucket),
            artifact_name: store.artifact_name.unwrap_or(defaults.artifact_name),
        },
        None => defaults,
    };

    ResolvedConfig {
        home,
        artifacts,
        results,
        pipelines,
        config_file: config_path.map(Path::to_path_buf),
        store,
        builder: config.builder.unwrap_or_default(),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_path = find_config_file();
    let config_file = match config_path {
        Some(ref path) => Some((path.as_path(), load_config_file(path)?)),
        None => None,
    };

    Ok(resolve_config(
        config_file,
        |name| std::env::var(name).ok(),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
