//! Host Configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the extension host.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables (prefixed with `PLUGIN_HOST_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PLUGIN_HOST_LOGGING__LEVEL=debug
//! PLUGIN_HOST_LOADER__WORKERS=1
//! PLUGIN_HOST_PATHS__ROOT=/srv/host
//! ```
//!
//! # Example
//!
//! ```no_run
//! use plugin_host::config::HostConfig;
//!
//! let config = HostConfig::load_from("plugin-host.toml")?;
//! println!("Plugins: {}", config.paths.plugins_dir().display());
//! # Ok::<(), plugin_host::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration sources could not be merged or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Configuration parsed but is logically invalid
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory layout
    #[serde(default)]
    pub paths: PathsConfig,
    /// Load job scheduling and script limits
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Directory layout. Relative entries are resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory of the host
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Candidate extension files
    #[serde(default = "default_plugins")]
    pub plugins: PathBuf,
    /// Per-extension private storage
    #[serde(default = "default_data")]
    pub data: PathBuf,
    /// Dependency libraries, one subdirectory per namespace
    #[serde(default = "default_lib")]
    pub lib: PathBuf,
    /// Compiled artifacts, one file per checksum
    #[serde(default = "default_cache")]
    pub cache: PathBuf,
}

/// Load job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Worker pool size; defaults to the available hardware parallelism
    #[serde(default)]
    pub workers: Option<usize>,
    /// Operation limit for a single script run (0 = unlimited)
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    /// Enable every extension once discovery has been submitted
    #[serde(default = "default_auto_enable")]
    pub auto_enable: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the compact human format
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_plugins() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_data() -> PathBuf {
    PathBuf::from("data")
}

fn default_lib() -> PathBuf {
    PathBuf::from("lib")
}

fn default_cache() -> PathBuf {
    PathBuf::from("cache")
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_auto_enable() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            plugins: default_plugins(),
            data: default_data(),
            lib: default_lib(),
            cache: default_cache(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_operations: default_max_operations(),
            auto_enable: default_auto_enable(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Directory layout
// ============================================================================

impl PathsConfig {
    /// Layout rooted at `root` with the default subdirectory names.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Directory scanned for extension files.
    pub fn plugins_dir(&self) -> PathBuf {
        self.resolve(&self.plugins)
    }

    /// Base directory for per-extension data.
    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.data)
    }

    /// Base directory for dependency libraries.
    pub fn lib_dir(&self) -> PathBuf {
        self.resolve(&self.lib)
    }

    /// Directory holding compiled artifacts.
    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.cache)
    }

    /// Create the four host directories if they are missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.plugins_dir(),
            self.data_dir(),
            self.lib_dir(),
            self.cache_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl LoaderConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl HostConfig {
    /// Load configuration from a specific file path and environment variables.
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`PLUGIN_HOST_` prefix)
    /// 2. the TOML file, if it exists
    /// 3. built-in defaults
    ///
    /// After loading, configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is invalid or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLUGIN_HOST_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Worker count, when given, is non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.loader.workers == Some(0) {
            return Err(ConfigError::ValidationError(
                "loader.workers must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
