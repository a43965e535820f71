//! Configuration management for Aisbot
//!
//! Configuration is loaded from `~/.aisbot/config.json`, then environment
//! variable overrides (`AISBOT_SECTION_KEY`) are applied, then the result is
//! validated. A process-wide copy can be installed with [`Config::init`].

mod types;
pub mod validate;

pub use types::*;

use crate::error::{AisbotError, Result};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

/// Parse an env var into `target`, leaving it untouched when unset or invalid.
fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        match val.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(key = key, value = %val, "Ignoring unparseable env override"),
        }
    }
}

impl Config {
    /// Returns the Aisbot configuration directory path (~/.aisbot)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aisbot")
    }

    /// Returns the path to the config file (~/.aisbot/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// A missing file yields the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    ///
    /// # Errors
    /// Returns `AisbotError::Json` for malformed files and
    /// `AisbotError::Config` when the merged configuration is invalid.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let raw: serde_json::Value = serde_json::from_str(&content)?;
            for diag in validate::validate_config(&raw) {
                if diag.level != validate::DiagnosticLevel::Ok {
                    warn!(path = %diag.path, "{}", diag.message);
                }
            }
            serde_json::from_value(raw)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: AISBOT_SECTION_SUBSECTION_KEY
    fn apply_env_overrides(&mut self) {
        let defaults = &mut self.agents.defaults;
        if let Ok(val) = std::env::var("AISBOT_AGENTS_DEFAULTS_WORKSPACE") {
            defaults.workspace = val;
        }
        if let Ok(val) = std::env::var("AISBOT_AGENTS_DEFAULTS_MODEL") {
            defaults.model = val;
        }
        override_parsed("AISBOT_AGENTS_DEFAULTS_MAX_TOKENS", &mut defaults.max_tokens);
        override_parsed("AISBOT_AGENTS_DEFAULTS_TEMPERATURE", &mut defaults.temperature);
        override_parsed(
            "AISBOT_AGENTS_DEFAULTS_MAX_TOOL_ITERATIONS",
            &mut defaults.max_tool_iterations,
        );
        override_parsed(
            "AISBOT_AGENTS_DEFAULTS_TOOL_TIMEOUT_SECS",
            &mut defaults.tool_timeout_secs,
        );
        override_parsed(
            "AISBOT_AGENTS_DEFAULTS_PROVIDER_TIMEOUT_SECS",
            &mut defaults.provider_timeout_secs,
        );
        override_parsed(
            "AISBOT_AGENTS_DEFAULTS_MAX_CONCURRENT_SESSIONS",
            &mut defaults.max_concurrent_sessions,
        );

        let compression = &mut self.compression;
        override_parsed("AISBOT_COMPRESSION_ENABLED", &mut compression.enabled);
        override_parsed("AISBOT_COMPRESSION_STRATEGY", &mut compression.strategy);
        override_parsed(
            "AISBOT_COMPRESSION_MAX_CONTEXT_TOKENS",
            &mut compression.max_context_tokens,
        );
        override_parsed(
            "AISBOT_COMPRESSION_TARGET_CONTEXT_TOKENS",
            &mut compression.target_context_tokens,
        );
        override_parsed(
            "AISBOT_COMPRESSION_RECENT_MESSAGES_KEEP",
            &mut compression.recent_messages_keep,
        );

        if let Ok(val) = std::env::var("AISBOT_BUS_STORAGE_PATH") {
            self.bus.storage_path = Some(val);
        }
        override_parsed("AISBOT_BUS_MAX_RETRIES", &mut self.bus.max_retries);
        override_parsed(
            "AISBOT_BUS_VISIBILITY_TIMEOUT_SECS",
            &mut self.bus.visibility_timeout_secs,
        );
        override_parsed("AISBOT_BUS_FSYNC", &mut self.bus.fsync);

        if let Ok(val) = std::env::var("AISBOT_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Check semantic constraints.
    ///
    /// # Errors
    /// Returns the first error-level diagnostic as `AisbotError::Config`.
    pub fn validate(&self) -> Result<()> {
        match validate::check_semantics(self)
            .into_iter()
            .find(|d| d.level == validate::DiagnosticLevel::Error)
        {
            Some(diag) => Err(AisbotError::Config(format!(
                "{}: {}",
                diag.path, diag.message
            ))),
            None => Ok(()),
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Initialize the global configuration from the default path.
    ///
    /// Subsequent calls return an error.
    pub fn init() -> Result<()> {
        Self::init_with(Self::load()?)
    }

    /// Initialize the global configuration with a specific config.
    pub fn init_with(config: Config) -> Result<()> {
        CONFIG
            .set(RwLock::new(config))
            .map_err(|_| AisbotError::Config("Configuration already initialized".to_string()))
    }

    /// Get a clone of the current global configuration.
    ///
    /// Returns default configuration if not yet initialized.
    pub fn get() -> Config {
        CONFIG
            .get()
            .and_then(|lock| lock.read().ok())
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Returns the expanded workspace path (resolves ~ to home directory)
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// Returns the queue journal path.
    pub fn bus_storage_path(&self) -> PathBuf {
        match &self.bus.storage_path {
            Some(p) => expand_home(p),
            None => Self::dir().join("bus").join("queue.jsonl"),
        }
    }
}

/// Expand ~ to home directory in a path string
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
