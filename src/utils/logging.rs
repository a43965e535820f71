//! Logging initialization for Aisbot.
//!
//! Supports three formats:
//! - `pretty`: multi-line human-readable output
//! - `component`: compact single-line output; use [`log_component!`] to tag
//!   events with a subsystem (`bus`, `agent`, `compression`)
//! - `json`: JSON lines for log aggregators, optionally written to a file

use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AisbotError, Result};

/// Install the global tracing subscriber from config.
///
/// `RUST_LOG` wins over `cfg.level` when set.
///
/// # Errors
/// Fails if the log file cannot be opened or a global subscriber was
/// already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let installed = match (cfg.format, &cfg.file) {
        (LogFormat::Json, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        (LogFormat::Json, None) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        (LogFormat::Pretty, _) => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .try_init(),
        (LogFormat::Component, _) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init(),
    };

    installed.map_err(|e| AisbotError::Config(format!("failed to install logger: {}", e)))
}

/// Emit a component-tagged tracing event.
///
/// ```
/// # use aisbot::log_component;
/// log_component!(info, "bus", "journal compacted");
/// log_component!(warn, "compression", "over budget", final_tokens = 13000u64, target = 12000u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.format, LogFormat::Component);
        assert_eq!(cfg.level, "info");
        assert!(cfg.file.is_none());
    }

    #[test]
    fn test_log_format_deserialize() {
        let cfg: LoggingConfig =
            serde_json::from_str(r#"{"format":"json","level":"debug"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");

        let cfg: LoggingConfig = serde_json::from_str(r#"{"format":"pretty"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn test_init_logging_twice_is_an_error_not_a_panic() {
        let cfg = LoggingConfig::default();
        let first = init_logging(&cfg);
        let second = init_logging(&cfg);
        // Another test may have installed a subscriber first; either way the
        // second call must fail cleanly.
        let _ = first;
        assert!(second.is_err());
    }

    #[test]
    fn test_log_component_macro_compiles() {
        log_component!(debug, "bus", "test event");
        log_component!(debug, "agent", "test event", iteration = 1u32);
    }
}
