//! Logging setup for the memwatch binaries.
//!
//! All diagnostics go through `tracing` to stderr. Stdout is reserved for
//! access lines, so the two streams never interleave.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Use ANSI colors
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            timestamps: true,
            show_target: true,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Create a verbose configuration for debugging the watcher itself
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Set log level
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Parse level string to tracing Level
    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Can be called multiple times; only the first call installs a subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.show_target)
        .with_writer(std::io::stderr);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    let _ = result;
}
