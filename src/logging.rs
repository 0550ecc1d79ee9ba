//! Logging setup for the primary and its workers.
//!
//! Everything is written to stderr; a worker's stdout is its IPC pipe.
//! Core log lines carry `operation` and `index_prefix` fields so they can be
//! grouped the same way as the application's own logs.
//!
//! # Environment Variables
//!
//! - `CLUSTERBUS_LOG` - Log filter (overrides RUST_LOG)
//! - `CLUSTERBUS_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `CLUSTERBUS_LOG_FORMAT` - Output format: pretty, compact, json
//! - `CLUSTERBUS_LOG_FILE` - Path to log file (in addition to stderr)
//! - `CLUSTERBUS_LOG_ROTATION` - File rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use clusterbus::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration, built up from CLI flags then environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Output format (default: Pretty)
    pub format: LogFormat,
    /// Extra log file (default: stderr only)
    pub file_path: Option<PathBuf>,
    /// Rotation for the log file (default: Daily)
    pub rotation: LogRotation,
    /// Filter directive, overrides `level` when set
    pub filter: Option<String>,
    /// Show the target module (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Give worker `worker_id` its own log file next to the configured one,
    /// so processes never rotate the same file: `cluster.log` becomes
    /// `cluster-w3.log`.
    pub fn for_worker(mut self, worker_id: usize) -> Self {
        if let Some(path) = self.file_path.take() {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "clusterbus".into());
            let name = match path.extension() {
                Some(ext) => format!("{}-w{}.{}", stem, worker_id, ext.to_string_lossy()),
                None => format!("{}-w{}", stem, worker_id),
            };
            self.file_path = Some(path.with_file_name(name));
        }
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line is kept; env vars only
    /// fill in what the CLI left unset.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, for tests.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = lookup("CLUSTERBUS_LOG").or_else(|| lookup("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = lookup("CLUSTERBUS_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Some(format) = lookup("CLUSTERBUS_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if self.file_path.is_none()
            && let Some(path) = lookup("CLUSTERBUS_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Some(rotation) = lookup("CLUSTERBUS_LOG_ROTATION")
            && let Ok(rotation) = rotation.parse()
        {
            self.rotation = rotation;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let parent = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clusterbus.log");
        Some(RollingFileAppender::new(self.rotation.into(), parent, file_name))
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, show_target: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(show_target)
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

/// Initialize the global tracing subscriber: stderr, plus the log file when
/// one is configured.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![fmt_layer(
        config.format,
        config.show_target,
        true,
        std::io::stderr,
    )];
    if let Some(appender) = config.file_appender() {
        layers.push(fmt_layer(config.format, config.show_target, false, appender));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_env_overrides() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("CLUSTERBUS_LOG_LEVEL", "debug"),
            ("CLUSTERBUS_LOG_FORMAT", "json"),
            ("CLUSTERBUS_LOG_FILE", "/tmp/cluster.log"),
            ("CLUSTERBUS_LOG_ROTATION", "never"),
        ]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/cluster.log")));
        assert_eq!(config.rotation, LogRotation::Never);
    }

    #[test]
    fn test_cli_filter_wins_over_env() {
        let config = LogConfig::new()
            .with_filter("clusterbus=trace".into())
            .with_overrides_from(env(&[
                ("CLUSTERBUS_LOG", "warn"),
                ("CLUSTERBUS_LOG_LEVEL", "error"),
            ]));
        assert_eq!(config.filter.as_deref(), Some("clusterbus=trace"));
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_clusterbus_log_preferred_over_rust_log() {
        let config = LogConfig::new()
            .with_overrides_from(env(&[("CLUSTERBUS_LOG", "debug"), ("RUST_LOG", "error")]));
        assert_eq!(config.filter.as_deref(), Some("debug"));

        let config = LogConfig::new().with_overrides_from(env(&[("RUST_LOG", "error")]));
        assert_eq!(config.filter.as_deref(), Some("error"));
    }

    #[test]
    fn test_file_appender_only_when_configured() {
        assert!(LogConfig::new().file_appender().is_none());

        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::new()
            .with_file(dir.path().join("cluster.log"))
            .with_rotation(LogRotation::Never);
        assert!(config.file_appender().is_some());
    }

    #[test]
    fn test_worker_gets_own_log_file() {
        let config = LogConfig::new()
            .with_file(PathBuf::from("/var/log/cluster.log"))
            .for_worker(3);
        assert_eq!(config.file_path, Some(PathBuf::from("/var/log/cluster-w3.log")));

        let config = LogConfig::new().with_file(PathBuf::from("logs/cluster")).for_worker(12);
        assert_eq!(config.file_path, Some(PathBuf::from("logs/cluster-w12")));

        assert_eq!(LogConfig::new().for_worker(1).file_path, None);
    }
}
