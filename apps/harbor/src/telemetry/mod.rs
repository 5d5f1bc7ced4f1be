//! Process-wide tracing setup for the `harbor` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::ClientConfig;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Verbose levels only open up harbor's own targets; the websocket stack
    /// stays at info.
    fn directives(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "info,harbor=debug,harbor_client_core=debug,state_bus=debug",
            LogLevel::Trace => "info,harbor=trace,harbor_client_core=trace,state_bus=trace",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Replaces the level's directives when non-blank.
    pub filter: Option<String>,
}

impl LogConfig {
    pub fn for_client(client: &ClientConfig, level: LogLevel, file: Option<PathBuf>) -> Self {
        Self {
            level,
            file,
            filter: client.log_filter.clone(),
        }
    }

    pub fn directives(&self) -> &str {
        match self.filter.as_deref().map(str::trim) {
            Some(filter) if !filter.is_empty() => filter,
            _ => self.level.directives(),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, InitError> {
        let directives = self.directives();
        EnvFilter::try_new(directives).map_err(|err| InitError::Filter {
            directives: directives.to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {directives:?}: {reason}")]
    Filter { directives: String, reason: String },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls after a successful init do nothing.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = config.env_filter()?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_filter_replaces_level_directives() {
        let mut client = ClientConfig::default();
        let config = LogConfig::for_client(&client, LogLevel::Debug, None);
        assert_eq!(config.filter, None);
        assert!(config.directives().contains("harbor=debug"));
        assert!(!config.directives().contains("tungstenite"));

        client.log_filter = Some("harbor::connection=trace".into());
        let config = LogConfig::for_client(&client, LogLevel::Warn, None);
        assert_eq!(config.directives(), "harbor::connection=trace");
    }

    #[test]
    fn blank_filter_falls_back_to_level() {
        let config = LogConfig {
            level: LogLevel::Error,
            file: None,
            filter: Some("   ".into()),
        };
        assert_eq!(config.directives(), "error");
        assert_eq!(LogConfig::default().directives(), "warn");
    }

    #[test]
    fn malformed_filter_is_reported() {
        let config = LogConfig {
            filter: Some("harbor=loudest".into()),
            ..LogConfig::default()
        };
        let err = config.env_filter().unwrap_err();
        assert!(matches!(err, InitError::Filter { ref directives, .. } if directives == "harbor=loudest"));
        assert!(LogConfig::default().env_filter().is_ok());
    }
}
