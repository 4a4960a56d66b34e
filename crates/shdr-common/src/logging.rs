//! ---
//! shdr_section: "01-core-functionality"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Shared primitives and utilities for the SHDR runtime."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fmt;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as layers;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "SHDR_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Which end of an SHDR connection the process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// Serves observations to agents.
    Adapter,
    /// Reads observations from an adapter.
    Agent,
}

impl LogRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogRole::Adapter => "adapter",
            LogRole::Agent => "agent",
        }
    }
}

impl fmt::Display for LogRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling file name for `role`, e.g. `shdrd-adapter.log`.
pub fn log_file_name(config: &LoggingConfig, role: LogRole) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or("shdrd");
    format!("{}-{}.log", prefix, role)
}

/// `SHDR_LOG`, then `RUST_LOG`, then the configured level. An invalid
/// directive is reported on stderr and the next source is tried.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    for var in [LOG_ENV, EnvFilter::DEFAULT_ENV] {
        if let Ok(directive) = std::env::var(var) {
            match EnvFilter::try_new(&directive) {
                Ok(filter) => return filter,
                Err(err) => eprintln!("ignoring invalid {} directive ({})", var, err),
            }
        }
    }
    EnvFilter::try_new(&config.level).unwrap_or_else(|err| {
        eprintln!(
            "invalid logging.level '{}' ({}); defaulting to info",
            config.level, err
        );
        EnvFilter::new("info")
    })
}

/// Install the global subscriber for one `shdrd` role.
///
/// stdout gets pretty or JSON output. With `file_output` set, a daily rolling
/// JSON file named by [`log_file_name`] is written as well, so an adapter and
/// an agent sharing a log directory keep separate files.
pub fn init_tracing(role: LogRole, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => layers::layer()
            .with_target(false)
            .with_timer(layers::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => layers::layer()
            .with_target(true)
            .with_timer(layers::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file_output {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let appender = daily(&config.directory, log_file_name(config, role));
        let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(file_guard);
        Some(
            layers::layer()
                .with_target(true)
                .with_timer(layers::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        role = %role,
        log_dir = %config.directory.display(),
        file_output = config.file_output,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_per_role() {
        let mut config = LoggingConfig::default();
        assert_eq!(log_file_name(&config, LogRole::Adapter), "shdrd-adapter.log");
        assert_eq!(log_file_name(&config, LogRole::Agent), "shdrd-agent.log");

        config.file_prefix = Some("cell-7".into());
        assert_eq!(log_file_name(&config, LogRole::Agent), "cell-7-agent.log");
    }

    #[test]
    fn logging_section_defaults() {
        let config: LoggingConfig = toml::from_str("").expect("empty section parses");
        assert_eq!(config.level, "info");
        assert!(config.file_output);
        assert_eq!(config.format, LogFormat::Pretty);

        let config: LoggingConfig =
            toml::from_str("level = \"debug\"\nfile_output = false\nformat = \"structured-json\"")
                .expect("section parses");
        assert_eq!(config.level, "debug");
        assert!(!config.file_output);
        assert_eq!(config.format, LogFormat::StructuredJson);
    }
}
