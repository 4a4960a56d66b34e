//! ---
//! shdr_section: "01-core-functionality"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Shared primitives and utilities for the SHDR runtime."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::device::DeviceConfig;
use crate::logging::LogFormat;

fn default_adapter_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7878))
}

fn default_adapter_heartbeat() -> Duration {
    Duration::from_millis(10_000)
}

fn default_broadcast_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_write_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_output_timestamps() -> bool {
    true
}

fn default_client_queue_capacity() -> usize {
    1_024
}

fn default_agent_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_agent_port() -> u16 {
    7878
}

fn default_reconnect_interval() -> Duration {
    Duration::from_millis(2_000)
}

fn default_agent_heartbeat() -> Duration {
    Duration::from_millis(60_000)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_file_output() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for SHDR processes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShdrConfig {
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`ShdrConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ShdrConfig,
    pub source: PathBuf,
}

impl ShdrConfig {
    pub const ENV_CONFIG_PATH: &str = "SHDR_CONFIG";

    /// Load configuration from disk, respecting the `SHDR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<ShdrConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.adapter.validate()?;
        self.agent.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for ShdrConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ShdrConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Adapter-side server settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_adapter_listen")]
    pub listen: SocketAddr,
    /// Heartbeat advertised to agents in `* PONG <ms>`.
    #[serde(rename = "heartbeat_ms", default = "default_adapter_heartbeat")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat: Duration,
    /// Period of the delta broadcast loop.
    #[serde(rename = "interval_ms", default = "default_broadcast_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(rename = "write_timeout_ms", default = "default_write_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_timeout: Duration,
    /// When false, lines are sent without a timestamp and readers stamp on receipt.
    #[serde(default = "default_output_timestamps")]
    pub output_timestamps: bool,
    /// Lines buffered per connected client before it is considered stalled.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
    /// Extra `* name: value` commands announced to every new client.
    #[serde(default)]
    pub commands: IndexMap<String, String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            listen: default_adapter_listen(),
            heartbeat: default_adapter_heartbeat(),
            interval: default_broadcast_interval(),
            write_timeout: default_write_timeout(),
            output_timestamps: default_output_timestamps(),
            client_queue_capacity: default_client_queue_capacity(),
            commands: IndexMap::new(),
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("adapter interval_ms must be greater than zero"));
        }
        if self.heartbeat.is_zero() {
            return Err(anyhow!("adapter heartbeat_ms must be greater than zero"));
        }
        if self.write_timeout.is_zero() {
            return Err(anyhow!("adapter write_timeout_ms must be greater than zero"));
        }
        if self.client_queue_capacity == 0 {
            return Err(anyhow!("adapter client_queue_capacity must be greater than zero"));
        }
        for name in self.commands.keys() {
            if name.contains(':') || name.contains('\n') {
                return Err(anyhow!("adapter command name '{}' is not valid", name));
            }
        }
        Ok(())
    }
}

/// Agent-side client settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_host")]
    pub host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(rename = "reconnect_interval_ms", default = "default_reconnect_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_interval: Duration,
    /// Heartbeat assumed until the adapter answers with a PONG.
    #[serde(rename = "heartbeat_ms", default = "default_agent_heartbeat")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat: Duration,
    #[serde(rename = "connect_timeout_ms", default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(rename = "write_timeout_ms", default = "default_write_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_agent_host(),
            port: default_agent_port(),
            device: DeviceConfig::default(),
            reconnect_interval: default_reconnect_interval(),
            heartbeat: default_agent_heartbeat(),
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

impl AgentConfig {
    /// `host:port` of the remote adapter.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("agent host must not be empty"));
        }
        let periods = [
            ("reconnect_interval_ms", self.reconnect_interval),
            ("heartbeat_ms", self.heartbeat),
            ("connect_timeout_ms", self.connect_timeout),
            ("write_timeout_ms", self.write_timeout),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(anyhow!("agent {} must be greater than zero", name));
        }
        // An agent section without a device is allowed for adapter-only deployments.
        if !self.device.name.is_empty() || !self.device.data_items.is_empty() {
            self.device.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Filter used when neither `SHDR_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily rolling JSON file per role.
    #[serde(default = "default_file_output")]
    pub file_output: bool,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            level: default_log_level(),
            file_output: default_file_output(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Category, Representation};
    use std::io::Write;

    const SAMPLE: &str = r#"
[adapter]
listen = "127.0.0.1:7879"
interval_ms = 250
heartbeat_ms = 5000

[adapter.commands]
manufacturer = "Acme"

[agent]
host = "10.0.0.5"
reconnect_interval_ms = 1500

[agent.device]
name = "mill-1"

[[agent.device.data_items]]
id = "avail"
category = "EVENT"

[[agent.device.data_items]]
id = "system"
name = "system_cond"
category = "CONDITION"

[[agent.device.data_items]]
id = "vars"
category = "EVENT"
representation = "DATA_SET"
"#;

    #[test]
    fn parses_full_document() {
        let config: ShdrConfig = SAMPLE.parse().expect("config parses");
        assert_eq!(config.adapter.listen.port(), 7879);
        assert_eq!(config.adapter.interval, Duration::from_millis(250));
        assert_eq!(config.adapter.heartbeat, Duration::from_millis(5000));
        assert_eq!(config.adapter.write_timeout, Duration::from_millis(5000));
        assert!(config.adapter.output_timestamps);
        assert_eq!(
            config.adapter.commands.get("manufacturer").map(String::as_str),
            Some("Acme")
        );

        assert_eq!(config.agent.endpoint(), "10.0.0.5:7878");
        assert_eq!(config.agent.reconnect_interval, Duration::from_millis(1500));
        assert_eq!(config.agent.heartbeat, Duration::from_millis(60_000));
        let items = &config.agent.device.data_items;
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].category, Category::Condition);
        assert_eq!(items[1].name.as_deref(), Some("system_cond"));
        assert_eq!(items[2].representation, Representation::DataSet);
    }

    #[test]
    fn defaults_apply_to_empty_document() {
        let config: ShdrConfig = "".parse().expect("empty config parses");
        assert_eq!(config.adapter.listen.port(), 7878);
        assert_eq!(config.adapter.interval, Duration::from_millis(100));
        assert_eq!(config.agent.reconnect_interval, Duration::from_millis(2000));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = "[adapter]\ninterval_ms = 0\n".parse::<ShdrConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn zero_agent_periods_are_rejected() {
        for field in [
            "heartbeat_ms",
            "connect_timeout_ms",
            "write_timeout_ms",
            "reconnect_interval_ms",
        ] {
            let err = format!("[agent]\n{field} = 0\n")
                .parse::<ShdrConfig>()
                .expect_err("zero period is rejected");
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn load_with_source_picks_first_existing_candidate() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write config");
        let missing = PathBuf::from("/definitely/not/here.toml");
        let loaded =
            ShdrConfig::load_with_source(&[missing, file.path().to_path_buf()]).expect("loads");
        assert_eq!(loaded.source, file.path());
        assert_eq!(loaded.config.agent.device.name, "mill-1");
    }
}
