use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::orchestrator::OrchestratorSettings;
use crate::core::transport::{CommandProtocol, Credentials, TransportSettings};
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "fwpilot.toml";
pub const MANIFEST_FILE: &str = "images.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Device access. Credentials never live in the file; only the names of the
/// environment variables holding them do.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_username_env")]
    pub username_env: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_enable_secret_env")]
    pub enable_secret_env: String,
    #[serde(default = "default_structured_port")]
    pub structured_port: u16,
    /// `ssh`, or `telnet` for devices that cannot run SSH.
    #[serde(default)]
    pub command_protocol: CommandProtocol,
    /// Defaults to the protocol's well-known port.
    #[serde(default)]
    pub command_port: Option<u16>,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// Configuration line that enables the structured channel.
    #[serde(default = "default_structured_feature")]
    pub structured_feature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// How often scheduled jobs are swept for missed timers.
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Live events buffered per subscriber before it starts losing them.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImagesConfig {
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8640
}
fn default_username_env() -> String {
    "FWPILOT_USERNAME".to_string()
}
fn default_password_env() -> String {
    "FWPILOT_PASSWORD".to_string()
}
fn default_enable_secret_env() -> String {
    "FWPILOT_ENABLE_SECRET".to_string()
}
fn default_structured_port() -> u16 {
    443
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_command_timeout() -> u64 {
    60
}
fn default_copy_timeout() -> u64 {
    3600
}
fn default_install_timeout() -> u64 {
    2700
}
fn default_structured_feature() -> String {
    "restconf".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_sweep_cron() -> String {
    "0/30 * * * * *".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_event_capacity() -> usize {
    crate::core::events::DEFAULT_CAPACITY
}
fn default_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            username_env: default_username_env(),
            password_env: default_password_env(),
            enable_secret_env: default_enable_secret_env(),
            structured_port: default_structured_port(),
            command_protocol: CommandProtocol::default(),
            command_port: None,
            known_hosts: None,
            verify_tls: false,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            copy_timeout_secs: default_copy_timeout(),
            install_timeout_secs: default_install_timeout(),
            structured_feature: default_structured_feature(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            sweep_cron: default_sweep_cron(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl AppConfig {
    /// Default location: `<data_dir>/fwpilot.toml`.
    pub fn default_path() -> PathBuf {
        NativePlatform::data_dir().join(CONFIG_FILE)
    }

    /// Read the config file. A missing file yields the defaults.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        self.log_level()?;
        if self.workers.max_concurrent == 0 {
            bail!("workers.max_concurrent must be at least 1");
        }
        if self.workers.event_capacity == 0 {
            bail!("workers.event_capacity must be at least 1");
        }
        self.scheduler
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| {
                anyhow!(
                    "scheduler.default_timezone '{}' is not an IANA timezone",
                    self.scheduler.default_timezone
                )
            })?;
        tokio_cron_scheduler::Job::new(self.scheduler.sweep_cron.as_str(), |_uuid, _l| {})
            .map_err(|e| {
                anyhow!(
                    "scheduler.sweep_cron '{}' is invalid: {}",
                    self.scheduler.sweep_cron,
                    e
                )
            })?;
        if let Some(base) = &self.images.base_url
            && !(base.starts_with("http://")
                || base.starts_with("https://")
                || base.starts_with("ftp://")
                || base.starts_with("tftp://")
                || base.starts_with("scp://"))
        {
            bail!("images.base_url '{}' has no supported scheme", base);
        }
        if self.transport.structured_feature.trim().is_empty() {
            bail!("transport.structured_feature must not be empty");
        }
        if self.transport.command_protocol == CommandProtocol::Telnet
            && self.transport.known_hosts.is_some()
        {
            bail!("transport.known_hosts only applies to command_protocol = \"ssh\"");
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .parse()
            .map_err(|_| anyhow!("logging.level '{}' is not a log level", self.logging.level))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(NativePlatform::data_dir)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.images
            .manifest
            .clone()
            .unwrap_or_else(|| self.data_dir().join(MANIFEST_FILE))
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let t = &self.transport;
        TransportSettings {
            structured_port: t.structured_port,
            command_protocol: t.command_protocol,
            command_port: t
                .command_port
                .unwrap_or_else(|| t.command_protocol.default_port()),
            known_hosts: t.known_hosts.clone(),
            verify_tls: t.verify_tls,
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            command_timeout: Duration::from_secs(t.command_timeout_secs),
            copy_timeout: Duration::from_secs(t.copy_timeout_secs),
            install_timeout: Duration::from_secs(t.install_timeout_secs),
            structured_feature: t.structured_feature.trim().to_string(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrent: self.workers.max_concurrent,
            default_timezone: self.scheduler.default_timezone.clone(),
            image_base_url: self.images.base_url.clone(),
        }
    }

    /// Device credentials from the configured environment variables.
    pub fn credentials(&self) -> Result<Credentials> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
        };
        let username = read(&self.transport.username_env).ok_or_else(|| {
            anyhow!(
                "environment variable {} (device username) is not set",
                self.transport.username_env
            )
        })?;
        let password = read(&self.transport.password_env).ok_or_else(|| {
            anyhow!(
                "environment variable {} (device password) is not set",
                self.transport.password_env
            )
        })?;
        Ok(Credentials {
            username,
            password,
            enable_secret: read(&self.transport.enable_secret_env),
        })
    }
}
