//! Device communication.
//!
//! Two channels reach a device: a structured RESTCONF channel that returns
//! YANG-modelled JSON, and a line-oriented command channel. `DeviceSession`
//! hides both behind one set of logical reads and actions, preferring the
//! structured channel and re-deriving the same data from command output
//! when it is not available. The command channel runs over SSH unless telnet
//! is explicitly configured.

pub mod parse;
mod restconf;
mod session;
mod ssh;
mod vty;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub use restconf::RestconfChannel;
pub use session::DeviceSession;
pub use vty::VtySession;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{address}: channel unavailable: {reason}")]
    ChannelUnavailable { address: String, reason: String },
    #[error("{address}: authentication rejected")]
    Auth { address: String },
    #[error("{address}: {operation} timed out after {}s", .elapsed.as_secs())]
    Timeout {
        address: String,
        operation: String,
        elapsed: Duration,
    },
    #[error("{address}: connection failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("{address}: {reason}")]
    Protocol { address: String, reason: String },
}

impl TransportError {
    pub fn unavailable(address: &str, reason: impl Into<String>) -> Self {
        TransportError::ChannelUnavailable {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn protocol(address: &str, reason: impl Into<String>) -> Self {
        TransportError::Protocol {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn connect(address: &str, reason: impl Into<String>) -> Self {
        TransportError::Connect {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(address: &str, operation: impl Into<String>, elapsed: Duration) -> Self {
        TransportError::Timeout {
            address: address.to_string(),
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth { .. })
    }

    /// Errors that mean the device could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Answer sent when a line of output contains `prompt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptReply {
    pub prompt: String,
    pub reply: String,
}

impl PromptReply {
    pub fn new(prompt: &str, reply: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
pub trait StructuredChannel: Send + Sync {
    /// GET a data path relative to `/restconf/data/`.
    async fn get(&self, path: &str) -> Result<serde_json::Value, TransportError>;
}

#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run a command and return its output without the echo and trailing prompt.
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Run a command, answering known prompts as they appear. Every complete
    /// output line is also forwarded to `sink`. A session closed by the
    /// device mid-command (a reload) ends the output instead of failing.
    async fn exec_interactive(
        &mut self,
        command: &str,
        replies: &[PromptReply],
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError>;

    /// Apply configuration lines inside `configure terminal`.
    async fn configure(
        &mut self,
        lines: &[String],
        timeout: Duration,
    ) -> Result<String, TransportError>;

    async fn close(&mut self);
}

/// Opens fresh channels to a device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open_structured(
        &self,
        address: &str,
    ) -> Result<Box<dyn StructuredChannel>, TransportError>;

    async fn open_command(&self, address: &str) -> Result<Box<dyn CommandChannel>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub enable_secret: Option<String>,
}

/// Wire protocol of the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandProtocol {
    #[default]
    Ssh,
    /// Cleartext; only for lab gear without SSH.
    Telnet,
}

impl CommandProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandProtocol::Ssh => "ssh",
            CommandProtocol::Telnet => "telnet",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            CommandProtocol::Ssh => 22,
            CommandProtocol::Telnet => 23,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub structured_port: u16,
    pub command_protocol: CommandProtocol,
    pub command_port: u16,
    /// OpenSSH known_hosts file SSH host keys are checked against. Without
    /// one, any host key is accepted and its fingerprint logged.
    pub known_hosts: Option<PathBuf>,
    pub verify_tls: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub copy_timeout: Duration,
    pub install_timeout: Duration,
    /// Configuration line that turns the structured channel on.
    pub structured_feature: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            structured_port: 443,
            command_protocol: CommandProtocol::Ssh,
            command_port: CommandProtocol::Ssh.default_port(),
            known_hosts: None,
            verify_tls: false,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(60),
            copy_timeout: Duration::from_secs(3600),
            install_timeout: Duration::from_secs(2700),
            structured_feature: "restconf".to_string(),
        }
    }
}

/// Connector for real devices: RESTCONF over HTTPS and a VTY line session
/// over SSH or telnet.
pub struct DeviceConnector {
    credentials: Credentials,
    settings: TransportSettings,
}

impl DeviceConnector {
    pub fn new(credentials: Credentials, settings: TransportSettings) -> Self {
        Self {
            credentials,
            settings,
        }
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn open_structured(
        &self,
        address: &str,
    ) -> Result<Box<dyn StructuredChannel>, TransportError> {
        let channel = RestconfChannel::connect(address, &self.credentials, &self.settings).await?;
        Ok(Box::new(channel))
    }

    async fn open_command(&self, address: &str) -> Result<Box<dyn CommandChannel>, TransportError> {
        let session = VtySession::connect(address, &self.credentials, &self.settings).await?;
        Ok(Box::new(session))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub hostname: Option<String>,
    pub model: String,
    pub serial: Option<String>,
    pub version: String,
    pub config_register: Option<String>,
    pub system_image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub total_bytes: Option<u64>,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootFlags {
    pub ignore_startup_config: bool,
    pub config_register: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Committed,
    Uncommitted,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Enabled,
    Disabled,
    Unknown,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Enabled => "enabled",
            ChannelState::Disabled => "disabled",
            ChannelState::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enabled" => Some(ChannelState::Enabled),
            "disabled" => Some(ChannelState::Disabled),
            "unknown" => Some(ChannelState::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Succeeded(String),
    Failed(String),
}
