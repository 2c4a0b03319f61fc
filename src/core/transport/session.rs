use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::parse;
use super::{
    BootFlags, ChannelState, CommandChannel, Connector, FilesystemUsage, InstallState,
    PromptReply, StructuredChannel, SystemFacts, TransportError, TransportSettings,
};
use crate::core::profile::DeviceFamily;

enum StructuredState {
    Untried,
    Available(Box<dyn StructuredChannel>),
    Unavailable(String),
}

/// One exclusive conversation with a device over both channels.
///
/// The structured channel is tried on first use and the answer is kept
/// for the life of the session.
pub struct DeviceSession {
    address: String,
    connector: Arc<dyn Connector>,
    settings: TransportSettings,
    structured: StructuredState,
    command: Option<Box<dyn CommandChannel>>,
    auth_rejected: bool,
}

async fn open_with_retry<T, F, Fut>(
    address: &str,
    channel: &str,
    open: F,
) -> Result<T, TransportError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    match open().await {
        Err(err) if err.is_unreachable() => {
            warn!("{} channel to {} failed ({}), retrying once", channel, address, err);
            open().await
        }
        other => other,
    }
}

impl DeviceSession {
    pub fn new(
        address: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            address: address.into(),
            connector,
            settings,
            structured: StructuredState::Untried,
            command: None,
            auth_rejected: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    fn check_auth(&self) -> Result<(), TransportError> {
        if self.auth_rejected {
            return Err(TransportError::Auth {
                address: self.address.clone(),
            });
        }
        Ok(())
    }

    fn note_error(&mut self, err: &TransportError) {
        if err.is_auth() {
            self.auth_rejected = true;
        }
    }

    async fn structured_channel(
        &mut self,
    ) -> Result<Option<&dyn StructuredChannel>, TransportError> {
        self.check_auth()?;
        if matches!(self.structured, StructuredState::Untried) {
            let connector = self.connector.clone();
            let address = self.address.clone();
            let opened =
                open_with_retry(&address, "structured", || connector.open_structured(&address))
                    .await;
            self.structured = match opened {
                Ok(channel) => StructuredState::Available(channel),
                Err(err) if err.is_auth() => {
                    self.auth_rejected = true;
                    return Err(err);
                }
                Err(err) => {
                    debug!("Structured channel unavailable on {}: {}", self.address, err);
                    StructuredState::Unavailable(err.to_string())
                }
            };
        }
        match &self.structured {
            StructuredState::Available(channel) => Ok(Some(&**channel)),
            _ => Ok(None),
        }
    }

    /// Structured read that yields `None` whenever the caller should fall
    /// back to the command channel.
    async fn try_structured(&mut self, path: &str) -> Result<Option<Value>, TransportError> {
        let Some(channel) = self.structured_channel().await? else {
            return Ok(None);
        };
        let result = channel.get(path).await;
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_auth() => {
                self.auth_rejected = true;
                Err(err)
            }
            Err(err) => {
                debug!("Structured query {} failed on {}: {}", path, self.address, err);
                if matches!(
                    err,
                    TransportError::ChannelUnavailable { .. } | TransportError::Connect { .. }
                ) {
                    self.structured = StructuredState::Unavailable(err.to_string());
                }
                Ok(None)
            }
        }
    }

    /// Raw structured query. There is no command-channel equivalent for an
    /// arbitrary path, so an unavailable channel is an error here.
    pub async fn query_structured(&mut self, path: &str) -> Result<Value, TransportError> {
        let Some(channel) = self.structured_channel().await? else {
            let reason = match &self.structured {
                StructuredState::Unavailable(reason) => reason.clone(),
                _ => "not tried".to_string(),
            };
            return Err(TransportError::unavailable(&self.address, reason));
        };
        let result = channel.get(path).await;
        if let Err(err) = &result {
            self.note_error(err);
        }
        result
    }

    pub fn structured_available(&self) -> Option<bool> {
        match self.structured {
            StructuredState::Untried => None,
            StructuredState::Available(_) => Some(true),
            StructuredState::Unavailable(_) => Some(false),
        }
    }

    async fn command_channel(&mut self) -> Result<&mut Box<dyn CommandChannel>, TransportError> {
        self.check_auth()?;
        if self.command.is_none() {
            let connector = self.connector.clone();
            let address = self.address.clone();
            let opened =
                open_with_retry(&address, "command", || connector.open_command(&address)).await;
            match opened {
                Ok(channel) => self.command = Some(channel),
                Err(err) => {
                    self.note_error(&err);
                    return Err(err);
                }
            }
        }
        self.command
            .as_mut()
            .ok_or_else(|| TransportError::unavailable(&self.address, "command channel closed"))
    }

    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(err) = &result {
            self.note_error(err);
            // The device state after a dropped or timed-out command is
            // unknown; a later call opens a fresh session.
            if !matches!(err, TransportError::Protocol { .. }) {
                self.command = None;
            }
        }
        result
    }

    pub async fn run_command(&mut self, command: &str) -> Result<String, TransportError> {
        let timeout = self.settings.command_timeout;
        let channel = self.command_channel().await?;
        let result = channel.exec(command, timeout).await;
        self.settle(result)
    }

    pub async fn exec_interactive(
        &mut self,
        command: &str,
        replies: &[PromptReply],
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        let channel = self.command_channel().await?;
        let result = channel
            .exec_interactive(command, replies, timeout, sink)
            .await;
        self.settle(result)
    }

    async fn read<T>(
        &mut self,
        what: &str,
        structured: Option<(&str, &(dyn Fn(&Value) -> Option<T> + Sync))>,
        command: &str,
        from_command: impl Fn(&str) -> Option<T>,
    ) -> Result<T, TransportError> {
        if let Some((path, from_structured)) = structured
            && let Some(value) = self.try_structured(path).await?
        {
            if let Some(parsed) = from_structured(&value) {
                return Ok(parsed);
            }
            debug!(
                "Structured {} on {} did not parse, using command output",
                what, self.address
            );
        }
        let output = self.run_command(command).await?;
        from_command(&output).ok_or_else(|| {
            TransportError::protocol(
                &self.address,
                format!("could not read {} from '{}' output", what, command),
            )
        })
    }

    pub async fn system_facts(&mut self) -> Result<SystemFacts, TransportError> {
        let mut facts = self
            .read(
                "system facts",
                Some((parse::HARDWARE_PATH, &parse::parse_structured_hardware)),
                "show version",
                parse::parse_show_version,
            )
            .await?;
        if facts.hostname.is_none()
            && let Some(value) = self.try_structured(parse::HOSTNAME_PATH).await?
        {
            facts.hostname = parse::parse_structured_hostname(&value);
        }
        Ok(facts)
    }

    pub async fn stack_members(&mut self) -> Result<Vec<u32>, TransportError> {
        self.read(
            "stack members",
            Some((parse::STACK_PATH, &parse::parse_structured_stack)),
            "show switch",
            parse::parse_switch_members,
        )
        .await
    }

    pub async fn filesystem_usage(
        &mut self,
        filesystem: &str,
    ) -> Result<FilesystemUsage, TransportError> {
        let fs = filesystem.to_string();
        let from_structured = move |value: &Value| parse::parse_structured_filesystem(value, &fs);
        self.read(
            &format!("{} usage", filesystem),
            Some((parse::FILESYSTEM_PATH, &from_structured)),
            &format!("dir {}", filesystem),
            parse::parse_dir_usage,
        )
        .await
    }

    pub async fn boot_variable(&mut self, family: DeviceFamily) -> Result<String, TransportError> {
        let command = match family {
            DeviceFamily::Switch => "show boot",
            DeviceFamily::Router => "show bootvar",
        };
        self.read(
            "boot variable",
            Some((parse::BOOT_PATH, &parse::parse_structured_boot)),
            command,
            parse::parse_boot_variable,
        )
        .await
    }

    /// Switches keep the flag in a ROM variable; routers encode it in the
    /// configuration register.
    pub async fn boot_flags(&mut self, family: DeviceFamily) -> Result<BootFlags, TransportError> {
        match family {
            DeviceFamily::Switch => {
                self.read("boot flags", None, "show romvar", |output| {
                    parse::parse_romvar(output).map(|ignore| BootFlags {
                        ignore_startup_config: ignore,
                        config_register: None,
                    })
                })
                .await
            }
            DeviceFamily::Router => {
                self.read("configuration register", None, "show version", |output| {
                    let register = parse::parse_config_register(output)?;
                    let ignore = parse::config_register_ignores_startup(&register)?;
                    Some(BootFlags {
                        ignore_startup_config: ignore,
                        config_register: Some(register),
                    })
                })
                .await
            }
        }
    }

    pub async fn install_state(&mut self) -> Result<InstallState, TransportError> {
        let output = self.run_command("show install summary").await?;
        if parse::is_rejected(&output) {
            return Err(TransportError::protocol(
                &self.address,
                "device rejected 'show install summary'",
            ));
        }
        Ok(parse::parse_install_summary(&output))
    }

    pub async fn structured_channel_state(&mut self) -> Result<ChannelState, TransportError> {
        if self.structured_available() == Some(true) {
            return Ok(ChannelState::Enabled);
        }
        let feature = self.settings.structured_feature.clone();
        let output = self
            .run_command(&format!("show running-config | include {}", feature))
            .await?;
        Ok(if parse::parse_feature_enabled(&output, &feature) {
            ChannelState::Enabled
        } else {
            ChannelState::Disabled
        })
    }

    pub async fn file_exists(
        &mut self,
        filesystem: &str,
        filename: &str,
    ) -> Result<bool, TransportError> {
        let output = self
            .run_command(&format!("dir {}{}", filesystem, filename))
            .await?;
        Ok(parse::parse_file_listed(&output, filename))
    }

    pub async fn compute_md5(
        &mut self,
        filesystem: &str,
        filename: &str,
    ) -> Result<String, TransportError> {
        let command = format!("verify /md5 {}{}", filesystem, filename);
        let timeout = self.settings.copy_timeout;
        let output = self.exec_interactive(&command, &[], timeout, None).await?;
        parse::parse_md5(&output).ok_or_else(|| {
            TransportError::protocol(
                &self.address,
                format!("no MD5 digest in '{}' output", command),
            )
        })
    }

    pub async fn copy_from_url(
        &mut self,
        url: &str,
        filesystem: &str,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        let replies = [
            PromptReply::new("Destination filename", ""),
            PromptReply::new("Do you want to over write", ""),
            PromptReply::new("[confirm]", ""),
        ];
        let timeout = self.settings.copy_timeout;
        self.exec_interactive(&format!("copy {} {}", url, filesystem), &replies, timeout, sink)
            .await
    }

    pub async fn save_config(&mut self) -> Result<String, TransportError> {
        let timeout = self.settings.command_timeout;
        let output = self
            .exec_interactive("write memory", &[PromptReply::new("[confirm]", "")], timeout, None)
            .await?;
        if output.contains("[OK]") || !output.to_ascii_lowercase().contains("error") {
            Ok(output)
        } else {
            Err(TransportError::protocol(
                &self.address,
                format!("saving configuration failed: {}", output.trim()),
            ))
        }
    }

    /// Issue the add+activate+commit install. A timeout is returned as is and
    /// never retried: the device may already be acting on the command.
    pub async fn install_one_step(
        &mut self,
        filesystem: &str,
        filename: &str,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        let command = install_command(filesystem, filename);
        let timeout = self.settings.install_timeout;
        self.exec_interactive(&command, &[], timeout, sink).await
    }

    /// Turn the structured channel on or off, then save the configuration.
    pub async fn toggle_feature(&mut self, enable: bool) -> Result<ChannelState, TransportError> {
        let feature = self.settings.structured_feature.clone();
        let line = if enable {
            feature.clone()
        } else {
            format!("no {}", feature)
        };
        let timeout = self.settings.command_timeout;
        let channel = self.command_channel().await?;
        let result = channel.configure(&[line], timeout).await;
        let output = self.settle(result)?;
        if parse::is_rejected(&output) {
            return Err(TransportError::protocol(
                &self.address,
                format!("device rejected '{}' configuration", feature),
            ));
        }
        self.save_config().await?;
        // A later read must retry the channel we just changed.
        self.structured = StructuredState::Untried;
        Ok(if enable {
            ChannelState::Enabled
        } else {
            ChannelState::Disabled
        })
    }

    pub async fn close(&mut self) {
        if let Some(mut channel) = self.command.take() {
            channel.close().await;
        }
        self.structured = StructuredState::Untried;
    }
}

pub fn install_command(filesystem: &str, filename: &str) -> String {
    format!(
        "install add file {}{} activate commit prompt-level none",
        filesystem, filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::fake::{FakeConnector, FakeDevice};

    fn session(connector: &Arc<FakeConnector>, address: &str) -> DeviceSession {
        DeviceSession::new(address, connector.clone(), TransportSettings::default())
    }

    #[tokio::test]
    async fn falls_back_to_command_output_without_structured_channel() {
        let connector = Arc::new(FakeConnector::new());
        connector.add(FakeDevice::switch("10.0.0.1", "C9300-48P", "16.12.05", &[4096]));
        let mut s = session(&connector, "10.0.0.1");

        let facts = s.system_facts().await.expect("facts");
        assert_eq!(facts.model, "C9300-48P");
        assert_eq!(facts.version, "16.12.05");
        assert_eq!(s.structured_available(), Some(false));
        let device = connector.device("10.0.0.1");
        assert!(device.commands_run().contains(&"show version".to_string()));
    }

    #[tokio::test]
    async fn structured_channel_is_preferred_and_opened_once() {
        let connector = Arc::new(FakeConnector::new());
        let mut device = FakeDevice::switch("10.0.0.2", "C9300-48P", "16.12.05", &[4096]);
        device.enable_structured();
        connector.add(device);
        let mut s = session(&connector, "10.0.0.2");
        assert_eq!(s.address(), "10.0.0.2");

        let facts = s.system_facts().await.expect("facts");
        assert_eq!(facts.version, "16.12.05");
        assert_eq!(facts.hostname.as_deref(), Some("fake-10-0-0-2"));
        let _ = s.boot_variable(DeviceFamily::Switch).await.expect("boot");
        assert_eq!(connector.structured_opens("10.0.0.2"), 1);
        assert!(!connector
            .device("10.0.0.2")
            .commands_run()
            .contains(&"show version".to_string()));
    }

    #[tokio::test]
    async fn raw_structured_query_without_channel_is_unavailable() {
        let connector = Arc::new(FakeConnector::new());
        connector.add(FakeDevice::router("10.0.0.3", "ISR4331/K9", "17.03.04a", 8192));
        let mut s = session(&connector, "10.0.0.3");
        let err = s.query_structured(parse::HARDWARE_PATH).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelUnavailable { .. }));
    }

    #[tokio::test]
    async fn connection_failure_is_retried_once() {
        let connector = Arc::new(FakeConnector::new());
        let device = FakeDevice::router("10.0.0.4", "ISR4331/K9", "17.03.04a", 8192);
        device.fail_next_connects(1);
        connector.add(device);
        let mut s = session(&connector, "10.0.0.4");
        assert!(s.run_command("show version").await.is_ok());

        let connector = Arc::new(FakeConnector::new());
        let device = FakeDevice::router("10.0.0.5", "ISR4331/K9", "17.03.04a", 8192);
        device.fail_next_connects(2);
        connector.add(device);
        let mut s = session(&connector, "10.0.0.5");
        let err = s.run_command("show version").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_and_not_retried() {
        let connector = Arc::new(FakeConnector::new());
        let mut device = FakeDevice::router("10.0.0.6", "ISR4331/K9", "17.03.04a", 8192);
        device.reject_auth();
        connector.add(device);
        let mut s = session(&connector, "10.0.0.6");

        let err = s.system_facts().await.unwrap_err();
        assert!(err.is_auth());
        let err = s.run_command("show version").await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(connector.command_opens("10.0.0.6"), 0);
    }

    #[tokio::test]
    async fn command_timeout_is_not_retried() {
        let connector = Arc::new(FakeConnector::new());
        let mut device = FakeDevice::router("10.0.0.7", "ISR4331/K9", "17.03.04a", 8192);
        device.time_out_on("show install summary");
        connector.add(device);
        let mut s = session(&connector, "10.0.0.7");
        let err = s.install_state().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        let runs = connector
            .device("10.0.0.7")
            .commands_run()
            .iter()
            .filter(|c| c.as_str() == "show install summary")
            .count();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn router_boot_flags_come_from_config_register() {
        let connector = Arc::new(FakeConnector::new());
        let mut device = FakeDevice::router("10.0.0.8", "ISR4331/K9", "17.03.04a", 8192);
        device.set_config_register("0x2142");
        connector.add(device);
        let mut s = session(&connector, "10.0.0.8");
        let flags = s.boot_flags(DeviceFamily::Router).await.expect("flags");
        assert!(flags.ignore_startup_config);
        assert_eq!(flags.config_register.as_deref(), Some("0x2142"));
    }

    #[tokio::test]
    async fn toggle_feature_configures_and_saves() {
        let connector = Arc::new(FakeConnector::new());
        connector.add(FakeDevice::switch("10.0.0.9", "C9300-48P", "17.03.04", &[4096]));
        let mut s = session(&connector, "10.0.0.9");
        let state = s.toggle_feature(true).await.expect("toggle");
        assert_eq!(state, ChannelState::Enabled);
        let device = connector.device("10.0.0.9");
        let run = device.commands_run();
        assert!(run.contains(&"conf: restconf".to_string()));
        assert!(run.contains(&"write memory".to_string()));
    }
}
