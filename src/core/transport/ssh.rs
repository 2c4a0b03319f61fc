use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::{ChannelStream, Disconnect, client};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::{Credentials, TransportError, TransportSettings};

/// Host key policy for one connection.
pub(super) struct HostKeys {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for HostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        let Some(path) = &self.known_hosts else {
            debug!("Accepting host key {} of {}", fingerprint, self.host);
            return Ok(true);
        };
        match russh::keys::check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(
                    "Host key {} of {} is not in {}",
                    fingerprint,
                    self.host,
                    path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!("Host key {} of {} rejected: {}", fingerprint, self.host, e);
                Ok(false)
            }
        }
    }
}

/// Interactive shell channel of an authenticated SSH connection.
pub(super) struct SshLink {
    handle: client::Handle<HostKeys>,
    pub stream: ChannelStream<client::Msg>,
}

impl SshLink {
    /// Connect, authenticate with the device password and open a shell on a
    /// pseudo-terminal. The enable step is left to the caller.
    pub async fn open(
        address: &str,
        credentials: &Credentials,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let handler = HostKeys {
            host: address.to_string(),
            port: settings.command_port,
            known_hosts: settings.known_hosts.clone(),
        };
        let config = Arc::new(client::Config::default());
        let started = Instant::now();
        let connecting = client::connect(config, (address, settings.command_port), handler);
        let mut handle = tokio::time::timeout(settings.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::timeout(address, "connect", started.elapsed()))?
            .map_err(|e| TransportError::connect(address, e.to_string()))?;

        let auth = handle
            .authenticate_password(credentials.username.clone(), credentials.password.clone())
            .await
            .map_err(|e| TransportError::connect(address, e.to_string()))?;
        if !auth.success() {
            return Err(TransportError::Auth {
                address: address.to_string(),
            });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::connect(address, e.to_string()))?;
        channel
            .request_pty(false, "vt100", 200, 24, 0, 0, &[])
            .await
            .map_err(|e| TransportError::connect(address, e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::connect(address, e.to_string()))?;

        Ok(Self {
            handle,
            stream: channel.into_stream(),
        })
    }

    pub async fn disconnect(&mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
