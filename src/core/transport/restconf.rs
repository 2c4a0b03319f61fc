use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::time::Instant;

use super::{Credentials, StructuredChannel, TransportError, TransportSettings};

const YANG_JSON: &str = "application/yang-data+json";
const REACHABILITY_PATH: &str = "Cisco-IOS-XE-native:native/version";

/// RESTCONF client for one device.
pub struct RestconfChannel {
    address: String,
    base_url: String,
    client: reqwest::Client,
    username: String,
    password: String,
}

pub(super) fn host_for_url(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}

impl RestconfChannel {
    /// Build a client and read one small path. That read doubles as the
    /// credential check, so a rejected login surfaces here.
    pub async fn connect(
        address: &str,
        credentials: &Credentials,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.command_timeout)
            .build()
            .map_err(|e| TransportError::unavailable(address, e.to_string()))?;
        let channel = Self {
            address: address.to_string(),
            base_url: format!(
                "https://{}:{}/restconf/data",
                host_for_url(address),
                settings.structured_port
            ),
            client,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
        channel.get(REACHABILITY_PATH).await?;
        Ok(channel)
    }

    fn classify(&self, err: reqwest::Error, path: &str, started: Instant) -> TransportError {
        if err.is_timeout() {
            TransportError::timeout(&self.address, format!("GET {}", path), started.elapsed())
        } else if err.is_connect() {
            TransportError::connect(&self.address, err.to_string())
        } else {
            TransportError::unavailable(&self.address, err.to_string())
        }
    }
}

#[async_trait]
impl StructuredChannel for RestconfChannel {
    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        let url = format!("{}/{}", self.base_url, path);
        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, YANG_JSON)
            .send()
            .await
            .map_err(|e| self.classify(e, path, started))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Auth {
                address: self.address.clone(),
            }),
            StatusCode::NO_CONTENT => Ok(Value::Null),
            StatusCode::NOT_FOUND => Err(TransportError::protocol(
                &self.address,
                format!("no data at {}", path),
            )),
            status if status.is_success() => response
                .json::<Value>()
                .await
                .map_err(|e| TransportError::protocol(&self.address, e.to_string())),
            status => Err(TransportError::unavailable(
                &self.address,
                format!("GET {} returned {}", path, status),
            )),
        }
    }
}
