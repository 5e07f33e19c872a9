//! The controller HTTP client (§4.D). Async, because the watch stream in
//! `list_devices_watch` needs to observe a chunked response body incrementally
//! rather than waiting for it to complete.

use fabric_shared::{AgentError, Device};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub cidr_v4: ipnet::IpNet,
    pub cidr_v6: Option<ipnet::IpNet>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecurityGroup {
    pub id: String,
    pub revision: u64,
    pub inbound_rules: Vec<SecurityRule>,
    pub outbound_rules: Vec<SecurityRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecurityRule {
    pub ip_protocol: String,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub ip_ranges: Vec<ipnet::IpNet>,
}

/// A decoded element of the organization device watch stream.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Change(Device),
    Delete(String),
    /// The initial snapshot has been fully delivered.
    Bookmark,
    Close,
    Error(String),
}

#[derive(Deserialize)]
struct DeviceRef {
    public_key: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Change { value: Device },
    Delete { value: DeviceRef },
    Bookmark,
    Close,
    Error { value: String },
}

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: url::Url,
    token: String,
}

impl ControllerClient {
    pub fn new(base_url: url::Url, token: String, insecure_skip_tls_verify: bool) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_tls_verify)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder should not fail with these options");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn set_token(&mut self, token: String) {
        self.token = token;
    }

    pub async fn get_user_me(&self) -> Result<User, AgentError> {
        self.get_retrying("/api/users/me").await
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>, AgentError> {
        self.get_retrying("/api/organizations").await
    }

    pub async fn create_device(&self, body: &Device) -> Result<Device, AgentError> {
        self.send_json("POST", "/api/devices", body).await
    }

    pub async fn update_device(&self, id: &str, body: &Device) -> Result<Device, AgentError> {
        self.send_json("PATCH", &format!("/api/devices/{id}"), body)
            .await
    }

    pub async fn list_devices_in_organization(
        &self,
        org: &str,
        gt_revision: u64,
    ) -> Result<Vec<Device>, AgentError> {
        let path = format!("/api/organizations/{org}/devices?gt_revision={gt_revision}");
        self.get_retrying(&path).await
    }

    pub async fn get_security_group(
        &self,
        org: &str,
        id: &str,
    ) -> Result<Option<SecurityGroup>, AgentError> {
        let url = self.url(&format!("/api/organizations/{org}/security_groups/{id}"));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(reqwest_to_agent_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_auth(response)?;
        let group = response
            .json::<SecurityGroup>()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        Ok(Some(group))
    }

    /// Opens the long-poll watch stream for an organization's devices
    /// starting after `gt_revision`, and spawns a task that decodes the
    /// chunked JSON body into `WatchEvent`s delivered over the returned
    /// channel. The channel closes when the stream ends or errors.
    pub async fn list_devices_watch(
        &self,
        org: &str,
        gt_revision: u64,
    ) -> Result<mpsc::Receiver<WatchEvent>, AgentError> {
        let path = format!("/api/organizations/{org}/devices?watch=true&gt_revision={gt_revision}");
        let url = self.url(&path);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(reqwest_to_agent_error)?;
        let response = check_auth(response)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(WatchEvent::Error(e.to_string())).await;
                        break;
                    },
                };
                buf.extend_from_slice(&chunk);
                loop {
                    let mut de = serde_json::Deserializer::from_slice(&buf).into_iter::<WireEvent>();
                    match de.next() {
                        Some(Ok(event)) => {
                            let consumed = de.byte_offset();
                            buf.drain(..consumed);
                            let mapped = match event {
                                WireEvent::Change { value } => WatchEvent::Change(value),
                                WireEvent::Delete { value } => WatchEvent::Delete(value.public_key),
                                WireEvent::Bookmark => WatchEvent::Bookmark,
                                WireEvent::Close => WatchEvent::Close,
                                WireEvent::Error { value } => WatchEvent::Error(value),
                            };
                            let is_close = matches!(mapped, WatchEvent::Close);
                            if tx.send(mapped).await.is_err() || is_close {
                                return;
                            }
                        },
                        // Incomplete trailing object: wait for more bytes.
                        Some(Err(e)) if e.is_eof() => break,
                        Some(Err(e)) => {
                            let _ = tx.send(WatchEvent::Error(e.to_string())).await;
                            return;
                        },
                        None => break,
                    }
                }
            }
        });

        Ok(rx)
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url
            .join(path)
            .expect("path must be a valid relative URL")
    }

    async fn get_retrying<T: DeserializeOwned>(&self, path: &str) -> Result<T, AgentError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.get(path).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                    log::debug!("retrying {path} after transient error: {e} (attempt {attempt})");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AgentError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(reqwest_to_agent_error)?;
        let response = check_auth(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, AgentError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let response = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(reqwest_to_agent_error)?;
        let response = check_auth(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))
    }
}

fn check_auth(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AgentError::AuthExpired);
    }
    if response.status().is_server_error() {
        return Err(AgentError::TransientNetwork(format!(
            "controller returned {}",
            response.status()
        )));
    }
    Ok(response)
}

fn reqwest_to_agent_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() || e.is_connect() {
        AgentError::TransientNetwork(e.to_string())
    } else {
        AgentError::Config(e.to_string())
    }
}
