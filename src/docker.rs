//! Container runtime access: metadata queries and the event watcher.
//!
//! The watcher is the queue's main producer. It consumes the runtime's
//! container event stream, translates lifecycle actions into [`Event`]s and
//! reconnects on its own with capped exponential backoff. It never touches
//! the container map.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::event::{Event, EventSender};
use crate::metrics::{self, ReconnectReason};

/// The container metadata the daemon needs to derive records.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Runtime-assigned container id.
    pub id: String,
    /// Container name, without the runtime's leading slash.
    pub name: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// IPv4 addresses across the container's networks.
    pub ipv4_addresses: Vec<Ipv4Addr>,
    /// IPv6 addresses across the container's networks.
    pub ipv6_addresses: Vec<Ipv6Addr>,
}

/// Queries against the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch one container's metadata; `None` when the runtime no longer
    /// knows the id.
    async fn get(&self, id: &str) -> Result<Option<ContainerSummary>, Error>;

    /// List the ids of all containers the runtime knows about.
    async fn list(&self) -> Result<Vec<String>, Error>;
}

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerClient {
    base_url: String,
    http: reqwest::Client,
}

impl DockerClient {
    /// Connect to the given endpoint (`tcp://` or `http(s)://`).
    pub fn new(docker_host: &str) -> Result<Self, Error> {
        let base_url = match docker_host.split_once("://") {
            Some(("tcp", rest)) => format!("http://{rest}"),
            Some(("http", _)) | Some(("https", _)) => docker_host.to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "unsupported docker_host {docker_host:?}; use tcp:// or http(s)://"
                )))
            }
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn get(&self, id: &str) -> Result<Option<ContainerSummary>, Error> {
        let response = self
            .http
            .get(self.url(&format!("/containers/{id}/json")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let inspect: InspectResponse = response.error_for_status()?.json().await?;
        Ok(Some(inspect.into_summary()))
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        let listed: Vec<ListedContainer> = self
            .http
            .get(self.url("/containers/json"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(listed.into_iter().map(|c| c.id).collect())
    }
}

// The inspect endpoint's schema differs from the list endpoint's; only the
// fields we consume are modelled.

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "GlobalIPv6Address", default)]
    global_ipv6_address: String,
}

#[derive(Debug, Deserialize)]
struct ListedContainer {
    #[serde(rename = "Id")]
    id: String,
}

impl InspectResponse {
    fn into_summary(self) -> ContainerSummary {
        let mut ipv4_addresses = Vec::new();
        let mut ipv6_addresses = Vec::new();
        for endpoint in self.network_settings.networks.values() {
            if let Ok(ip) = endpoint.ip_address.parse::<Ipv4Addr>() {
                ipv4_addresses.push(ip);
            }
            if let Ok(ip) = endpoint.global_ipv6_address.parse::<Ipv6Addr>() {
                ipv6_addresses.push(ip);
            }
        }
        ipv4_addresses.sort_unstable();
        ipv6_addresses.sort_unstable();

        ContainerSummary {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            labels: self.config.labels,
            ipv4_addresses,
            ipv6_addresses,
        }
    }
}

/// One message on the runtime's event stream.
#[derive(Debug, Deserialize)]
struct RuntimeEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: RuntimeActor,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Translate a runtime event into a queue event. Actions we do not care
/// about map to `None`.
fn translate(event: &RuntimeEvent) -> Option<Event> {
    if event.kind != "container" {
        return None;
    }
    let id = event.actor.id.clone();
    match event.action.as_str() {
        "start" => Some(Event::Started { id }),
        "kill" => {
            // A polite signal is a stop intent; anything else is not.
            let signal = event
                .actor
                .attributes
                .get("signal")
                .map(String::as_str)
                .unwrap_or("");
            if matches!(signal, "SIGTERM" | "SIGINT" | "TERM" | "INT" | "15" | "2") {
                Some(Event::Stopped { id })
            } else {
                None
            }
        }
        "die" => {
            let exit_code = event
                .actor
                .attributes
                .get("exitCode")
                .and_then(|c| c.parse::<i64>().ok())
                .unwrap_or(-1);
            Some(Event::Died { id, exit_code })
        }
        "destroy" => Some(Event::Removed { id }),
        _ => None,
    }
}

/// Watches the runtime event stream and produces into the queue.
pub struct DockerWatcher {
    client: DockerClient,
    events: EventSender,
}

impl DockerWatcher {
    pub fn new(client: DockerClient, events: EventSender) -> Self {
        Self { client, events }
    }

    /// Run until the shutdown token fires. Reconnects on stream errors with
    /// capped exponential backoff.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff_secs = 1u64;
        const MAX_BACKOFF: u64 = 30;
        let mut first_connect = true;

        loop {
            if shutdown.is_cancelled() {
                info!("watcher shutting down");
                return;
            }

            info!("connecting to container event stream");
            let url = format!(
                "{}?filters=%7B%22type%22%3A%5B%22container%22%5D%7D",
                self.client.url("/events")
            );

            let response = match self.client.http.get(&url).send().await {
                Ok(r) if r.status().is_success() => {
                    backoff_secs = 1;
                    metrics::record_watcher_reconnect(if first_connect {
                        ReconnectReason::InitialConnect
                    } else {
                        ReconnectReason::Error
                    });
                    first_connect = false;
                    r
                }
                Ok(r) => {
                    warn!(status = %r.status(), "event stream rejected; backing off");
                    metrics::record_watcher_reconnect(ReconnectReason::Error);
                    sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to connect event stream; backing off");
                    metrics::record_watcher_reconnect(ReconnectReason::Error);
                    sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("watcher received shutdown signal");
                        return;
                    }

                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                buffer.extend_from_slice(&bytes);
                                if !self.drain_lines(&mut buffer).await {
                                    // Queue consumer is gone; nothing left to do.
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream error; reconnecting");
                                metrics::record_watcher_reconnect(ReconnectReason::Error);
                                break;
                            }
                            None => {
                                info!("event stream ended; reconnecting");
                                metrics::record_watcher_reconnect(ReconnectReason::StreamEnded);
                                break;
                            }
                        }
                    }
                }
            }

            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Parse and forward every complete ndjson line in the buffer. Returns
    /// false when the queue has closed.
    async fn drain_lines(&self, buffer: &mut Vec<u8>) -> bool {
        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let runtime_event: RuntimeEvent = match serde_json::from_str(line) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(error = %e, "unparseable runtime event; skipping");
                    continue;
                }
            };

            if let Some(event) = translate(&runtime_event) {
                debug!(?event, "runtime event");
                if self.events.send(event).await.is_err() {
                    return false;
                }
            } else {
                trace!(action = %runtime_event.action, "ignored runtime event");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: &str, attributes: &[(&str, &str)]) -> RuntimeEvent {
        RuntimeEvent {
            kind: "container".to_string(),
            action: action.to_string(),
            actor: RuntimeActor {
                id: "abc123".to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    #[test]
    fn test_translate_lifecycle_actions() {
        assert_eq!(
            translate(&event("start", &[])),
            Some(Event::Started {
                id: "abc123".into()
            })
        );
        assert_eq!(
            translate(&event("kill", &[("signal", "SIGTERM")])),
            Some(Event::Stopped {
                id: "abc123".into()
            })
        );
        assert_eq!(
            translate(&event("die", &[("exitCode", "137")])),
            Some(Event::Died {
                id: "abc123".into(),
                exit_code: 137
            })
        );
        assert_eq!(
            translate(&event("destroy", &[])),
            Some(Event::Removed {
                id: "abc123".into()
            })
        );
    }

    #[test]
    fn test_translate_ignores_noise() {
        assert_eq!(translate(&event("exec_create", &[])), None);
        assert_eq!(translate(&event("kill", &[("signal", "SIGKILL")])), None);

        let mut network_event = event("start", &[]);
        network_event.kind = "network".to_string();
        assert_eq!(translate(&network_event), None);
    }

    #[test]
    fn test_translate_die_without_exit_code() {
        assert_eq!(
            translate(&event("die", &[])),
            Some(Event::Died {
                id: "abc123".into(),
                exit_code: -1
            })
        );
    }

    #[test]
    fn test_inspect_into_summary() {
        let raw = r#"{
            "Id": "abc123",
            "Name": "/c1",
            "Config": {"Labels": {"ddnssd.http.port": "80"}},
            "NetworkSettings": {"Networks": {
                "bridge": {"IPAddress": "10.0.0.1", "GlobalIPv6Address": "fd00::1"},
                "other": {"IPAddress": "", "GlobalIPv6Address": ""}
            }}
        }"#;
        let inspect: InspectResponse = serde_json::from_str(raw).unwrap();
        let summary = inspect.into_summary();

        assert_eq!(summary.name, "c1");
        assert_eq!(summary.ipv4_addresses, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(summary.ipv6_addresses, vec!["fd00::1".parse::<Ipv6Addr>().unwrap()]);
        assert_eq!(summary.labels.len(), 1);
    }

    #[test]
    fn test_docker_client_rejects_unix_socket() {
        assert!(DockerClient::new("unix:///var/run/docker.sock").is_err());
        assert!(DockerClient::new("tcp://127.0.0.1:2375").is_ok());
    }
}
