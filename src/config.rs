//! Configuration types for ddnssd.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::record::{DnsRecord, RecordData};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration.
    pub daemon: DaemonConfig,

    /// Ordered, non-empty list of DNS backends to publish to.
    pub backends: Vec<BackendConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// DNS zone all published records live under (e.g. "prod.example.com").
    pub base_domain: String,

    /// This host's name. Relative names are qualified with `base_domain`;
    /// the resulting FQDN is the ownership suffix for A/AAAA/SRV records.
    pub hostname: String,

    /// Container runtime endpoint (e.g. "tcp://127.0.0.1:2375").
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// TTL for published records in seconds.
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Optional IPv4 address to publish for the host itself.
    #[serde(default)]
    pub host_ipv4: Option<Ipv4Addr>,

    /// Optional IPv6 address to publish for the host itself.
    #[serde(default)]
    pub host_ipv6: Option<Ipv6Addr>,

    /// Interval between full reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Withdraw all our records (and the shared discovery records we
    /// created) on graceful shutdown.
    #[serde(default)]
    pub suppress_on_shutdown: bool,

    /// Depth of the bounded event queue.
    #[serde(default = "default_queue_depth")]
    pub event_queue_depth: usize,
}

/// Per-backend configuration, tagged by backend kind. The tag doubles as the
/// registry key selecting the constructor at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Change-batch HTTP API backend.
    Api(ApiBackendConfig),
    /// Relational (PowerDNS-schema) SQL backend.
    Sql(SqlBackendConfig),
}

/// Change-batch HTTP API backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiBackendConfig {
    /// API base URL (e.g. "http://127.0.0.1:8081/api/v1/servers/localhost").
    pub endpoint: String,

    /// API key sent in the `X-API-Key` header.
    pub api_key: String,

    /// Zone id; defaults to the base domain.
    #[serde(default)]
    pub zone: Option<String>,

    /// Retry budget per operation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// SQL backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlBackendConfig {
    /// Database path; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "ddnssd=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics over HTTP.
    #[serde(default)]
    pub enable_metrics: bool,

    /// Metrics listen address.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: false,
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    "0.0.0.0:9218".parse().expect("valid metrics address")
}

fn default_docker_host() -> String {
    "tcp://127.0.0.1:2375".to_string()
}

fn default_record_ttl() -> u32 {
    60
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_queue_depth() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    5
}

/// The narrow host-identity capability handed to record derivation and the
/// reconciler. Built once from [`DaemonConfig`].
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Zone suffix for all published names.
    pub base_domain: Name,
    /// This host's FQDN; ownership suffix for A/AAAA/SRV.
    pub hostname: Name,
    /// Default TTL for derived records.
    pub record_ttl: u32,
}

impl DaemonConfig {
    /// Validate the host identity options and build a [`HostContext`].
    pub fn host_context(&self) -> Result<HostContext, Error> {
        let base_domain = parse_fqdn(&self.base_domain)
            .map_err(|e| Error::Config(format!("base_domain: {e}")))?;
        let hostname = Name::from_ascii(&self.hostname)
            .map_err(|e| Error::Config(format!("hostname: {e}")))?
            .to_lowercase();

        let hostname = if base_domain.zone_of(&hostname) {
            let mut name = hostname;
            name.set_fqdn(true);
            name
        } else {
            hostname
                .append_domain(&base_domain)
                .map_err(|e| Error::Config(format!("hostname: {e}")))?
        };

        Ok(HostContext {
            base_domain,
            hostname,
            record_ttl: self.record_ttl,
        })
    }

    /// Optional records for the host itself, always part of the desired set.
    pub fn host_records(&self, host: &HostContext) -> Vec<DnsRecord> {
        let mut records = Vec::new();
        if let Some(ipv4) = self.host_ipv4 {
            records.push(DnsRecord::new(
                host.hostname.clone(),
                host.record_ttl,
                RecordData::A(ipv4),
            ));
        }
        if let Some(ipv6) = self.host_ipv6 {
            records.push(DnsRecord::new(
                host.hostname.clone(),
                host.record_ttl,
                RecordData::Aaaa(ipv6),
            ));
        }
        records
    }
}

fn parse_fqdn(s: &str) -> Result<Name, hickory_proto::ProtoError> {
    let mut name = Name::from_ascii(s)?.to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}
