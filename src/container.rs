//! Tracked containers and the records they want published.
//!
//! Containers opt in to service discovery through `ddnssd.<service>.*`
//! labels. Record derivation happens once, at construction, against a
//! [`HostContext`]; the derived list stays stable for the container's
//! lifetime so that suppression always withdraws exactly what was published.

use std::collections::BTreeMap;

use hickory_proto::rr::Name;
use tracing::{debug, warn};

use crate::backend::{enumeration_name, DnsBackend};
use crate::config::HostContext;
use crate::docker::ContainerSummary;
use crate::error::BackendError;
use crate::record::{DnsRecord, RecordData};

/// Label namespace containers use to declare services.
pub const LABEL_PREFIX: &str = "ddnssd.";

/// A container the daemon tracks, with its lifecycle flags and the DNS
/// records derived from its metadata.
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    name: String,
    /// A stop was requested before the death event arrived.
    pub stopped: bool,
    /// The container died uncleanly; records stay published until it is
    /// restarted or removed.
    pub crashed: bool,
    records: Vec<DnsRecord>,
}

impl Container {
    /// Build a container from runtime metadata, deriving its record set.
    pub fn new(summary: &ContainerSummary, host: &HostContext) -> Self {
        let records = derive_records(summary, host);
        Self {
            id: summary.id.clone(),
            name: summary.name.clone(),
            stopped: false,
            crashed: false,
            records,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The records this container wants present, in derivation order.
    pub fn records(&self) -> &[DnsRecord] {
        &self.records
    }

    /// Publish every derived record to the backend. Per-record failures are
    /// logged and the iteration continues; only `Fatal` propagates.
    pub async fn publish_records(&self, backend: &mut dyn DnsBackend) -> Result<(), BackendError> {
        for rr in &self.records {
            if let Err(e) = backend.publish_record(rr).await {
                crate::metrics::record_backend_op(backend.name(), "publish", e.kind());
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(backend = backend.name(), record = %rr, error = %e, "publish failed");
            } else {
                crate::metrics::record_backend_op(backend.name(), "publish", "ok");
            }
        }
        Ok(())
    }

    /// Withdraw every derived record from the backend. Same failure policy
    /// as [`publish_records`](Self::publish_records).
    pub async fn suppress_records(&self, backend: &mut dyn DnsBackend) -> Result<(), BackendError> {
        for rr in &self.records {
            if let Err(e) = backend.suppress_record(rr).await {
                crate::metrics::record_backend_op(backend.name(), "suppress", e.kind());
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(backend = backend.name(), record = %rr, error = %e, "suppress failed");
            } else {
                crate::metrics::record_backend_op(backend.name(), "suppress", "ok");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ServiceLabels {
    port: Option<u16>,
    protocol: Option<String>,
    instance: Option<String>,
    priority: u16,
    weight: u16,
    tags: Vec<String>,
    cname: Option<String>,
}

/// Derive the full DNS-SD record set for a container.
///
/// Containers without `ddnssd.` labels derive nothing. A malformed service
/// declaration is logged and skipped; it never takes the container's other
/// services down with it.
fn derive_records(summary: &ContainerSummary, host: &HostContext) -> Vec<DnsRecord> {
    let services = collect_services(summary);
    if services.is_empty() {
        return Vec::new();
    }

    let container_fqdn = match container_fqdn(&summary.name, host) {
        Ok(name) => name,
        Err(e) => {
            warn!(
                container_id = %summary.id,
                container_name = %summary.name,
                error = %e,
                "container name does not form a valid DNS name; skipping"
            );
            return Vec::new();
        }
    };

    let ttl = host.record_ttl;
    let mut records = Vec::new();

    // Address records for the container itself; SRV targets point here.
    for ip in &summary.ipv4_addresses {
        records.push(DnsRecord::new(
            container_fqdn.clone(),
            ttl,
            RecordData::A(*ip),
        ));
    }
    for ip in &summary.ipv6_addresses {
        records.push(DnsRecord::new(
            container_fqdn.clone(),
            ttl,
            RecordData::Aaaa(*ip),
        ));
    }

    for (svc, labels) in services {
        match derive_service(summary, host, &container_fqdn, &svc, &labels) {
            Ok(mut service_records) => records.append(&mut service_records),
            Err(e) => {
                warn!(
                    container_id = %summary.id,
                    service = %svc,
                    error = %e,
                    "invalid service declaration; skipping"
                );
            }
        }
    }

    debug!(
        container_id = %summary.id,
        records = records.len(),
        "derived container records"
    );
    records
}

fn derive_service(
    summary: &ContainerSummary,
    host: &HostContext,
    container_fqdn: &Name,
    svc: &str,
    labels: &ServiceLabels,
) -> Result<Vec<DnsRecord>, crate::error::Error> {
    use crate::error::Error;

    let port = labels
        .port
        .ok_or_else(|| Error::InvalidRecord(format!("service {svc} has no port label")))?;
    let protocol = labels.protocol.as_deref().unwrap_or("tcp");
    if protocol != "tcp" && protocol != "udp" {
        return Err(Error::InvalidRecord(format!(
            "service {svc} protocol must be tcp or udp, got {protocol:?}"
        )));
    }

    let service_name = Name::from_ascii(format!("_{svc}._{protocol}"))
        .map_err(|e| Error::InvalidRecord(format!("service name: {e}")))?
        .append_domain(&host.base_domain)?;

    let instance_label = labels
        .instance
        .as_deref()
        .unwrap_or(&summary.name)
        .to_lowercase();
    let instance_name = Name::from_ascii(&instance_label)
        .map_err(|e| Error::InvalidRecord(format!("instance name: {e}")))?
        .append_domain(&service_name)?;

    let ttl = host.record_ttl;
    let mut records = vec![
        DnsRecord::new(
            instance_name.clone(),
            ttl,
            RecordData::Srv {
                priority: labels.priority,
                weight: labels.weight,
                port,
                target: container_fqdn.clone(),
            },
        ),
        // Browsing clients expect a TXT at the instance name even when the
        // container declared no attributes.
        DnsRecord::new(
            instance_name.clone(),
            ttl,
            RecordData::Txt(if labels.tags.is_empty() {
                vec![String::new()]
            } else {
                labels.tags.clone()
            }),
        ),
        DnsRecord::new(
            service_name.clone(),
            ttl,
            RecordData::Ptr {
                target: instance_name,
            },
        ),
        DnsRecord::new(
            enumeration_name(&host.base_domain),
            ttl,
            RecordData::Ptr {
                target: service_name,
            },
        ),
    ];

    if let Some(alias) = &labels.cname {
        let alias_name = Name::from_ascii(alias)
            .map_err(|e| Error::InvalidRecord(format!("cname alias: {e}")))?
            .append_domain(&host.base_domain)?;
        records.push(DnsRecord::new(
            alias_name,
            ttl,
            RecordData::Cname {
                target: container_fqdn.clone(),
            },
        ));
    }

    Ok(records)
}

/// Group `ddnssd.<svc>.<key>` labels by service name, in label order.
fn collect_services(summary: &ContainerSummary) -> BTreeMap<String, ServiceLabels> {
    let mut services: BTreeMap<String, ServiceLabels> = BTreeMap::new();

    for (key, value) in &summary.labels {
        let Some(rest) = key.strip_prefix(LABEL_PREFIX) else {
            continue;
        };
        let Some((svc, field)) = rest.split_once('.') else {
            warn!(container_id = %summary.id, label = %key, "malformed ddnssd label");
            continue;
        };

        let entry = services.entry(svc.to_lowercase()).or_default();
        match field {
            "port" => match value.parse::<u16>() {
                Ok(port) => entry.port = Some(port),
                Err(_) => {
                    warn!(container_id = %summary.id, label = %key, value = %value, "port is not a u16")
                }
            },
            "protocol" => entry.protocol = Some(value.to_lowercase()),
            "instance" => entry.instance = Some(value.clone()),
            "priority" => match value.parse::<u16>() {
                Ok(v) => entry.priority = v,
                Err(_) => {
                    warn!(container_id = %summary.id, label = %key, value = %value, "priority is not a u16")
                }
            },
            "weight" => match value.parse::<u16>() {
                Ok(v) => entry.weight = v,
                Err(_) => {
                    warn!(container_id = %summary.id, label = %key, value = %value, "weight is not a u16")
                }
            },
            "tags" => {
                entry.tags = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect();
            }
            "cname" => entry.cname = Some(value.to_lowercase()),
            other => {
                warn!(container_id = %summary.id, label = %key, field = %other, "unknown ddnssd label field")
            }
        }
    }

    services
}

fn container_fqdn(name: &str, host: &HostContext) -> Result<Name, crate::error::Error> {
    Ok(Name::from_ascii(name.to_lowercase())?.append_domain(&host.hostname)?)
}
