//! Change-batch HTTP API backend.
//!
//! Speaks a PowerDNS-server-style zone API: `GET <endpoint>/zones/<zone>`
//! returns every rrset, `PATCH` accepts a batch of rrset changes, each
//! tagged `REPLACE` or `DELETE`. The API forbids two changes to the same
//! `(name, type)` in one batch, so every publish/suppress is folded into
//! exactly one change carrying the rrset's complete target state.
//!
//! The authoritative view is cached per `(name, type)` and refreshed
//! lazily. A `CONFLICT` answer (another writer moved the rrset) refetches
//! the zone, recomputes the target set, and retries; transient failures
//! back off exponentially with jitter. Both budgets are bounded by
//! `max_attempts`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::{Name, RecordType};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::backend::{enumeration_name, is_discovery_name, parent_service_name, DnsBackend};
use crate::config::ApiBackendConfig;
use crate::error::{BackendError, Error};
use crate::record::{parse_rtype, DnsRecord};

const BACKEND_NAME: &str = "api";

type RrKey = (Name, RecordType);

/// One rrset on the wire, both in zone listings and change batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RrSetChange {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    #[serde(default)]
    ttl: u32,
    #[serde(default)]
    records: Vec<RecordContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changetype: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordContent {
    content: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Serialize)]
struct ChangeBatch {
    rrsets: Vec<RrSetChange>,
}

#[derive(Debug, Deserialize)]
struct ZoneView {
    #[serde(default)]
    rrsets: Vec<RrSetChange>,
}

/// Change-batch API backend bound to one zone.
pub struct ApiBackend {
    http: reqwest::Client,
    zone_url: String,
    api_key: String,
    base_domain: Name,
    max_attempts: u32,
    cache: HashMap<RrKey, Vec<DnsRecord>>,
    zone_loaded: bool,
}

impl ApiBackend {
    pub fn new(config: &ApiBackendConfig, base_domain: &Name) -> Result<Self, Error> {
        let zone = config
            .zone
            .clone()
            .unwrap_or_else(|| trim_dot(&base_domain.to_string()));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            zone_url: format!("{}/zones/{}", config.endpoint.trim_end_matches('/'), zone),
            api_key: config.api_key.clone(),
            base_domain: base_domain.clone(),
            max_attempts: config.max_attempts.max(1),
            cache: HashMap::new(),
            zone_loaded: false,
        })
    }

    /// Fetch the whole zone and rebuild the rrset cache.
    async fn refresh_zone(&mut self) -> Result<(), BackendError> {
        let response = self
            .http
            .get(&self.zone_url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "zone fetch"));
        }

        let view: ZoneView = response.json().await?;

        self.cache.clear();
        for rrset in view.rrsets {
            let Ok(rtype) = parse_rtype(&rrset.rtype) else {
                continue;
            };
            let mut records = Vec::with_capacity(rrset.records.len());
            for content in &rrset.records {
                match DnsRecord::parse(&rrset.name, rrset.ttl, rtype, &content.content) {
                    Ok(rr) => records.push(rr),
                    Err(e) => {
                        warn!(name = %rrset.name, rtype = %rrset.rtype, error = %e, "unparseable rrset entry; skipping")
                    }
                }
            }
            if let Some(first) = records.first() {
                self.cache
                    .insert((first.name().clone(), rtype), records);
            }
        }
        self.zone_loaded = true;
        debug!(rrsets = self.cache.len(), "refreshed zone view");
        Ok(())
    }

    async fn cached_rrset(&mut self, key: &RrKey) -> Result<Vec<DnsRecord>, BackendError> {
        if !self.zone_loaded {
            self.refresh_zone().await?;
        }
        // A key absent from a loaded zone is an empty rrset.
        Ok(self.cache.get(key).cloned().unwrap_or_default())
    }

    /// PATCH one batch of rrset changes.
    async fn apply_batch(&self, batch: &ChangeBatch) -> Result<(), BackendError> {
        let response = self
            .http
            .patch(&self.zone_url)
            .header("X-API-Key", &self.api_key)
            .json(batch)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_status(status, "change batch"))
        }
    }

    /// Drive one rrset to the target state computed by `target_of`, with
    /// conflict and transient retries.
    async fn converge<F>(&mut self, rr: &DnsRecord, target_of: F) -> Result<(), BackendError>
    where
        F: Fn(&[DnsRecord], &DnsRecord) -> Vec<DnsRecord>,
    {
        let key = (rr.name().clone(), rr.rtype());
        let mut attempt = 0;
        loop {
            let existing = self.cached_rrset(&key).await?;
            let target = target_of(&existing, rr);
            if rrset_equal(&existing, &target) {
                trace!(record = %rr, "rrset already converged");
                return Ok(());
            }

            let batch = ChangeBatch {
                rrsets: vec![rrset_change(&key, &target)],
            };
            match self.apply_batch(&batch).await {
                Ok(()) => {
                    self.cache.insert(key, target);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    crate::metrics::record_backend_retry(BACKEND_NAME, e.kind());
                    warn!(record = %rr, attempt, error = %e, "change batch failed; retrying");
                    if matches!(e, BackendError::Conflict(_)) {
                        self.zone_loaded = false;
                    }
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DnsBackend for ApiBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn dns_records(&mut self) -> Result<Vec<DnsRecord>, BackendError> {
        self.refresh_zone().await?;
        Ok(self.cache.values().flatten().cloned().collect())
    }

    async fn publish_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        self.converge(rr, publish_target).await
    }

    async fn suppress_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        self.converge(rr, suppress_target).await?;

        if rr.rtype() == RecordType::SRV {
            let srv_key = (rr.name().clone(), RecordType::SRV);
            if self.cached_rrset(&srv_key).await?.is_empty() {
                // Last SRV at the instance: drop the TXT and the service
                // PTR entry pointing here.
                let txt_key = (rr.name().clone(), RecordType::TXT);
                if !self.cached_rrset(&txt_key).await?.is_empty() {
                    let batch = ChangeBatch {
                        rrsets: vec![rrset_change(&txt_key, &[])],
                    };
                    self.apply_batch(&batch).await?;
                    self.cache.insert(txt_key, Vec::new());
                }

                if let Some(service) = parent_service_name(rr.name()) {
                    let ptr_key = (service, RecordType::PTR);
                    let existing = self.cached_rrset(&ptr_key).await?;
                    let remaining: Vec<DnsRecord> = existing
                        .iter()
                        .filter(|ptr| !points_at(ptr, rr.name()))
                        .cloned()
                        .collect();
                    if remaining.len() != existing.len() {
                        let batch = ChangeBatch {
                            rrsets: vec![rrset_change(&ptr_key, &remaining)],
                        };
                        self.apply_batch(&batch).await?;
                        self.cache.insert(ptr_key, remaining);
                    }
                }
            }
        }
        Ok(())
    }

    async fn suppress_shared_records(&mut self) -> Result<(), BackendError> {
        self.refresh_zone().await?;

        let enumeration = enumeration_name(&self.base_domain);
        let doomed: Vec<RrKey> = self
            .cache
            .keys()
            .filter(|(name, rtype)| {
                *rtype == RecordType::PTR
                    && (*name == enumeration || is_discovery_name(name, &self.base_domain))
            })
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        // One key appears at most once, so a single batch is conflict-free.
        let batch = ChangeBatch {
            rrsets: doomed.iter().map(|key| rrset_change(key, &[])).collect(),
        };
        self.apply_batch(&batch).await?;
        for key in doomed {
            self.cache.remove(&key);
        }
        Ok(())
    }

    async fn rest(&mut self) {
        trace!(backend = BACKEND_NAME, "rest");
    }
}

/// Target rrset after publishing `rr` into `existing`.
fn publish_target(existing: &[DnsRecord], rr: &DnsRecord) -> Vec<DnsRecord> {
    match rr.rtype() {
        // Whole-set replacement.
        RecordType::A | RecordType::AAAA | RecordType::CNAME | RecordType::TXT => vec![rr.clone()],
        // Merge into the set; the set takes the published TTL.
        RecordType::SRV => {
            let mut target: Vec<DnsRecord> = existing
                .iter()
                .filter(|e| *e != rr)
                .map(|e| e.with_ttl(rr.ttl()))
                .collect();
            target.push(rr.clone());
            target
        }
        // Add only when the value is absent.
        RecordType::PTR => {
            if existing.contains(rr) {
                existing.to_vec()
            } else {
                let mut target = existing.to_vec();
                target.push(rr.clone());
                target
            }
        }
        _ => existing.to_vec(),
    }
}

/// Target rrset after suppressing `rr` from `existing`.
fn suppress_target(existing: &[DnsRecord], rr: &DnsRecord) -> Vec<DnsRecord> {
    existing.iter().filter(|e| *e != rr).cloned().collect()
}

fn rrset_change(key: &RrKey, target: &[DnsRecord]) -> RrSetChange {
    let (name, rtype) = key;
    if target.is_empty() {
        RrSetChange {
            name: name.to_string(),
            rtype: rtype.to_string(),
            ttl: 0,
            records: Vec::new(),
            changetype: Some("DELETE".to_string()),
        }
    } else {
        RrSetChange {
            name: name.to_string(),
            rtype: rtype.to_string(),
            ttl: target[0].ttl(),
            records: target
                .iter()
                .map(|rr| RecordContent {
                    content: rr.value(),
                    disabled: false,
                })
                .collect(),
            changetype: Some("REPLACE".to_string()),
        }
    }
}

/// Order-insensitive rrset comparison (also TTL-aware, since a TTL change
/// alone must still be written).
fn rrset_equal(left: &[DnsRecord], right: &[DnsRecord]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .all(|l| right.iter().any(|r| l == r && l.ttl() == r.ttl()))
}

fn points_at(ptr: &DnsRecord, target: &Name) -> bool {
    match ptr.data() {
        crate::record::RecordData::Ptr { target: t } => t == target,
        _ => false,
    }
}

fn classify_status(status: StatusCode, op: &str) -> BackendError {
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            BackendError::Conflict(format!("{op}: HTTP {status}"))
        }
        StatusCode::NOT_FOUND => {
            // The zone itself is gone.
            BackendError::InvariantViolation(format!("{op}: zone not found"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Fatal(format!("{op}: HTTP {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => BackendError::Transient(format!("{op}: throttled")),
        s if s.is_server_error() => BackendError::Transient(format!("{op}: HTTP {s}")),
        s => BackendError::Fatal(format!("{op}: unexpected HTTP {s}")),
    }
}

async fn backoff(attempt: u32) {
    let base = 250u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base / 2);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

fn trim_dot(s: &str) -> String {
    s.trim_end_matches('.').to_string()
}
