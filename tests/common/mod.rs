//! Shared test infrastructure for the event-loop and reconciliation suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;

use ddnssd::backend::{enumeration_name, is_discovery_name, parent_service_name, DnsBackend};
use ddnssd::config::HostContext;
use ddnssd::container::Container;
use ddnssd::docker::{ContainerRuntime, ContainerSummary};
use ddnssd::error::{BackendError, Error};
use ddnssd::event::{self, Event, EventSender};
use ddnssd::record::{DnsRecord, RecordData};
use ddnssd::system::System;

// --- Constants ---

pub const BASE_DOMAIN: &str = "example.com";
pub const HOSTNAME: &str = "host1";

pub fn host_context() -> HostContext {
    HostContext {
        base_domain: name(BASE_DOMAIN),
        hostname: name("host1.example.com"),
        record_ttl: 60,
    }
}

pub fn name(s: &str) -> Name {
    let mut n = Name::from_ascii(s).expect("valid test name").to_lowercase();
    n.set_fqdn(true);
    n
}

// --- Record builders ---

pub fn a(n: &str, ip: &str) -> DnsRecord {
    DnsRecord::new(name(n), 60, RecordData::A(ip.parse().unwrap()))
}

pub fn aaaa(n: &str, ip: &str) -> DnsRecord {
    DnsRecord::new(name(n), 60, RecordData::Aaaa(ip.parse().unwrap()))
}

pub fn srv(n: &str, port: u16, target: &str) -> DnsRecord {
    DnsRecord::new(
        name(n),
        60,
        RecordData::Srv {
            priority: 0,
            weight: 0,
            port,
            target: name(target),
        },
    )
}

pub fn ptr(n: &str, target: &str) -> DnsRecord {
    DnsRecord::new(
        name(n),
        60,
        RecordData::Ptr {
            target: name(target),
        },
    )
}

pub fn txt(n: &str, attrs: &[&str]) -> DnsRecord {
    DnsRecord::new(
        name(n),
        60,
        RecordData::Txt(attrs.iter().map(|s| s.to_string()).collect()),
    )
}

// --- MemoryBackend ---

#[derive(Debug, Default)]
struct MemoryZoneInner {
    records: Vec<DnsRecord>,
    publish_log: Vec<DnsRecord>,
    suppress_log: Vec<DnsRecord>,
    rest_calls: usize,
}

/// Handle onto a [`MemoryBackend`]'s zone, kept by tests for assertions
/// while the `System` owns the backend itself.
#[derive(Debug, Clone, Default)]
pub struct MemoryZone {
    inner: Arc<Mutex<MemoryZoneInner>>,
}

impl MemoryZone {
    pub fn records(&self) -> Vec<DnsRecord> {
        self.inner.lock().records.clone()
    }

    pub fn seed(&self, records: Vec<DnsRecord>) {
        self.inner.lock().records = records;
    }

    pub fn publish_log(&self) -> Vec<DnsRecord> {
        self.inner.lock().publish_log.clone()
    }

    pub fn suppress_log(&self) -> Vec<DnsRecord> {
        self.inner.lock().suppress_log.clone()
    }

    pub fn rest_calls(&self) -> usize {
        self.inner.lock().rest_calls
    }

    pub fn records_of(&self, rtype: RecordType) -> Vec<DnsRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.rtype() == rtype)
            .collect()
    }

    pub fn contains(&self, rr: &DnsRecord) -> bool {
        self.records().contains(rr)
    }

    pub fn records_at(&self, n: &str, rtype: RecordType) -> Vec<DnsRecord> {
        let n = name(n);
        self.records()
            .into_iter()
            .filter(|r| r.rtype() == rtype && r.name() == &n)
            .collect()
    }

    pub fn assert_contains(&self, rr: &DnsRecord) {
        assert!(
            self.contains(rr),
            "zone missing {rr}\nzone: {:#?}",
            self.records()
        );
    }

    pub fn assert_absent(&self, rr: &DnsRecord) {
        assert!(
            !self.contains(rr),
            "zone unexpectedly contains {rr}\nzone: {:#?}",
            self.records()
        );
    }
}

/// In-memory backend implementing the full publish/suppress contract,
/// including SRV/TXT/PTR set coupling. The conformance reference the
/// event-loop suites run against.
pub struct MemoryBackend {
    base_domain: Name,
    zone: MemoryZone,
}

impl MemoryBackend {
    /// Build a backend and the zone handle tests keep for assertions.
    pub fn create() -> (Self, MemoryZone) {
        let zone = MemoryZone::default();
        (
            Self {
                base_domain: name(BASE_DOMAIN),
                zone: zone.clone(),
            },
            zone,
        )
    }
}

#[async_trait]
impl DnsBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn dns_records(&mut self) -> Result<Vec<DnsRecord>, BackendError> {
        Ok(self.zone.records())
    }

    async fn publish_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        let mut inner = self.zone.inner.lock();
        inner.publish_log.push(rr.clone());
        match rr.rtype() {
            RecordType::A | RecordType::AAAA | RecordType::CNAME | RecordType::TXT => {
                inner
                    .records
                    .retain(|e| !(e.name() == rr.name() && e.rtype() == rr.rtype()));
                inner.records.push(rr.clone());
            }
            RecordType::SRV => {
                let ttl = rr.ttl();
                for existing in inner.records.iter_mut() {
                    if existing.name() == rr.name() && existing.rtype() == RecordType::SRV {
                        *existing = existing.with_ttl(ttl);
                    }
                }
                if !inner.records.contains(rr) {
                    inner.records.push(rr.clone());
                }
            }
            RecordType::PTR => {
                if !inner.records.contains(rr) {
                    inner.records.push(rr.clone());
                }
            }
            other => panic!("memory backend asked to publish {other}"),
        }
        Ok(())
    }

    async fn suppress_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        let mut inner = self.zone.inner.lock();
        inner.suppress_log.push(rr.clone());
        inner.records.retain(|e| e != rr);

        if rr.rtype() == RecordType::SRV {
            let srv_left = inner
                .records
                .iter()
                .any(|e| e.name() == rr.name() && e.rtype() == RecordType::SRV);
            if !srv_left {
                inner
                    .records
                    .retain(|e| !(e.name() == rr.name() && e.rtype() == RecordType::TXT));
                if let Some(service) = parent_service_name(rr.name()) {
                    inner.records.retain(|e| {
                        !(e.name() == &service
                            && e.rtype() == RecordType::PTR
                            && matches!(e.data(), RecordData::Ptr { target } if target == rr.name()))
                    });
                }
            }
        }
        Ok(())
    }

    async fn suppress_shared_records(&mut self) -> Result<(), BackendError> {
        let enumeration = enumeration_name(&self.base_domain);
        let base = self.base_domain.clone();
        let mut inner = self.zone.inner.lock();
        inner.records.retain(|e| {
            !(e.rtype() == RecordType::PTR
                && (e.name() == &enumeration || is_discovery_name(e.name(), &base)))
        });
        Ok(())
    }

    async fn rest(&mut self) {
        self.zone.inner.lock().rest_calls += 1;
    }
}

// --- StaticRuntime ---

/// Programmable in-memory container runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticRuntime {
    containers: Arc<Mutex<HashMap<String, ContainerSummary>>>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, summary: ContainerSummary) {
        self.containers.lock().insert(summary.id.clone(), summary);
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().remove(id);
    }
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    async fn get(&self, id: &str) -> Result<Option<ContainerSummary>, Error> {
        Ok(self.containers.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self.containers.lock().keys().cloned().collect())
    }
}

// --- Container summary builder ---

pub struct SummaryBuilder {
    summary: ContainerSummary,
}

impl SummaryBuilder {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            summary: ContainerSummary {
                id: id.to_string(),
                name: name.to_string(),
                labels: HashMap::new(),
                ipv4_addresses: Vec::new(),
                ipv6_addresses: Vec::new(),
            },
        }
    }

    pub fn ipv4(mut self, ip: &str) -> Self {
        self.summary
            .ipv4_addresses
            .push(ip.parse::<Ipv4Addr>().unwrap());
        self
    }

    pub fn ipv6(mut self, ip: &str) -> Self {
        self.summary
            .ipv6_addresses
            .push(ip.parse::<Ipv6Addr>().unwrap());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.summary.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Shorthand for a `ddnssd.<svc>.port` label.
    pub fn service(self, svc: &str, port: u16) -> Self {
        self.label(&format!("ddnssd.{svc}.port"), &port.to_string())
    }

    pub fn build(self) -> ContainerSummary {
        self.summary
    }
}

/// Container built directly (bypassing the runtime) for suppression tests.
pub fn container_for(summary: &ContainerSummary) -> Container {
    Container::new(summary, &host_context())
}

// --- Harness ---

/// A running `System` under test: send events, then `finish` to join the
/// loop and make assertions against the zone.
pub struct Harness {
    pub tx: EventSender,
    pub runtime: StaticRuntime,
    handle: tokio::task::JoinHandle<Result<(), Error>>,
}

impl Harness {
    /// Spawn a system over the given backends.
    pub fn start(backends: Vec<Box<dyn DnsBackend>>) -> Self {
        let runtime = StaticRuntime::new();
        let (tx, rx) = event::queue(64);
        let system = System::new(
            host_context(),
            Vec::new(),
            backends,
            Arc::new(runtime.clone()),
            rx,
        );
        let handle = tokio::spawn(system.run());
        Self {
            tx,
            runtime,
            handle,
        }
    }

    pub fn start_with_memory() -> (Self, MemoryZone) {
        let (backend, zone) = MemoryBackend::create();
        (Self::start(vec![Box::new(backend)]), zone)
    }

    pub async fn send(&self, event: Event) {
        self.tx.send(event).await.expect("system stopped early");
    }

    pub async fn started(&self, id: &str) {
        self.send(Event::Started { id: id.to_string() }).await;
    }

    pub async fn stopped(&self, id: &str) {
        self.send(Event::Stopped { id: id.to_string() }).await;
    }

    pub async fn died(&self, id: &str, exit_code: i64) {
        self.send(Event::Died {
            id: id.to_string(),
            exit_code,
        })
        .await;
    }

    pub async fn removed(&self, id: &str) {
        self.send(Event::Removed { id: id.to_string() }).await;
    }

    /// Terminate the loop and propagate any loop error.
    pub async fn finish(self) -> Result<(), Error> {
        self.tx
            .send(Event::Terminate)
            .await
            .expect("system stopped early");
        self.handle.await.expect("system task panicked")
    }
}
