//! ddnssd - DNS-SD record publishing for containers.
//!
//! This crate provides a daemon that watches a container runtime and keeps
//! RFC 6763 service-discovery records for the host's containers published in
//! one or more authoritative DNS backends. Containers declare services via
//! `ddnssd.*` labels; as they start, stop, die and are removed, the matching
//! A/AAAA/SRV/PTR/TXT (and optional CNAME) records are published and
//! withdrawn.
//!
//! ## Features
//!
//! - Event-driven publishing with a single-consumer event loop
//! - Periodic and on-demand reconciliation against each backend's live view
//! - Crash retention: records of uncleanly-died containers stay published
//! - Pluggable backends: change-batch HTTP API and PowerDNS-schema SQL
//! - Graceful shutdown with optional full record withdrawal
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           ddnssd                               │
//! │                                                                │
//! │  ┌────────────────┐  events   ┌───────────────────┐            │
//! │  │ Docker watcher │ ────────▶ │   bounded queue   │            │
//! │  └────────────────┘           └─────────┬─────────┘            │
//! │  ┌────────────────┐  reconcile          │ single consumer      │
//! │  │ interval timer │ ────────────────────┤                      │
//! │  └────────────────┘                     ▼                      │
//! │                               ┌───────────────────┐            │
//! │                               │   System (loop)   │            │
//! │                               │  container map →  │            │
//! │                               │  desired records  │            │
//! │                               └─────────┬─────────┘            │
//! │                                         │ publish / suppress   │
//! │                          ┌──────────────┴──────────────┐       │
//! │                          ▼                             ▼       │
//! │                ┌──────────────────┐          ┌──────────────┐  │
//! │                │ change-batch API │          │  SQL backend │  │
//! │                │     backend      │          │ (PowerDNS)   │  │
//! │                └──────────────────┘          └──────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Record layout
//!
//! A container `c1` on host `host1` declaring `ddnssd.http.port=80` under
//! base domain `example.com` publishes:
//!
//! ```text
//! c1.host1.example.com.                    A    <container address>
//! c1._http._tcp.example.com.               SRV  0 0 80 c1.host1.example.com.
//! c1._http._tcp.example.com.               TXT  ""
//! _http._tcp.example.com.                  PTR  c1._http._tcp.example.com.
//! _services._dns-sd._udp.example.com.      PTR  _http._tcp.example.com.
//! ```
//!
//! A/AAAA/SRV records under the host's name are *owned* and reconciled
//! away when stale; PTR/TXT/CNAME are *shared* with other hosts publishing
//! into the same zone and are never deleted by reconciliation.

pub mod backend;
pub mod config;
pub mod container;
pub mod docker;
pub mod error;
pub mod event;
pub mod metrics;
pub mod record;
pub mod reconcile;
pub mod system;
pub mod telemetry;

pub use self::backend::DnsBackend;
pub use self::config::{Config, DaemonConfig, HostContext};
pub use self::error::{BackendError, Error};
pub use self::event::Event;
pub use self::record::{DnsRecord, RecordData};
pub use self::system::{run, System};
