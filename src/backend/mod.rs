//! The DNS backend contract and the backend registry.
//!
//! A backend maps the daemon's record operations onto a concrete
//! authoritative DNS store. The contract is deliberately asymmetric across
//! record types:
//!
//! - A, AAAA and CNAME **upsert**: publishing replaces the whole
//!   `(name, type)` rrset with the single given value.
//! - SRV publishes **add to the set** at the name, preserving siblings; the
//!   set's TTL becomes the published record's TTL.
//! - PTR publishes add the value to the set only if absent.
//! - TXT publishes upsert the single TXT record at the instance name.
//! - Suppressing an SRV whose set becomes empty also removes the TXT at
//!   that name and the instance's entry in the parent service PTR.
//!
//! Backends own their retry budget for `Transient` and `Conflict` failures;
//! callers only ever see exhausted budgets.

use async_trait::async_trait;
use hickory_proto::rr::Name;

use crate::config::{BackendConfig, Config};
use crate::error::{BackendError, Error};
use crate::record::DnsRecord;

pub mod api;
pub mod sql;

pub use api::ApiBackend;
pub use sql::SqlBackend;

/// Contract all DNS backends implement.
#[async_trait]
pub trait DnsBackend: Send {
    /// Human-readable tag for logs and metrics.
    fn name(&self) -> &str;

    /// Snapshot of every record of a managed type currently in the zone,
    /// with no ownership filtering.
    async fn dns_records(&mut self) -> Result<Vec<DnsRecord>, BackendError>;

    /// Ensure the record is present, per the type-specific contract above.
    /// Publishing an already-present record is a no-op.
    async fn publish_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError>;

    /// Remove exactly the record identified by `(name, type, value)`, plus
    /// the SRV-coupled TXT/PTR cleanup. Suppressing an absent record is a
    /// no-op.
    async fn suppress_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError>;

    /// Delete the shared discovery records this daemon creates: the
    /// `_services._dns-sd._udp.<base>` enumeration PTRs and the per-service
    /// PTR sets. Called only on graceful total shutdown.
    async fn suppress_shared_records(&mut self) -> Result<(), BackendError>;

    /// Advisory hook invoked when the event queue drains; backends may
    /// flush pending work.
    async fn rest(&mut self);
}

/// Instantiate every configured backend, in configuration order.
pub fn from_config(config: &Config, base_domain: &Name) -> Result<Vec<Box<dyn DnsBackend>>, Error> {
    if config.backends.is_empty() {
        return Err(Error::Config(
            "at least one DNS backend must be configured".to_string(),
        ));
    }

    config
        .backends
        .iter()
        .map(|backend| match backend {
            BackendConfig::Api(c) => {
                ApiBackend::new(c, base_domain).map(|b| Box::new(b) as Box<dyn DnsBackend>)
            }
            BackendConfig::Sql(c) => {
                SqlBackend::open(c, base_domain).map(|b| Box::new(b) as Box<dyn DnsBackend>)
            }
        })
        .collect()
}

/// The zone-wide service enumeration name, `_services._dns-sd._udp.<base>`.
pub fn enumeration_name(base_domain: &Name) -> Name {
    Name::from_ascii("_services._dns-sd._udp")
        .expect("static label")
        .append_domain(base_domain)
        .expect("enumeration name fits")
}

/// The service-level name an instance belongs to (the instance name minus
/// its leftmost label). `None` at the root.
pub fn parent_service_name(instance: &Name) -> Option<Name> {
    if instance.is_root() || instance.num_labels() < 2 {
        return None;
    }
    Some(instance.base_name())
}

/// Whether a name is one of the shared discovery names this daemon creates:
/// the enumeration name or a service-level name (first label underscored).
pub fn is_discovery_name(name: &Name, base_domain: &Name) -> bool {
    if !base_domain.zone_of(name) || name == base_domain {
        return false;
    }
    name.iter()
        .next()
        .map(|label| label.first() == Some(&b'_'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    #[test]
    fn test_enumeration_name() {
        assert_eq!(
            enumeration_name(&name("example.com.")).to_string(),
            "_services._dns-sd._udp.example.com."
        );
    }

    #[test]
    fn test_parent_service_name() {
        assert_eq!(
            parent_service_name(&name("c1._http._tcp.example.com.")),
            Some(name("_http._tcp.example.com."))
        );
        assert_eq!(parent_service_name(&Name::root()), None);
    }

    #[test]
    fn test_is_discovery_name() {
        let base = name("example.com.");
        assert!(is_discovery_name(&name("_http._tcp.example.com."), &base));
        assert!(is_discovery_name(
            &name("_services._dns-sd._udp.example.com."),
            &base
        ));
        assert!(!is_discovery_name(&name("c1.host1.example.com."), &base));
        assert!(!is_discovery_name(&name("_http._tcp.other.org."), &base));
        assert!(!is_discovery_name(&base, &base));
    }
}
