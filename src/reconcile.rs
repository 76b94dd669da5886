//! Set-difference reconciliation between desired and live records.
//!
//! Reconciliation only ever deletes records this host owns (A/AAAA by name
//! suffix, SRV by target suffix). Shared PTR/TXT/CNAME records are never
//! deleted, and are not re-created when an identical copy already exists.
//! Deletes run before creates so a rename of a `(name, type)` lands cleanly.

use std::collections::HashSet;

use hickory_proto::rr::Name;
use tracing::{debug, warn};

use crate::backend::DnsBackend;
use crate::error::BackendError;
use crate::record::DnsRecord;

/// The mutations one reconciliation pass wants to apply to a backend.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub to_delete: Vec<DnsRecord>,
    pub to_create: Vec<DnsRecord>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty()
    }
}

/// Diff the desired set against a backend's live view.
pub fn plan(desired: &[DnsRecord], existing: &[DnsRecord], host_fqdn: &Name) -> ReconcilePlan {
    let desired_set: HashSet<&DnsRecord> = desired.iter().collect();
    let our_live: HashSet<&DnsRecord> = existing
        .iter()
        .filter(|rr| rr.owned_by(host_fqdn))
        .collect();
    let shared_existing: HashSet<&DnsRecord> =
        existing.iter().filter(|rr| rr.is_shared_type()).collect();

    let to_delete = our_live
        .iter()
        .filter(|rr| !desired_set.contains(*rr))
        .map(|rr| (*rr).clone())
        .collect();

    let to_create = desired
        .iter()
        .filter(|rr| !our_live.contains(rr) && !shared_existing.contains(rr))
        .cloned()
        .collect();

    ReconcilePlan {
        to_delete,
        to_create,
    }
}

/// Run one reconciliation pass against a backend. Per-record failures are
/// logged and the pass continues; `Fatal` aborts immediately.
pub async fn reconcile_backend(
    backend: &mut dyn DnsBackend,
    desired: &[DnsRecord],
    host_fqdn: &Name,
) -> Result<(), BackendError> {
    let timer = crate::metrics::Timer::start();
    let existing = backend.dns_records().await?;
    let plan = plan(desired, &existing, host_fqdn);

    debug!(
        backend = backend.name(),
        existing = existing.len(),
        desired = desired.len(),
        to_delete = plan.to_delete.len(),
        to_create = plan.to_create.len(),
        "computed reconciliation plan"
    );

    for rr in &plan.to_delete {
        if let Err(e) = backend.suppress_record(rr).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(backend = backend.name(), record = %rr, error = %e, "reconcile delete failed");
        }
    }
    for rr in &plan.to_create {
        if let Err(e) = backend.publish_record(rr).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(backend = backend.name(), record = %rr, error = %e, "reconcile create failed");
        }
    }

    crate::metrics::record_reconcile(
        backend.name(),
        plan.to_delete.len(),
        plan.to_create.len(),
        timer.elapsed(),
    );
    Ok(())
}
