//! SQL backend over a PowerDNS-style relational schema.
//!
//! The store is the classic generic-SQL authoritative layout:
//! `domains(id, name)` joined to `records(domain_id, name, type, content,
//! ttl, change_date)`. The schema pre-exists; this backend only reads and
//! mutates rows scoped to the base domain's `domain_id`. Names are
//! lowercased and stored without a trailing dot, types as upper-case ASCII.
//!
//! Every compound operation runs in its own transaction, so `Conflict` is
//! unreachable here; busy/locked failures are retried as `Transient`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hickory_proto::rr::{Name, RecordType};
use rusqlite::{named_params, Connection, OptionalExtension, Transaction};
use tracing::{debug, trace, warn};

use crate::backend::{enumeration_name, is_discovery_name, parent_service_name, DnsBackend};
use crate::config::SqlBackendConfig;
use crate::error::{BackendError, Error};
use crate::record::{parse_rtype, DnsRecord, RecordData};

const BACKEND_NAME: &str = "sql";
const MAX_ATTEMPTS: u32 = 3;

const MANAGED_TYPES_SQL: &str = "('A', 'AAAA', 'SRV', 'PTR', 'TXT', 'CNAME')";

/// SQL backend bound to one base domain.
pub struct SqlBackend {
    base_domain: Name,
    connection: Arc<Mutex<Connection>>,
}

impl SqlBackend {
    /// Open the configured database (in-memory when no path is given).
    pub fn open(config: &SqlBackendConfig, base_domain: &Name) -> Result<Self, Error> {
        let connection = match &config.path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|e| Error::Config(format!("sql backend: {e}")))?;
        Ok(Self::from_connection(connection, base_domain))
    }

    /// Wrap an existing connection; the test suites use this.
    pub fn from_connection(connection: Connection, base_domain: &Name) -> Self {
        Self {
            base_domain: base_domain.clone(),
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    /// Run `op` in a transaction, retrying transient SQLite failures with a
    /// short backoff. The whole transaction is re-run on retry.
    async fn with_transaction<T, F>(&self, op_name: &'static str, op: F) -> Result<T, BackendError>
    where
        F: Fn(&Transaction<'_>, Option<i64>) -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            // A failed transaction is rolled back on drop; retries re-run it
            // from the top.
            let result: rusqlite::Result<T> = (|| {
                let mut conn = self.connection.lock().expect("connection poisoned");
                let tx = conn.transaction()?;
                let domain_id = lookup_domain_id(&tx, &self.base_domain)?;
                let value = op(&tx, domain_id)?;
                tx.commit()?;
                Ok(value)
            })();

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let classified = classify_sql_error(op_name, &e);
                    attempt += 1;
                    if classified.is_retryable() && attempt < MAX_ATTEMPTS {
                        crate::metrics::record_backend_retry(BACKEND_NAME, classified.kind());
                        tokio::time::sleep(Duration::from_millis(50u64 << attempt)).await;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }
}

#[async_trait]
impl DnsBackend for SqlBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn dns_records(&mut self) -> Result<Vec<DnsRecord>, BackendError> {
        let rows = self
            .with_transaction("dns_records", |tx, domain_id| {
                let Some(domain_id) = domain_id else {
                    return Ok(Vec::new());
                };
                let mut stmt = tx.prepare(&format!(
                    "SELECT name, type, ttl, content FROM records \
                     WHERE domain_id = :domain_id AND type IN {MANAGED_TYPES_SQL}"
                ))?;
                let rows = stmt
                    .query_map(named_params! { ":domain_id": domain_id }, |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (name, rtype, ttl, content) in rows {
            match parse_row(&name, &rtype, ttl, &content) {
                Ok(rr) => records.push(rr),
                Err(e) => {
                    warn!(name = %name, rtype = %rtype, error = %e, "unparseable row in records table; skipping")
                }
            }
        }
        Ok(records)
    }

    async fn publish_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        let rr = rr.clone();
        let base = self.base_domain.clone();
        self.with_transaction("publish_record", move |tx, domain_id| {
            let Some(domain_id) = domain_id else {
                missing_domain(&base, &rr);
                return Ok(());
            };
            let rx = RecordPersistence::new(tx, domain_id);
            match rr.rtype() {
                RecordType::A | RecordType::AAAA | RecordType::CNAME | RecordType::TXT => {
                    rx.upsert(&rr)
                }
                RecordType::SRV => {
                    let added = rx.add(&rr)?;
                    // The whole set takes the published TTL.
                    rx.set_ttl(rr.name(), RecordType::SRV, rr.ttl())?;
                    trace!(record = %rr, added, "published SRV");
                    Ok(())
                }
                RecordType::PTR => rx.add(&rr).map(|_| ()),
                other => {
                    warn!(rtype = %other, "refusing to publish unmanaged record type");
                    Ok(())
                }
            }
        })
        .await
    }

    async fn suppress_record(&mut self, rr: &DnsRecord) -> Result<(), BackendError> {
        let rr = rr.clone();
        let base = self.base_domain.clone();
        self.with_transaction("suppress_record", move |tx, domain_id| {
            let Some(domain_id) = domain_id else {
                missing_domain(&base, &rr);
                return Ok(());
            };
            let rx = RecordPersistence::new(tx, domain_id);
            let removed = rx.remove(&rr)?;
            if removed == 0 {
                debug!(record = %rr, "suppress of absent record is a no-op");
            }

            if rr.rtype() == RecordType::SRV && rx.count(rr.name(), RecordType::SRV)? == 0 {
                // Last SRV at this instance: the instance TXT goes with it,
                // and the parent service PTR no longer points here.
                rx.remove_with(rr.name(), RecordType::TXT, None)?;
                if let Some(service) = parent_service_name(rr.name()) {
                    rx.remove_with(&service, RecordType::PTR, Some(&sql_name(rr.name())))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn suppress_shared_records(&mut self) -> Result<(), BackendError> {
        let base = self.base_domain.clone();
        let enumeration = enumeration_name(&base);
        self.with_transaction("suppress_shared_records", move |tx, domain_id| {
            let Some(domain_id) = domain_id else {
                debug!(base_domain = %base, "base domain missing; nothing shared to suppress");
                return Ok(());
            };
            let rx = RecordPersistence::new(tx, domain_id);
            let mut removed = rx.remove_with(&enumeration, RecordType::PTR, None)?;
            for name in rx.names_of_type(RecordType::PTR)? {
                if is_discovery_name(&name, &base) {
                    removed += rx.remove_with(&name, RecordType::PTR, None)?;
                }
            }
            debug!(removed, "suppressed shared discovery records");
            Ok(())
        })
        .await
    }

    async fn rest(&mut self) {
        trace!(backend = BACKEND_NAME, "rest");
    }
}

/// Row-level operations scoped to one domain, inside one transaction.
struct RecordPersistence<'c> {
    tx: &'c Connection,
    domain_id: i64,
}

impl<'c> RecordPersistence<'c> {
    fn new(tx: &'c Connection, domain_id: i64) -> Self {
        Self { tx, domain_id }
    }

    /// INSERT unless an identical `(name, type, content)` row exists.
    /// Returns whether a row was inserted.
    fn add(&self, rr: &DnsRecord) -> rusqlite::Result<bool> {
        let existing: Option<i64> = self
            .tx
            .query_row(
                "SELECT id FROM records \
                 WHERE domain_id = :domain_id AND name = :name AND type = :type AND content = :content",
                named_params! {
                    ":domain_id": self.domain_id,
                    ":name": sql_name(rr.name()),
                    ":type": rr.rtype().to_string(),
                    ":content": sql_content(rr),
                },
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }

        self.tx.execute(
            "INSERT INTO records (domain_id, name, type, content, ttl, change_date) \
             VALUES (:domain_id, :name, :type, :content, :ttl, :change_date)",
            named_params! {
                ":domain_id": self.domain_id,
                ":name": sql_name(rr.name()),
                ":type": rr.rtype().to_string(),
                ":content": sql_content(rr),
                ":ttl": rr.ttl(),
                ":change_date": Utc::now().timestamp(),
            },
        )?;
        Ok(true)
    }

    /// DELETE the row matching the record's full identity.
    fn remove(&self, rr: &DnsRecord) -> rusqlite::Result<usize> {
        self.tx.execute(
            "DELETE FROM records \
             WHERE domain_id = :domain_id AND name = :name AND type = :type AND content = :content",
            named_params! {
                ":domain_id": self.domain_id,
                ":name": sql_name(rr.name()),
                ":type": rr.rtype().to_string(),
                ":content": sql_content(rr),
            },
        )
    }

    /// DELETE by name and type, optionally narrowed by content.
    fn remove_with(
        &self,
        name: &Name,
        rtype: RecordType,
        content: Option<&str>,
    ) -> rusqlite::Result<usize> {
        match content {
            Some(content) => self.tx.execute(
                "DELETE FROM records \
                 WHERE domain_id = :domain_id AND name = :name AND type = :type AND content = :content",
                named_params! {
                    ":domain_id": self.domain_id,
                    ":name": sql_name(name),
                    ":type": rtype.to_string(),
                    ":content": content,
                },
            ),
            None => self.tx.execute(
                "DELETE FROM records \
                 WHERE domain_id = :domain_id AND name = :name AND type = :type",
                named_params! {
                    ":domain_id": self.domain_id,
                    ":name": sql_name(name),
                    ":type": rtype.to_string(),
                },
            ),
        }
    }

    /// Replace the whole `(name, type)` rrset with this single record.
    fn upsert(&self, rr: &DnsRecord) -> rusqlite::Result<()> {
        self.remove_with(rr.name(), rr.rtype(), None)?;
        self.add(rr)?;
        Ok(())
    }

    fn count(&self, name: &Name, rtype: RecordType) -> rusqlite::Result<i64> {
        self.tx.query_row(
            "SELECT COUNT(*) FROM records \
             WHERE domain_id = :domain_id AND name = :name AND type = :type",
            named_params! {
                ":domain_id": self.domain_id,
                ":name": sql_name(name),
                ":type": rtype.to_string(),
            },
            |row| row.get(0),
        )
    }

    fn set_ttl(&self, name: &Name, rtype: RecordType, ttl: u32) -> rusqlite::Result<usize> {
        self.tx.execute(
            "UPDATE records SET ttl = :ttl, change_date = :change_date \
             WHERE domain_id = :domain_id AND name = :name AND type = :type",
            named_params! {
                ":ttl": ttl,
                ":change_date": Utc::now().timestamp(),
                ":domain_id": self.domain_id,
                ":name": sql_name(name),
                ":type": rtype.to_string(),
            },
        )
    }

    fn names_of_type(&self, rtype: RecordType) -> rusqlite::Result<Vec<Name>> {
        let mut stmt = self.tx.prepare(
            "SELECT DISTINCT name FROM records \
             WHERE domain_id = :domain_id AND type = :type",
        )?;
        let names = stmt
            .query_map(
                named_params! { ":domain_id": self.domain_id, ":type": rtype.to_string() },
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter_map(|n| Name::from_ascii(&n).ok())
            .collect())
    }
}

fn lookup_domain_id(tx: &Connection, base_domain: &Name) -> rusqlite::Result<Option<i64>> {
    tx.query_row(
        "SELECT id FROM domains WHERE lower(name) = :name",
        named_params! { ":name": sql_name(base_domain) },
        |row| row.get(0),
    )
    .optional()
}

fn missing_domain(base_domain: &Name, rr: &DnsRecord) {
    warn!(
        base_domain = %base_domain,
        record = %rr,
        "base domain has no row in domains table; dropping operation"
    );
}

/// Lowercase name without the trailing dot, as the schema stores it.
fn sql_name(name: &Name) -> String {
    let mut s = name.to_lowercase().to_string();
    if s.ends_with('.') && s.len() > 1 {
        s.pop();
    }
    s
}

/// Record content in the schema's storage form: canonical value text with
/// target names dotless.
fn sql_content(rr: &DnsRecord) -> String {
    match rr.data() {
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => format!("{priority} {weight} {port} {}", sql_name(target)),
        RecordData::Ptr { target } | RecordData::Cname { target } => sql_name(target),
        _ => rr.value(),
    }
}

fn parse_row(name: &str, rtype: &str, ttl: u32, content: &str) -> Result<DnsRecord, Error> {
    DnsRecord::parse(name, ttl, parse_rtype(rtype)?, content)
}

fn classify_sql_error(op: &str, err: &rusqlite::Error) -> BackendError {
    use rusqlite::ffi::ErrorCode;

    match err {
        rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                BackendError::Transient(format!("{op}: {err}"))
            }
            ErrorCode::NotADatabase | ErrorCode::CannotOpen | ErrorCode::PermissionDenied => {
                BackendError::Fatal(format!("{op}: {err}"))
            }
            _ => BackendError::Fatal(format!("{op}: {err}")),
        },
        _ => BackendError::Fatal(format!("{op}: {err}")),
    }
}
