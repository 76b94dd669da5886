//! Conformance tests for the SQL backend against an in-memory database.

mod common;

use common::*;
use ddnssd::backend::{DnsBackend, SqlBackend};
use hickory_proto::rr::RecordType;
use rusqlite::Connection;

/// The PowerDNS-style schema the backend assumes pre-exists.
fn schema(base_domain: &str) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE domains (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
         );
         CREATE TABLE records (
            id INTEGER PRIMARY KEY,
            domain_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            content TEXT NOT NULL,
            ttl INTEGER NOT NULL,
            change_date INTEGER NOT NULL
         );",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO domains (id, name) VALUES (1, ?1)",
        [base_domain],
    )
    .unwrap();
    conn
}

fn sql_backend() -> SqlBackend {
    SqlBackend::from_connection(schema(BASE_DOMAIN), &name(BASE_DOMAIN))
}

async fn records_of(backend: &mut SqlBackend, rtype: RecordType) -> Vec<ddnssd::DnsRecord> {
    backend
        .dns_records()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.rtype() == rtype)
        .collect()
}

#[tokio::test]
async fn test_publish_is_idempotent() {
    let mut backend = sql_backend();
    let rr = a("c1.host1.example.com", "10.0.0.1");

    backend.publish_record(&rr).await.unwrap();
    backend.publish_record(&rr).await.unwrap();

    let records = backend.dns_records().await.unwrap();
    assert_eq!(records, vec![rr]);
}

#[tokio::test]
async fn test_suppress_is_idempotent() {
    let mut backend = sql_backend();
    let rr = a("c1.host1.example.com", "10.0.0.1");

    backend.publish_record(&rr).await.unwrap();
    backend.suppress_record(&rr).await.unwrap();
    backend.suppress_record(&rr).await.unwrap();

    assert!(backend.dns_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_address_publish_replaces_rrset() {
    let mut backend = sql_backend();

    backend
        .publish_record(&a("c1.host1.example.com", "10.0.0.1"))
        .await
        .unwrap();
    backend
        .publish_record(&a("c1.host1.example.com", "10.0.0.2"))
        .await
        .unwrap();

    let records = records_of(&mut backend, RecordType::A).await;
    assert_eq!(records, vec![a("c1.host1.example.com", "10.0.0.2")]);
}

#[tokio::test]
async fn test_srv_publish_preserves_siblings() {
    let mut backend = sql_backend();
    let r1 = srv("i._http._tcp.example.com", 80, "c1.host1.example.com");
    let r2 = srv("i._http._tcp.example.com", 81, "c2.host1.example.com");

    backend.publish_record(&r1).await.unwrap();
    backend.publish_record(&r2).await.unwrap();

    let records = records_of(&mut backend, RecordType::SRV).await;
    assert_eq!(records.len(), 2);
    assert!(records.contains(&r1));
    assert!(records.contains(&r2));
}

#[tokio::test]
async fn test_srv_publish_rewrites_set_ttl() {
    let mut backend = sql_backend();
    let r1 = srv("i._http._tcp.example.com", 80, "c1.host1.example.com");
    let r2 = srv("i._http._tcp.example.com", 81, "c2.host1.example.com").with_ttl(120);

    backend.publish_record(&r1).await.unwrap();
    backend.publish_record(&r2).await.unwrap();

    let records = records_of(&mut backend, RecordType::SRV).await;
    assert!(records.iter().all(|r| r.ttl() == 120));
}

#[tokio::test]
async fn test_last_srv_suppression_couples_txt_and_ptr() {
    let mut backend = sql_backend();
    let r1 = srv("i1._http._tcp.example.com", 80, "c1.host1.example.com");
    let r2 = srv("i1._http._tcp.example.com", 81, "c2.host1.example.com");

    backend.publish_record(&r1).await.unwrap();
    backend.publish_record(&r2).await.unwrap();
    backend
        .publish_record(&txt("i1._http._tcp.example.com", &["k=v"]))
        .await
        .unwrap();
    backend
        .publish_record(&ptr("_http._tcp.example.com", "i1._http._tcp.example.com"))
        .await
        .unwrap();
    backend
        .publish_record(&ptr("_http._tcp.example.com", "i2._http._tcp.example.com"))
        .await
        .unwrap();

    // First suppression leaves a sibling, so TXT and PTR stay.
    backend.suppress_record(&r1).await.unwrap();
    assert_eq!(records_of(&mut backend, RecordType::SRV).await.len(), 1);
    assert_eq!(records_of(&mut backend, RecordType::TXT).await.len(), 1);
    assert_eq!(records_of(&mut backend, RecordType::PTR).await.len(), 2);

    // Suppressing the last SRV takes the TXT and this instance's PTR entry
    // with it; the sibling instance's PTR survives.
    backend.suppress_record(&r2).await.unwrap();
    assert!(records_of(&mut backend, RecordType::SRV).await.is_empty());
    assert!(records_of(&mut backend, RecordType::TXT).await.is_empty());
    let ptrs = records_of(&mut backend, RecordType::PTR).await;
    assert_eq!(
        ptrs,
        vec![ptr("_http._tcp.example.com", "i2._http._tcp.example.com")]
    );
}

#[tokio::test]
async fn test_ptr_publish_skips_existing_value() {
    let mut backend = sql_backend();
    let entry = ptr("_http._tcp.example.com", "i1._http._tcp.example.com");

    backend.publish_record(&entry).await.unwrap();
    backend.publish_record(&entry).await.unwrap();

    assert_eq!(records_of(&mut backend, RecordType::PTR).await.len(), 1);
}

#[tokio::test]
async fn test_txt_publish_upserts_single_record() {
    let mut backend = sql_backend();

    backend
        .publish_record(&txt("i1._http._tcp.example.com", &["v=1"]))
        .await
        .unwrap();
    backend
        .publish_record(&txt("i1._http._tcp.example.com", &["v=2"]))
        .await
        .unwrap();

    let records = records_of(&mut backend, RecordType::TXT).await;
    assert_eq!(records, vec![txt("i1._http._tcp.example.com", &["v=2"])]);
}

#[tokio::test]
async fn test_missing_base_domain_is_a_noop() {
    let conn = schema("other.org");
    let mut backend = SqlBackend::from_connection(conn, &name("absent.example.com"));

    // The zone's domain row is missing: publish logs and drops.
    backend
        .publish_record(&a("c1.absent.example.com", "10.0.0.1"))
        .await
        .unwrap();
    assert!(backend.dns_records().await.unwrap().is_empty());

    backend
        .suppress_record(&a("c1.absent.example.com", "10.0.0.1"))
        .await
        .unwrap();
    backend.suppress_shared_records().await.unwrap();
}

#[tokio::test]
async fn test_names_and_types_stored_canonically() {
    let mut backend = sql_backend();

    backend
        .publish_record(&a("C1.Host1.Example.Com", "10.0.0.1"))
        .await
        .unwrap();

    let records = backend.dns_records().await.unwrap();
    assert_eq!(records[0].name().to_string(), "c1.host1.example.com.");

    // Round-trip equality against the lowercase form.
    assert_eq!(records[0], a("c1.host1.example.com", "10.0.0.1"));
}

#[tokio::test]
async fn test_suppress_shared_records_removes_discovery_ptrs() {
    let mut backend = sql_backend();

    backend
        .publish_record(&ptr("_http._tcp.example.com", "i1._http._tcp.example.com"))
        .await
        .unwrap();
    backend
        .publish_record(&ptr(
            "_services._dns-sd._udp.example.com",
            "_http._tcp.example.com",
        ))
        .await
        .unwrap();
    // A PTR that is not a discovery name survives.
    backend
        .publish_record(&ptr("foo.example.com", "c1.host1.example.com"))
        .await
        .unwrap();

    backend.suppress_shared_records().await.unwrap();

    let ptrs = records_of(&mut backend, RecordType::PTR).await;
    assert_eq!(ptrs, vec![ptr("foo.example.com", "c1.host1.example.com")]);
}

#[tokio::test]
async fn test_dns_records_skips_foreign_types() {
    let conn = schema(BASE_DOMAIN);
    conn.execute(
        "INSERT INTO records (domain_id, name, type, content, ttl, change_date)
         VALUES (1, 'example.com', 'SOA', 'ns1.example.com hostmaster.example.com 1 3600 600 604800 60', 3600, 0)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO records (domain_id, name, type, content, ttl, change_date)
         VALUES (1, 'c1.host1.example.com', 'A', '10.0.0.1', 60, 0)",
        [],
    )
    .unwrap();

    let mut backend = SqlBackend::from_connection(conn, &name(BASE_DOMAIN));
    let records = backend.dns_records().await.unwrap();
    assert_eq!(records, vec![a("c1.host1.example.com", "10.0.0.1")]);
}
