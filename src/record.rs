//! DNS record value type.
//!
//! A [`DnsRecord`] is an immutable description of a single resource record:
//! a lowercase fully-qualified name, a TTL, and a typed payload. Identity is
//! the `(name, type, value)` tuple, where `value` is the canonical
//! master-file text of the payload; TTL and name casing never participate in
//! equality. Backends store and compare records through this identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::rr::{Name, RecordType};

use crate::error::Error;

/// Typed payload of a resource record.
///
/// TXT carries a sequence of `key=value` attribute strings; insertion order
/// is significant and preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Ptr {
        target: Name,
    },
    Txt(Vec<String>),
    Cname {
        target: Name,
    },
}

impl RecordData {
    /// The record type this payload belongs to.
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::AAAA,
            RecordData::Srv { .. } => RecordType::SRV,
            RecordData::Ptr { .. } => RecordType::PTR,
            RecordData::Txt(_) => RecordType::TXT,
            RecordData::Cname { .. } => RecordType::CNAME,
        }
    }

    /// Parse canonical master-file text back into a typed payload.
    ///
    /// Accepts names with or without a trailing dot; this inverts
    /// [`DnsRecord::value`] for every supported type.
    pub fn parse(rtype: RecordType, text: &str) -> Result<Self, Error> {
        let text = text.trim();
        match rtype {
            RecordType::A => text
                .parse::<Ipv4Addr>()
                .map(RecordData::A)
                .map_err(|e| Error::InvalidRecord(format!("A {text:?}: {e}"))),
            RecordType::AAAA => text
                .parse::<Ipv6Addr>()
                .map(RecordData::Aaaa)
                .map_err(|e| Error::InvalidRecord(format!("AAAA {text:?}: {e}"))),
            RecordType::SRV => {
                let mut parts = text.split_whitespace();
                let (prio, weight, port, target) = (
                    parts.next(),
                    parts.next(),
                    parts.next(),
                    parts.next(),
                );
                match (prio, weight, port, target, parts.next()) {
                    (Some(p), Some(w), Some(po), Some(t), None) => Ok(RecordData::Srv {
                        priority: p
                            .parse()
                            .map_err(|e| Error::InvalidRecord(format!("SRV priority: {e}")))?,
                        weight: w
                            .parse()
                            .map_err(|e| Error::InvalidRecord(format!("SRV weight: {e}")))?,
                        port: po
                            .parse()
                            .map_err(|e| Error::InvalidRecord(format!("SRV port: {e}")))?,
                        target: parse_name(t)?,
                    }),
                    _ => Err(Error::InvalidRecord(format!(
                        "SRV needs 'priority weight port target', got {text:?}"
                    ))),
                }
            }
            RecordType::PTR => Ok(RecordData::Ptr {
                target: parse_name(text)?,
            }),
            RecordType::CNAME => Ok(RecordData::Cname {
                target: parse_name(text)?,
            }),
            RecordType::TXT => Ok(RecordData::Txt(parse_txt(text)?)),
            other => Err(Error::InvalidRecord(format!(
                "unsupported record type {other}"
            ))),
        }
    }
}

/// A single resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    name: Name,
    ttl: u32,
    data: RecordData,
}

impl DnsRecord {
    /// Create a record. The name (and any name inside the payload) is
    /// normalised to a lowercase FQDN.
    pub fn new(name: Name, ttl: u32, data: RecordData) -> Self {
        let data = match data {
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => RecordData::Srv {
                priority,
                weight,
                port,
                target: normalise(target),
            },
            RecordData::Ptr { target } => RecordData::Ptr {
                target: normalise(target),
            },
            RecordData::Cname { target } => RecordData::Cname {
                target: normalise(target),
            },
            other => other,
        };
        Self {
            name: normalise(name),
            ttl,
            data,
        }
    }

    /// Parse a record from its stored parts (name and value text).
    pub fn parse(name: &str, ttl: u32, rtype: RecordType, value: &str) -> Result<Self, Error> {
        Ok(Self::new(parse_name(name)?, ttl, RecordData::parse(rtype, value)?))
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn data(&self) -> &RecordData {
        &self.data
    }

    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }

    /// Canonical wire-text form of the payload; the identity content used by
    /// backends. Names are emitted lowercase with a trailing dot.
    pub fn value(&self) -> String {
        match &self.data {
            RecordData::A(ip) => ip.to_string(),
            RecordData::Aaaa(ip) => ip.to_string(),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => format!("{priority} {weight} {port} {target}"),
            RecordData::Ptr { target } => target.to_string(),
            RecordData::Cname { target } => target.to_string(),
            RecordData::Txt(attrs) => attrs
                .iter()
                .map(|a| format!("\"{}\"", escape_txt(a)))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Same record with a different TTL; identity is unchanged.
    pub fn with_ttl(&self, ttl: u32) -> Self {
        Self {
            name: self.name.clone(),
            ttl,
            data: self.data.clone(),
        }
    }

    /// Whether this record is owned by the host with the given FQDN.
    ///
    /// A and AAAA records are owned when their name sits at or under the host
    /// FQDN; SRV records when their target does. PTR, TXT and CNAME are
    /// shared with other writers and never owned.
    pub fn owned_by(&self, host_fqdn: &Name) -> bool {
        match &self.data {
            RecordData::A(_) | RecordData::Aaaa(_) => host_fqdn.zone_of(&self.name),
            RecordData::Srv { target, .. } => host_fqdn.zone_of(target),
            RecordData::Ptr { .. } | RecordData::Txt(_) | RecordData::Cname { .. } => false,
        }
    }

    /// Whether the type is one of the shared (co-authored) types.
    pub fn is_shared_type(&self) -> bool {
        matches!(
            self.rtype(),
            RecordType::PTR | RecordType::TXT | RecordType::CNAME
        )
    }
}

impl PartialEq for DnsRecord {
    fn eq(&self, other: &Self) -> bool {
        // Name equality in hickory is case-insensitive already.
        self.name == other.name && self.rtype() == other.rtype() && self.value() == other.value()
    }
}

impl Eq for DnsRecord {}

impl Hash for DnsRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.rtype().hash(state);
        self.value().hash(state);
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} IN {} {}",
            self.name,
            self.ttl,
            self.rtype(),
            self.value()
        )
    }
}

/// The record types this daemon manages.
pub const MANAGED_TYPES: [RecordType; 6] = [
    RecordType::A,
    RecordType::AAAA,
    RecordType::SRV,
    RecordType::PTR,
    RecordType::TXT,
    RecordType::CNAME,
];

/// True if the type is one we manage.
pub fn is_managed_type(rtype: RecordType) -> bool {
    MANAGED_TYPES.contains(&rtype)
}

/// Parse a managed record type from its upper-case identifier.
pub fn parse_rtype(s: &str) -> Result<RecordType, Error> {
    let rtype = RecordType::from_str(s.trim())
        .map_err(|e| Error::InvalidRecord(format!("record type {s:?}: {e}")))?;
    if is_managed_type(rtype) {
        Ok(rtype)
    } else {
        Err(Error::InvalidRecord(format!("unmanaged record type {s}")))
    }
}

fn normalise(name: Name) -> Name {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name
}

fn parse_name(s: &str) -> Result<Name, Error> {
    Name::from_ascii(s)
        .map(normalise)
        .map_err(|e| Error::InvalidRecord(format!("name {s:?}: {e}")))
}

fn escape_txt(attr: &str) -> String {
    attr.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse TXT content: a sequence of quoted strings, or a single bare string.
fn parse_txt(text: &str) -> Result<Vec<String>, Error> {
    if !text.starts_with('"') {
        return Ok(vec![text.to_string()]);
    }

    let mut attrs = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                let mut attr = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => attr.push(escaped),
                            None => {
                                return Err(Error::InvalidRecord(format!(
                                    "TXT truncated escape in {text:?}"
                                )))
                            }
                        },
                        Some('"') => break,
                        Some(inner) => attr.push(inner),
                        None => {
                            return Err(Error::InvalidRecord(format!(
                                "TXT unterminated string in {text:?}"
                            )))
                        }
                    }
                }
                attrs.push(attr);
            }
            c if c.is_whitespace() => {}
            other => {
                return Err(Error::InvalidRecord(format!(
                    "TXT unexpected {other:?} in {text:?}"
                )))
            }
        }
    }
    Ok(attrs)
}
