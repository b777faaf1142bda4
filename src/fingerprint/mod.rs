// The immutable summary of one labelled sub-cluster, and the per-host
// store that accumulates them during training and backs comparisons
// during testing.

mod csv_io;

pub use csv_io::{append_fingerprint, dump_fingerprints, load_fingerprints};

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use crate::request::{Method, RequestRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Browser,
    Background,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Browser => write!(f, "Browser"),
            Label::Background => write!(f, "Background"),
        }
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Browser" => Ok(Label::Browser),
            "Background" => Ok(Label::Background),
            other => Err(format!("unknown label: {other}")),
        }
    }
}

/// A two-valued tag: only GET/POST sub-clusters ever become fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintMethod {
    Get,
    Post,
}

impl std::fmt::Display for FingerprintMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FingerprintMethod::Get => write!(f, "GET"),
            FingerprintMethod::Post => write!(f, "POST"),
        }
    }
}

impl std::str::FromStr for FingerprintMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(FingerprintMethod::Get),
            "POST" => Ok(FingerprintMethod::Post),
            other => Err(format!("unknown fingerprint method: {other}")),
        }
    }
}

impl TryFrom<Method> for FingerprintMethod {
    type Error = ();

    fn try_from(value: Method) -> Result<Self, Self::Error> {
        match value {
            Method::Get => Ok(FingerprintMethod::Get),
            Method::Post => Ok(FingerprintMethod::Post),
            Method::Other => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub label: Label,
    pub method: FingerprintMethod,
    pub user_agent: String,
    pub language: String,
    pub constant_header_fields: BTreeSet<String>,
    /// Insertion-ordered by first occurrence; a `Vec` rather than a map
    /// because order is part of the value, not an implementation detail.
    pub hosts: Vec<(String, u64)>,
    pub avg_size: f64,
    pub outgoing_info: u64,
}

/// Header names that are first-class fingerprint fields in their own
/// right and are therefore excluded from `constant_header_fields`.
const EXCLUDED_CONSTANT_FIELDS: &[&str] = &["user-agent", "accept-language", "host"];

/// Builds the Fingerprint for one non-empty, method-homogeneous
/// sub-cluster. Returns `None` only if `sub_cluster` is empty — the spec's
/// invariant that an empty fingerprint is represented by absence, never by
/// a zero-length value, is enforced here rather than by the caller.
pub fn generate_fingerprint(
    sub_cluster: &[RequestRecord],
    method: FingerprintMethod,
    label: Label,
) -> Option<Fingerprint> {
    let first = sub_cluster.first()?;

    let user_agent = first.user_agent().unwrap_or_default().to_string();
    let language = first.accept_language().unwrap_or_default().to_string();

    let mut hosts: Vec<(String, u64)> = Vec::new();
    let mut host_index: HashMap<&str, usize> = HashMap::new();
    for req in sub_cluster {
        let Some(host) = req.host_header() else {
            continue;
        };
        match host_index.get(host) {
            Some(&idx) => hosts[idx].1 += 1,
            None => {
                host_index.insert(host, hosts.len());
                hosts.push((host.to_string(), 1));
            }
        }
    }

    let constant_header_fields = constant_fields(sub_cluster);

    let total_size: u64 = sub_cluster.iter().map(RequestRecord::total_size).sum();
    let avg_size = total_size as f64 / sub_cluster.len() as f64;

    let outgoing_info = match method {
        FingerprintMethod::Get => sub_cluster
            .iter()
            .map(|r| r.uri_query().len() as u64)
            .sum(),
        FingerprintMethod::Post => sub_cluster.iter().map(|r| r.request_body_len).sum(),
    };

    Some(Fingerprint {
        label,
        method,
        user_agent,
        language,
        constant_header_fields,
        hosts,
        avg_size,
        outgoing_info,
    })
}

fn constant_fields(sub_cluster: &[RequestRecord]) -> BTreeSet<String> {
    let Some(first) = sub_cluster.first() else {
        return BTreeSet::new();
    };

    let mut candidates: BTreeSet<String> = first
        .headers
        .keys()
        .filter(|name| !EXCLUDED_CONSTANT_FIELDS.contains(&name.as_str()))
        .cloned()
        .collect();

    for req in &sub_cluster[1..] {
        candidates.retain(|name| {
            req.headers
                .get(name)
                .is_some_and(|value| Some(value.as_str()) == first.headers.get(name).map(String::as_str))
        });
        if candidates.is_empty() {
            break;
        }
    }

    candidates
}

/// Per-host collection of fingerprints. Populated during training,
/// read-only during testing unless offline CSV round-tripping replaces
/// live storage entirely.
#[derive(Debug, Clone, Default)]
pub struct FingerprintStore {
    by_host: HashMap<IpAddr, Vec<Fingerprint>>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: IpAddr, fingerprint: Fingerprint) {
        self.by_host.entry(host).or_default().push(fingerprint);
    }

    pub fn fingerprints_for(&self, host: &IpAddr) -> &[Fingerprint] {
        self.by_host.get(host).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fingerprints_for_mut(&mut self, host: &IpAddr) -> &mut Vec<Fingerprint> {
        self.by_host.entry(*host).or_default()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &IpAddr> {
        self.by_host.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &Fingerprint)> {
        self.by_host
            .iter()
            .flat_map(|(host, fps)| fps.iter().map(move |fp| (host, fp)))
    }

    pub fn len(&self) -> usize {
        self.by_host.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn req(host: &str, ua: &str, uri: &str, method: Method, body_len: u64) -> RequestRecord {
        let mut headers = Map::new();
        headers.insert("host".to_string(), host.to_string());
        headers.insert("user-agent".to_string(), ua.to_string());
        headers.insert("accept".to_string(), "*/*".to_string());
        RequestRecord {
            uid: "u".into(),
            ts: Utc::now(),
            orig_ip: "10.0.0.1".parse().unwrap(),
            dest_ip: "93.184.216.34".parse().unwrap(),
            dest_port: 80,
            method,
            uri: uri.to_string(),
            version: "1.1".to_string(),
            headers,
            request_body_len: body_len,
            is_malicious: None,
        }
    }

    #[test]
    fn fingerprint_tracks_host_counts_in_first_seen_order() {
        let cluster = vec![
            req("a.example", "curl/7.68", "/x", Method::Get, 0),
            req("b.example", "curl/7.68", "/y", Method::Get, 0),
            req("a.example", "curl/7.68", "/z", Method::Get, 0),
        ];
        let fp = generate_fingerprint(&cluster, FingerprintMethod::Get, Label::Background).unwrap();
        assert_eq!(
            fp.hosts,
            vec![("a.example".to_string(), 2), ("b.example".to_string(), 1)]
        );
        assert_eq!(fp.outgoing_info, 0);
    }

    #[test]
    fn empty_subcluster_yields_no_fingerprint() {
        assert!(generate_fingerprint(&[], FingerprintMethod::Get, Label::Background).is_none());
    }

    #[test]
    fn constant_fields_excludes_first_class_headers() {
        let cluster = vec![
            req("a.example", "curl/7.68", "/x", Method::Get, 0),
            req("a.example", "curl/7.68", "/y", Method::Get, 0),
        ];
        let fp = generate_fingerprint(&cluster, FingerprintMethod::Get, Label::Background).unwrap();
        assert!(fp.constant_header_fields.contains("accept"));
        assert!(!fp.constant_header_fields.contains("host"));
        assert!(!fp.constant_header_fields.contains("user-agent"));
    }
}
