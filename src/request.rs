// The normalised view of one HTTP request. Everything downstream —
// the referrer graph, the label generator, fingerprint generation —
// operates on this type, never on raw log bytes.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Method as carried on the wire. Only `Get`/`Post` ever participate in
/// clustering; `Other` requests are counted at ingestion but dropped
/// before they reach a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => Method::Other,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Other => write!(f, "OTHER"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub uid: String,
    pub ts: DateTime<Utc>,
    pub orig_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub request_body_len: u64,
    pub is_malicious: Option<bool>,
}

impl RequestRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn accept_language(&self) -> Option<&str> {
        self.header("accept-language")
    }

    pub fn host_header(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn referer(&self) -> Option<&str> {
        self.header("referer").or_else(|| self.header("origin"))
    }

    /// Everything before the first `?`.
    pub fn uri_path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    /// Everything after the first `?`, or empty if there is none.
    pub fn uri_query(&self) -> &str {
        match self.uri.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }

    /// Size used by the `avg_size` fingerprint field: URI length + body
    /// length + the serialised length of every header name/value pair.
    pub fn total_size(&self) -> u64 {
        let header_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.uri.len() + header_len) as u64 + self.request_body_len
    }
}

/// Un-escapes the wire header encoding described in the external interface:
/// a comma-separated list of `name||value` pairs, with literal commas in a
/// value escaped as the four-character sequence `\x2c`. A missing or `-`
/// value, or any entry that fails to split on `||`, collapses to (or drops
/// from) the empty mapping — this mirrors the upstream parser's
/// catch-everything behaviour on malformed header strings.
pub fn parse_headers(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() || raw == "-" {
        return HashMap::new();
    }

    let mut out = HashMap::new();
    for entry in raw.split(',') {
        let mut parts = entry.splitn(2, "||");
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            return HashMap::new();
        };
        out.insert(name.to_ascii_lowercase(), value.replace("\\x2c", ","));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let parsed = parse_headers("a||1,b||2\\x2c3");
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("2,3"));
    }

    #[test]
    fn dash_is_empty() {
        assert!(parse_headers("-").is_empty());
    }

    #[test]
    fn empty_string_is_empty() {
        assert!(parse_headers("").is_empty());
    }

    #[test]
    fn malformed_entry_drops_to_empty() {
        assert!(parse_headers("no-separator-here").is_empty());
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(Method::parse("get"), Method::Get);
        assert_eq!(Method::parse("POST"), Method::Post);
        assert_eq!(Method::parse("PUT"), Method::Other);
    }
}
