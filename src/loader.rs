// Turns lines of an input log file into Request records (§10.1). Each
// line is one JSON object carrying the fields of §3, with `headers`
// delivered as the raw `name||value,...` encoded string described in §6
// rather than as a nested JSON object — this mirrors the upstream
// tabular log format the header encoding was designed for.

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::error::{DomainError, Result};
use crate::request::{parse_headers, Method, RequestRecord};

#[derive(Debug, Deserialize)]
struct RawLine {
    uid: Option<String>,
    ts: Option<f64>,
    orig_ip: Option<IpAddr>,
    dest_ip: Option<IpAddr>,
    dest_port: Option<u16>,
    method: Option<String>,
    uri: Option<String>,
    version: Option<String>,
    headers: Option<String>,
    request_body_len: Option<u64>,
    is_malicious: Option<bool>,
}

/// Reads one JSON object per line. A line whose JSON is malformed, or
/// whose `method`/`ts` is absent, is skipped with a single logged
/// warning — consistent with §7's "malformed input is tolerated
/// silently" policy applied at the boundary where raw bytes become
/// structured data. A blank line is skipped without a warning. The
/// returned records are sorted by timestamp, since the Aggregator
/// requires a chronologically ordered stream.
///
/// File I/O runs on the async runtime for convenience; the Aggregator
/// consumes the resulting `Vec` synchronously once loading is complete.
pub async fn load_requests(path: &Path) -> Result<Vec<RequestRecord>> {
    let file = tokio::fs::File::open(path).await.map_err(|source| DomainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut lines = BufReader::new(file).lines();

    let mut records = Vec::new();
    let mut lineno = 0usize;
    loop {
        let line = lines.next_line().await.map_err(|source| DomainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(line) = line else { break };
        lineno += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(record) => records.push(record),
            None => warn!(line = lineno, path = %path.display(), "skipping malformed request record"),
        }
    }

    records.sort_by_key(|r| r.ts);
    Ok(records)
}

fn parse_line(line: &str) -> Option<RequestRecord> {
    let raw: RawLine = serde_json::from_str(line).ok()?;
    let method = raw.method?;
    let ts = timestamp_from_epoch(raw.ts?)?;

    Some(RequestRecord {
        uid: raw.uid.unwrap_or_default(),
        ts,
        orig_ip: raw.orig_ip?,
        dest_ip: raw.dest_ip?,
        dest_port: raw.dest_port.unwrap_or(0),
        method: Method::parse(&method),
        uri: raw.uri.unwrap_or_default(),
        version: raw.version.unwrap_or_default(),
        headers: raw.headers.as_deref().map(parse_headers).unwrap_or_default(),
        request_body_len: raw.request_body_len.unwrap_or(0),
        is_malicious: raw.is_malicious,
    })
}

fn timestamp_from_epoch(epoch_seconds: f64) -> Option<DateTime<Utc>> {
    let secs = epoch_seconds.trunc() as i64;
    let nanos = (epoch_seconds.fract() * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(secs, nanos)
}
