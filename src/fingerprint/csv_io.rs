// On-disk CSV round-trip for Fingerprints: one row per fingerprint, a
// header row, stable column order. List-valued fields are packed into a
// single cell with `;` as an internal delimiter — disjoint from the CSV
// dialect's own comma/quote handling, so no field ever needs quoting
// because of our own encoding.

use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::fingerprint::{Fingerprint, FingerprintMethod, FingerprintStore, Label};

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    host: String,
    label: String,
    method: String,
    user_agent: String,
    language: String,
    constant_header_fields: String,
    hosts: String,
    avg_size: f64,
    outgoing_info: u64,
}

fn to_row(host: IpAddr, fp: &Fingerprint) -> Row {
    Row {
        host: host.to_string(),
        label: fp.label.to_string(),
        method: fp.method.to_string(),
        user_agent: fp.user_agent.clone(),
        language: fp.language.clone(),
        constant_header_fields: fp.constant_header_fields.iter().cloned().collect::<Vec<_>>().join(";"),
        hosts: fp
            .hosts
            .iter()
            .map(|(h, c)| format!("{h}:{c}"))
            .collect::<Vec<_>>()
            .join(";"),
        avg_size: fp.avg_size,
        outgoing_info: fp.outgoing_info,
    }
}

fn from_row(row: Row) -> Result<(IpAddr, Fingerprint)> {
    let host: IpAddr = row
        .host
        .parse()
        .map_err(|_| DomainError::FingerprintDecode(format!("bad host IP: {}", row.host)))?;

    let label = Label::from_str(&row.label).map_err(DomainError::FingerprintDecode)?;
    let method = FingerprintMethod::from_str(&row.method).map_err(DomainError::FingerprintDecode)?;

    let constant_header_fields = if row.constant_header_fields.is_empty() {
        Default::default()
    } else {
        row.constant_header_fields.split(';').map(String::from).collect()
    };

    let hosts = if row.hosts.is_empty() {
        Vec::new()
    } else {
        row.hosts
            .split(';')
            .filter_map(|pair| {
                let (h, c) = pair.split_once(':')?;
                Some((h.to_string(), c.parse().ok()?))
            })
            .collect()
    };

    Ok((
        host,
        Fingerprint {
            label,
            method,
            user_agent: row.user_agent,
            language: row.language,
            constant_header_fields,
            hosts,
            avg_size: row.avg_size,
            outgoing_info: row.outgoing_info,
        },
    ))
}

/// Appends every fingerprint currently in `store` to `path`, writing a
/// header row only if the file does not already exist.
pub fn dump_fingerprints(path: &Path, store: &FingerprintStore) -> Result<()> {
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DomainError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);

    for (host, fp) in store.iter() {
        writer.serialize(to_row(*host, fp))?;
    }
    writer.flush().map_err(|source| DomainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Appends a single fingerprint to `path` — used by the testing-mode
/// offline path, which dumps one row per drained fingerprint as it is
/// produced rather than batching a whole store.
pub fn append_fingerprint(path: &Path, host: IpAddr, fp: &Fingerprint) -> Result<()> {
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DomainError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer.serialize(to_row(host, fp))?;
    writer.flush().map_err(|source| DomainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Loads every row of `path` into a fresh store, merging into `store` if
/// one is supplied. Files are expected to have been written by
/// [`dump_fingerprints`] or [`append_fingerprint`].
pub fn load_fingerprints(path: &Path, store: &mut FingerprintStore) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|source| DomainError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut reader = csv::Reader::from_reader(file);
    for record in reader.deserialize::<Row>() {
        let row = record?;
        let (host, fp) = from_row(row)?;
        store.insert(host, fp);
    }
    Ok(())
}
