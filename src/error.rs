// Domain error surface. Anything that is a contract violation (bad mode,
// I/O failure on our own log/CSV artifacts) becomes one of these. Data
// errors (malformed log lines, missing headers) never reach here — they
// are tolerated at the ingestion boundary (§7).
//
// The original heuristic's "update recognition hit an unexpected label"
// failure mode has no equivalent here: `Label` is a closed two-valued
// enum, so an exhaustive match on it is checked at compile time rather
// than guarded at runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("file I/O failed for {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fingerprint csv row malformed: {0}")]
    FingerprintCsv(#[from] csv::Error),

    #[error("fingerprint csv row could not be decoded: {0}")]
    FingerprintDecode(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
