use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the durable log.
///
/// `Corruption` and `IndexGap` found during recovery are fatal: the node
/// refuses to start rather than serve a log whose history it cannot trust.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum or structural failure that is not a torn tail.
    #[error("log corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    /// Appended or recovered index does not follow the previous one.
    #[error("index gap: expected {expected}, found {found}")]
    IndexGap { expected: u64, found: u64 },

    /// Term went backwards along the log.
    #[error("term regression at index {index}: {previous} -> {found}")]
    TermRegression { index: u64, previous: u64, found: u64 },

    #[error("entry {index} not found (last index {last_index})")]
    NotFound { index: u64, last_index: u64 },

    #[error("entry {index} was compacted (log starts after {base_index})")]
    Compacted { index: u64, base_index: u64 },

    /// Truncating at or below the commit floor would erase committed history.
    #[error("refusing to truncate from {index}: entries through {commit_index} are committed")]
    TruncateCommitted { index: u64, commit_index: u64 },

    #[error("refusing to compact through {index}: only {commit_index} is committed")]
    CompactBeyondCommit { index: u64, commit_index: u64 },

    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("log directory {0} is not usable")]
    BadDirectory(PathBuf),
}

/// Errors raised by the term/vote metadata record.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest corrupted: {0}")]
    Corrupted(&'static str),

    /// A different vote was already durably cast in this term.
    #[error("already voted for {voted_for} in term {term}, refusing vote for {requested}")]
    AlreadyVoted {
        term: u64,
        voted_for: u32,
        requested: u32,
    },

    #[error("term regression: current {current}, requested {requested}")]
    TermRegression { current: u64, requested: u64 },
}

impl LogError {
    /// True for errors that come from the storage device rather than from a
    /// caller asking for something illegal.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, LogError::Io(_) | LogError::Corruption { .. })
    }
}
