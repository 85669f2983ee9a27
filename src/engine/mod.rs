//! Storage: the durable log, its recovery scan and the term/vote manifest.

pub mod entry;
pub mod errors;
pub mod fault_injection;
pub mod format;
pub mod log;
pub mod manifest;
pub mod recovery;

pub use entry::{EntryKind, LogEntry, LogIndex, NewEntry, NodeId, Term};
pub use errors::{LogError, ManifestError};
pub use log::DurableLog;
pub use manifest::Manifest;
