//! Fault injection for storage tests.
//!
//! Two kinds of faults:
//! - `FaultInjector`: a live switch that makes `DurableLog` appends fail,
//!   standing in for a disk that starts returning EIO.
//! - `append_faulted_frame`: writes a damaged frame at the end of a closed
//!   log file, simulating a crash in the middle of a write.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::entry::LogEntry;
use crate::engine::format::{encode_frame, HEADER_SIZE};

/// Shape of the damage written by `append_faulted_frame`.
#[derive(Debug, Clone, Copy)]
pub enum FaultMode {
    /// Only the header reaches the disk.
    HeaderOnly,
    /// Header plus the first `n` payload bytes.
    PartialPayload(usize),
    /// Full frame with a flipped bit in the header.
    CorruptHeaderCrc,
    /// Full frame with a flipped bit in the payload.
    CorruptPayload,
}

/// Shared switch that fails log appends while armed.
#[derive(Clone, Debug, Default)]
pub struct FaultInjector {
    fail_writes: Arc<AtomicBool>,
    injected: Arc<AtomicU64>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Number of writes that were failed on purpose.
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Returns an error if writes are currently failing.
    pub(crate) fn check_write(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(())
    }
}

/// Append a damaged frame for `entry` to the log file at `path`.
pub fn append_faulted_frame(path: &Path, entry: &LogEntry, mode: FaultMode) -> io::Result<()> {
    let mut frame = encode_frame(entry);
    match mode {
        FaultMode::HeaderOnly => frame.truncate(HEADER_SIZE),
        FaultMode::PartialPayload(n) => {
            frame.truncate(HEADER_SIZE + n.min(entry.payload.len()));
        }
        FaultMode::CorruptHeaderCrc => frame[10] ^= 0x01,
        FaultMode::CorruptPayload => {
            if frame.len() > HEADER_SIZE {
                frame[HEADER_SIZE] ^= 0xFF;
            }
        }
    }

    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&frame)?;
    file.sync_all()
}
