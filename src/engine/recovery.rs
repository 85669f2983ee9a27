//! Startup scan of the log file.
//!
//! Recovery has exactly three outcomes:
//! 1. Clean: every frame verifies.
//! 2. Tail repair: a torn write sits strictly at the end. It is truncated.
//! 3. Fatal: the log violates an invariant and the node refuses to start.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::engine::entry::LogEntry;
use crate::engine::errors::LogError;
use crate::engine::format::{
    compute_payload_hash, frame_size, FrameHeader, LogMetadata, HEADER_SIZE, LOG_METADATA_SIZE,
    MAX_PAYLOAD_SIZE,
};

/// How the scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No metadata header yet: a brand new log.
    Fresh,
    /// All frames verified.
    Clean,
    /// A torn tail frame was cut off.
    Truncated { truncated_at: u64, discarded_bytes: u64 },
}

/// Everything the log needs to resume appending.
#[derive(Debug)]
pub struct RecoveredLog {
    pub base_index: u64,
    pub base_term: u64,
    pub entries: Vec<LogEntry>,
    /// File offset of each entry's frame, parallel to `entries`.
    pub offsets: Vec<u64>,
    pub write_offset: u64,
    pub outcome: RecoveryOutcome,
}

/// Why a frame failed to verify. A failure is only recoverable at the tail.
#[derive(Debug, Clone, Copy)]
enum FrameFault {
    ShortHeader,
    ZeroHeader,
    HeaderChecksum,
    ShortPayload,
    PayloadHash,
}

/// Bytes scanned past a bad frame when deciding whether it is the tail.
const SCAN_AHEAD_BYTES: u64 = 1024 * 1024;

pub struct LogRecovery {
    file: File,
    file_size: u64,
}

impl LogRecovery {
    pub fn new(file: File) -> io::Result<Self> {
        let file_size = file.metadata()?.len();
        Ok(LogRecovery { file, file_size })
    }

    /// Scan and verify every frame, truncating a torn tail if present.
    pub fn scan(self) -> Result<RecoveredLog, LogError> {
        if self.file_size < LOG_METADATA_SIZE as u64 {
            // The metadata header is fsynced before any frame is written,
            // so a short file never held entries.
            return Ok(RecoveredLog {
                base_index: 0,
                base_term: 0,
                entries: Vec::new(),
                offsets: Vec::new(),
                write_offset: 0,
                outcome: RecoveryOutcome::Fresh,
            });
        }

        let mut meta_buf = [0u8; LOG_METADATA_SIZE];
        self.file.read_exact_at(&mut meta_buf, 0)?;
        let metadata = LogMetadata::from_bytes(&meta_buf);
        if !metadata.is_valid() {
            return Err(LogError::Corruption {
                offset: 0,
                reason: "invalid log metadata header".into(),
            });
        }

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut expected_index = metadata.base_index + 1;
        let mut last_term = metadata.base_term;
        let mut offset = LOG_METADATA_SIZE as u64;

        while offset < self.file_size {
            let (header, payload) = match self.read_frame(offset)? {
                Ok(frame) => frame,
                Err(fault) => {
                    let outcome = self.repair_tail(offset, expected_index, fault)?;
                    return Ok(RecoveredLog {
                        base_index: metadata.base_index,
                        base_term: metadata.base_term,
                        entries,
                        offsets,
                        write_offset: offset,
                        outcome,
                    });
                }
            };

            if header.index != expected_index {
                return Err(LogError::IndexGap {
                    expected: expected_index,
                    found: header.index,
                });
            }
            if header.term < last_term {
                return Err(LogError::TermRegression {
                    index: header.index,
                    previous: last_term,
                    found: header.term,
                });
            }
            let size = header.payload_size;
            let entry = header.into_entry(payload).ok_or_else(|| LogError::Corruption {
                offset,
                reason: format!("unknown entry kind {}", header.kind),
            })?;

            last_term = entry.term;
            expected_index += 1;
            offsets.push(offset);
            entries.push(entry);
            offset += frame_size(size) as u64;
        }

        Ok(RecoveredLog {
            base_index: metadata.base_index,
            base_term: metadata.base_term,
            entries,
            offsets,
            write_offset: offset,
            outcome: RecoveryOutcome::Clean,
        })
    }

    fn read_frame(&self, offset: u64) -> io::Result<Result<(FrameHeader, Vec<u8>), FrameFault>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = read_fully_at(&self.file, &mut header_buf, offset)?;
        if read < HEADER_SIZE {
            return Ok(Err(FrameFault::ShortHeader));
        }
        if header_buf.iter().all(|&b| b == 0) {
            return Ok(Err(FrameFault::ZeroHeader));
        }

        let header = FrameHeader::from_bytes(&header_buf);
        if !header.verify_checksum() || header.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Ok(Err(FrameFault::HeaderChecksum));
        }

        let mut payload = vec![0u8; header.payload_size as usize];
        let read = read_fully_at(&self.file, &mut payload, offset + HEADER_SIZE as u64)?;
        if read < payload.len() {
            return Ok(Err(FrameFault::ShortPayload));
        }
        if compute_payload_hash(&payload) != header.payload_hash {
            return Ok(Err(FrameFault::PayloadHash));
        }
        Ok(Ok((header, payload)))
    }

    /// A bad frame is a torn tail only if no valid frame follows it.
    fn repair_tail(
        &self,
        failure_offset: u64,
        expected_index: u64,
        fault: FrameFault,
    ) -> Result<RecoveryOutcome, LogError> {
        if self.has_valid_frame_ahead(failure_offset, expected_index)? {
            return Err(LogError::Corruption {
                offset: failure_offset,
                reason: format!("{:?} with valid frames after it", fault),
            });
        }

        self.file.set_len(failure_offset)?;
        self.file.sync_data()?;

        let discarded_bytes = self.file_size - failure_offset;
        tracing::warn!(
            offset = failure_offset,
            index = expected_index,
            discarded_bytes,
            ?fault,
            "truncated torn log tail"
        );
        Ok(RecoveryOutcome::Truncated {
            truncated_at: failure_offset,
            discarded_bytes,
        })
    }

    fn has_valid_frame_ahead(&self, start: u64, expected_min_index: u64) -> io::Result<bool> {
        let end = self.file_size.min(start + SCAN_AHEAD_BYTES);
        let mut buf = [0u8; HEADER_SIZE];
        let mut offset = start + 8;

        while offset + HEADER_SIZE as u64 <= end {
            if read_fully_at(&self.file, &mut buf, offset)? < HEADER_SIZE {
                break;
            }
            if buf.iter().any(|&b| b != 0) {
                let header = FrameHeader::from_bytes(&buf);
                if header.verify_checksum()
                    && header.index >= expected_min_index
                    && header.payload_size as usize <= MAX_PAYLOAD_SIZE
                {
                    return Ok(true);
                }
            }
            offset += 8;
        }
        Ok(false)
    }
}

/// Read as much of `buf` as the file holds at `offset`.
fn read_fully_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
