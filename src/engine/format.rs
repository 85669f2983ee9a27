//! On-disk layout of the log file.
//!
//! ```text
//! [LogMetadata: 64 bytes][Frame 1][Frame 2]...
//! Frame = [FrameHeader: 72 bytes][payload][padding to 8 bytes]
//! ```

use crate::engine::entry::{EntryKind, LogEntry};

/// Frame header size (8-byte aligned).
pub const HEADER_SIZE: usize = 72;

/// Maximum payload size: 64 MB.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// The 72-byte frame header.
///
/// | Offset | Field           | Size |
/// |--------|-----------------|------|
/// | 0      | header_checksum | 4    |
/// | 4      | payload_size    | 4    |
/// | 8      | index           | 8    |
/// | 16     | term            | 8    |
/// | 24     | session_id      | 8    |
/// | 32     | sequence        | 8    |
/// | 40     | timestamp_ns    | 8    |
/// | 48     | payload_hash    | 16   |
/// | 64     | kind            | 1    |
/// | 65     | reserved        | 7    |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// CRC32C of bytes [4..72].
    pub header_checksum: u32,
    pub payload_size: u32,
    pub index: u64,
    pub term: u64,
    pub session_id: u64,
    pub sequence: u64,
    pub timestamp_ns: u64,
    /// Truncated BLAKE3 hash of the payload.
    pub payload_hash: [u8; 16],
    pub kind: u8,
}

impl FrameHeader {
    /// Build a checksummed header for an entry.
    pub fn for_entry(entry: &LogEntry) -> Self {
        let mut header = FrameHeader {
            header_checksum: 0,
            payload_size: entry.payload.len() as u32,
            index: entry.index,
            term: entry.term,
            session_id: entry.session_id,
            sequence: entry.sequence,
            timestamp_ns: entry.timestamp_ns,
            payload_hash: compute_payload_hash(&entry.payload),
            kind: entry.kind as u8,
        };
        header.header_checksum = header.compute_checksum();
        header
    }

    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c::crc32c(&bytes[4..])
    }

    pub fn verify_checksum(&self) -> bool {
        self.header_checksum == self.compute_checksum()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.header_checksum.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.index.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.term.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.session_id.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        bytes[48..64].copy_from_slice(&self.payload_hash);
        bytes[64] = self.kind;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut payload_hash = [0u8; 16];
        payload_hash.copy_from_slice(&bytes[48..64]);
        FrameHeader {
            header_checksum: read_u32(bytes, 0),
            payload_size: read_u32(bytes, 4),
            index: read_u64(bytes, 8),
            term: read_u64(bytes, 16),
            session_id: read_u64(bytes, 24),
            sequence: read_u64(bytes, 32),
            timestamp_ns: read_u64(bytes, 40),
            payload_hash,
            kind: bytes[64],
        }
    }

    /// Rebuild the entry once the payload has been read and verified.
    pub fn into_entry(self, payload: Vec<u8>) -> Option<LogEntry> {
        Some(LogEntry {
            index: self.index,
            term: self.term,
            kind: EntryKind::from_u8(self.kind)?,
            session_id: self.session_id,
            sequence: self.sequence,
            timestamp_ns: self.timestamp_ns,
            payload,
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Truncated BLAKE3 hash of a payload (first 16 bytes).
pub fn compute_payload_hash(payload: &[u8]) -> [u8; 16] {
    let hash = blake3::hash(payload);
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&hash.as_bytes()[..16]);
    truncated
}

/// Padding that aligns the next frame to 8 bytes.
pub fn calculate_padding(payload_size: u32) -> usize {
    (8 - (payload_size as usize % 8)) % 8
}

/// Total frame size (header + payload + padding).
pub fn frame_size(payload_size: u32) -> usize {
    HEADER_SIZE + payload_size as usize + calculate_padding(payload_size)
}

/// Serialize a complete frame.
pub fn encode_frame(entry: &LogEntry) -> Vec<u8> {
    let header = FrameHeader::for_entry(entry);
    let mut frame = Vec::with_capacity(frame_size(header.payload_size));
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&entry.payload);
    frame.resize(frame_size(header.payload_size), 0);
    frame
}

// =============================================================================
// LOG FILE METADATA HEADER
// =============================================================================

/// Metadata header size.
///
/// | Offset | Field      | Size | Description                        |
/// |--------|------------|------|------------------------------------|
/// | 0      | magic      | 4    | "RSML"                             |
/// | 4      | version    | 4    | Format version                     |
/// | 8      | base_index | 8    | Last index covered by a snapshot   |
/// | 16     | base_term  | 8    | Term of `base_index`               |
/// | 24     | checksum   | 4    | CRC32C of bytes [0..24]            |
/// | 28     | reserved   | 36   | Zeros                              |
pub const LOG_METADATA_SIZE: usize = 64;

pub const LOG_MAGIC: [u8; 4] = *b"RSML";

pub const LOG_VERSION: u32 = 1;

/// Written at offset 0 of every log file. The first frame after it has
/// index `base_index + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogMetadata {
    pub magic: [u8; 4],
    pub version: u32,
    pub base_index: u64,
    pub base_term: u64,
    pub checksum: u32,
}

impl LogMetadata {
    pub fn new(base_index: u64, base_term: u64) -> Self {
        let mut meta = LogMetadata {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            base_index,
            base_term,
            checksum: 0,
        };
        meta.checksum = meta.compute_checksum();
        meta
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32c::crc32c(&self.to_bytes()[0..24])
    }

    /// Magic, version and checksum all match.
    pub fn is_valid(&self) -> bool {
        self.magic == LOG_MAGIC && self.version == LOG_VERSION && self.checksum == self.compute_checksum()
    }

    pub fn to_bytes(&self) -> [u8; LOG_METADATA_SIZE] {
        let mut bytes = [0u8; LOG_METADATA_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.base_index.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.base_term.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; LOG_METADATA_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        LogMetadata {
            magic,
            version: read_u32(bytes, 4),
            base_index: read_u64(bytes, 8),
            base_term: read_u64(bytes, 16),
            checksum: read_u32(bytes, 24),
        }
    }
}
