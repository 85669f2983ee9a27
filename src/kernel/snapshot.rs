use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::engine::manifest::atomic_write;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Snapshot file magic bytes: "SNAP"
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x4E, 0x41, 0x50];

pub const SNAPSHOT_VERSION: u16 = 1;

pub const SNAPSHOT_HEADER_SIZE: usize = 64;

pub const SNAPSHOT_FILE_NAME: &str = "snapshot";

// =============================================================================
// SNAPSHOT FILE
// =============================================================================

/// A point-in-time image of the executor, covering the log through
/// `last_included_index`.
///
/// # Layout (64 bytes header + variable state)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("SNAP")
/// 4       2     version
/// 6       2     reserved
/// 8       8     last_included_index
/// 16      8     last_included_term
/// 24      8     state_size
/// 32      4     state_checksum (CRC32C)
/// 36      4     header_checksum (CRC32C of bytes 0..36)
/// 40      24    reserved (zero)
/// 64      var   state payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotFile {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Encoded executor image.
    pub state: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("snapshot header checksum mismatch: stored {expected:#x}, computed {actual:#x}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    #[error("snapshot state checksum mismatch: stored {expected:#x}, computed {actual:#x}")]
    StateChecksumMismatch { expected: u32, actual: u32 },

    #[error("snapshot file too small for header")]
    FileTooSmall,

    #[error("snapshot state size mismatch: header says {expected}, found {actual}")]
    StateSizeMismatch { expected: u64, actual: usize },

    #[error("snapshot encoding error: {0}")]
    Encoding(String),
}

impl SnapshotFile {
    pub fn new(last_included_index: u64, last_included_term: u64, state: Vec<u8>) -> Self {
        SnapshotFile {
            last_included_index,
            last_included_term,
            state,
        }
    }

    fn header(&self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
        header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4..6].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&self.last_included_index.to_le_bytes());
        header[16..24].copy_from_slice(&self.last_included_term.to_le_bytes());
        header[24..32].copy_from_slice(&(self.state.len() as u64).to_le_bytes());
        header[32..36].copy_from_slice(&crc32c::crc32c(&self.state).to_le_bytes());
        let header_checksum = crc32c::crc32c(&header[0..36]);
        header[36..40].copy_from_slice(&header_checksum.to_le_bytes());
        header
    }

    /// Header followed by state, as written to disk.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + self.state.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.state);
        bytes
    }

    /// Save atomically. No partial snapshot is ever visible at `path`.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        atomic_write(path, &self.to_bytes())?;
        Ok(())
    }

    /// Load and validate. Any checksum or size mismatch is an error.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// `Ok(None)` when no snapshot has been taken yet.
    pub fn load_if_present(path: &Path) -> Result<Option<Self>, SnapshotError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return Err(SnapshotError::FileTooSmall);
        }
        let header = &bytes[..SNAPSHOT_HEADER_SIZE];
        if header[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let stored = read_u32(header, 36);
        let computed = crc32c::crc32c(&header[0..36]);
        if stored != computed {
            return Err(SnapshotError::HeaderChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let last_included_index = read_u64(header, 8);
        let last_included_term = read_u64(header, 16);
        let state_size = read_u64(header, 24);
        let state = &bytes[SNAPSHOT_HEADER_SIZE..];
        if state.len() as u64 != state_size {
            return Err(SnapshotError::StateSizeMismatch {
                expected: state_size,
                actual: state.len(),
            });
        }

        let stored = read_u32(header, 32);
        let computed = crc32c::crc32c(state);
        if stored != computed {
            return Err(SnapshotError::StateChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        Ok(SnapshotFile {
            last_included_index,
            last_included_term,
            state: state.to_vec(),
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

// =============================================================================
// TESTS
// =============================================================================
