//! Durable `{current_term, voted_for}` record.
//!
//! Every update goes through write-tmp, fdatasync, rename, fsync-dir so a
//! crash leaves either the old record or the new one, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::engine::errors::ManifestError;

/// Manifest file magic bytes: "RSMM".
pub const MANIFEST_MAGIC: [u8; 4] = *b"RSMM";

pub const MANIFEST_VERSION: u32 = 1;

/// Manifest file size (64 bytes, cache-line aligned).
pub const MANIFEST_SIZE: usize = 64;

/// Sentinel for "no vote cast".
pub const NO_VOTE: u32 = u32::MAX;

/// Durable election state.
///
/// | Offset | Field        | Size |
/// |--------|--------------|------|
/// | 0      | magic        | 4    |
/// | 4      | version      | 4    |
/// | 8      | current_term | 8    |
/// | 16     | voted_for    | 4    |
/// | 20     | reserved     | 12   |
/// | 32     | checksum     | 4    |  CRC32C of bytes [0..32]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableState {
    pub current_term: u64,
    /// Node voted for in `current_term`, `NO_VOTE` if none.
    pub voted_for: u32,
}

impl Default for DurableState {
    fn default() -> Self {
        DurableState {
            current_term: 0,
            voted_for: NO_VOTE,
        }
    }
}

impl DurableState {
    pub fn to_bytes(&self) -> [u8; MANIFEST_SIZE] {
        let mut bytes = [0u8; MANIFEST_SIZE];
        bytes[0..4].copy_from_slice(&MANIFEST_MAGIC);
        bytes[4..8].copy_from_slice(&MANIFEST_VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.current_term.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.voted_for.to_le_bytes());
        let checksum = crc32c::crc32c(&bytes[0..32]);
        bytes[32..36].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Returns None if magic, version or checksum do not match.
    pub fn from_bytes(bytes: &[u8; MANIFEST_SIZE]) -> Option<Self> {
        if bytes[0..4] != MANIFEST_MAGIC {
            return None;
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != MANIFEST_VERSION {
            return None;
        }
        let stored = u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        if stored != crc32c::crc32c(&bytes[0..32]) {
            return None;
        }

        let mut term = [0u8; 8];
        term.copy_from_slice(&bytes[8..16]);
        Some(DurableState {
            current_term: u64::from_le_bytes(term),
            voted_for: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }

    pub fn voted_for(&self) -> Option<u32> {
        (self.voted_for != NO_VOTE).then_some(self.voted_for)
    }

    /// Rejects a second, different vote in the same term.
    pub fn check_vote_fence(&self, term: u64, candidate: u32) -> Result<(), ManifestError> {
        if term < self.current_term {
            return Err(ManifestError::TermRegression {
                current: self.current_term,
                requested: term,
            });
        }
        if term == self.current_term && self.voted_for != NO_VOTE && self.voted_for != candidate {
            return Err(ManifestError::AlreadyVoted {
                term,
                voted_for: self.voted_for,
                requested: candidate,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    state: DurableState,
}

impl Manifest {
    /// Load the manifest at `path`, or create an empty one.
    pub fn open(path: &Path) -> Result<Self, ManifestError> {
        if path.exists() {
            let mut file = File::open(path)?;
            let mut bytes = [0u8; MANIFEST_SIZE];
            file.read_exact(&mut bytes)?;
            let state = DurableState::from_bytes(&bytes)
                .ok_or(ManifestError::Corrupted("invalid magic, version or checksum"))?;
            Ok(Manifest {
                path: path.to_path_buf(),
                state,
            })
        } else {
            let manifest = Manifest {
                path: path.to_path_buf(),
                state: DurableState::default(),
            };
            manifest.persist(&manifest.state)?;
            Ok(manifest)
        }
    }

    #[inline]
    pub fn state(&self) -> &DurableState {
        &self.state
    }

    #[inline]
    pub fn current_term(&self) -> u64 {
        self.state.current_term
    }

    #[inline]
    pub fn voted_for(&self) -> Option<u32> {
        self.state.voted_for()
    }

    /// Move to a higher term, clearing the vote. Lower or equal terms are a no-op.
    pub fn advance_term(&mut self, term: u64) -> Result<bool, ManifestError> {
        if term <= self.state.current_term {
            return Ok(false);
        }
        let next = DurableState {
            current_term: term,
            voted_for: NO_VOTE,
        };
        self.persist(&next)?;
        self.state = next;
        Ok(true)
    }

    /// Durably record a vote. The in-memory state only changes once the
    /// record is on disk.
    pub fn record_vote(&mut self, term: u64, candidate: u32) -> Result<(), ManifestError> {
        self.state.check_vote_fence(term, candidate)?;
        if term == self.state.current_term && self.state.voted_for == candidate {
            return Ok(());
        }
        let next = DurableState {
            current_term: term,
            voted_for: candidate,
        };
        self.persist(&next)?;
        self.state = next;
        Ok(())
    }

    fn persist(&self, state: &DurableState) -> Result<(), ManifestError> {
        atomic_write(&self.path, &state.to_bytes())?;
        Ok(())
    }
}

/// Replace `path` with `bytes` using write-tmp, fdatasync, rename, fsync-dir.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(bytes)?;
        // SAFETY: fdatasync on a valid, open file descriptor.
        if unsafe { libc::fdatasync(tmp.as_raw_fd()) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)
}

/// fsync the directory holding `path` so a rename is durable.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = File::open(parent)?;
    // SAFETY: fsync on a valid, open directory descriptor.
    if unsafe { libc::fsync(dir.as_raw_fd()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
