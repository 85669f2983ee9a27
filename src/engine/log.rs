//! The durable replicated log.
//!
//! One file per node, opened with `O_DSYNC` so a frame is on stable storage
//! when the write returns. All entries after the compaction base are also
//! held in memory; the file is only read back during recovery.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::engine::entry::{LogEntry, LogIndex, NewEntry, Term};
use crate::engine::errors::LogError;
use crate::engine::fault_injection::FaultInjector;
use crate::engine::format::{encode_frame, LogMetadata, LOG_METADATA_SIZE, MAX_PAYLOAD_SIZE};
use crate::engine::manifest::sync_parent_dir;
use crate::engine::recovery::{LogRecovery, RecoveryOutcome};

pub const LOG_FILE_NAME: &str = "log";

pub struct DurableLog {
    path: PathBuf,
    file: File,
    /// Offset where the next frame is written.
    write_offset: u64,
    /// Last index covered by a snapshot. Entries start at `base_index + 1`.
    base_index: LogIndex,
    base_term: Term,
    entries: VecDeque<LogEntry>,
    /// Frame offset of each entry, parallel to `entries`.
    offsets: VecDeque<u64>,
    /// Highest index known committed. Truncation at or below it is refused.
    commit_floor: LogIndex,
    faults: FaultInjector,
    /// Durable frame writes, for tests.
    write_count: u64,
}

impl DurableLog {
    /// Open (recovering) or create the log inside `dir`.
    pub fn open(dir: &Path) -> Result<(Self, RecoveryOutcome), LogError> {
        if !dir.is_dir() {
            return Err(LogError::BadDirectory(dir.to_path_buf()));
        }
        let path = dir.join(LOG_FILE_NAME);
        let file = open_dsync(&path)?;
        let recovered = LogRecovery::new(file.try_clone()?)?.scan()?;

        let mut log = DurableLog {
            path,
            file,
            write_offset: recovered.write_offset,
            base_index: recovered.base_index,
            base_term: recovered.base_term,
            entries: recovered.entries.into(),
            offsets: recovered.offsets.into(),
            commit_floor: recovered.base_index,
            faults: FaultInjector::default(),
            write_count: 0,
        };

        if recovered.outcome == RecoveryOutcome::Fresh {
            log.file.set_len(0)?;
            log.file
                .write_all_at(&LogMetadata::new(0, 0).to_bytes(), 0)?;
            sync_parent_dir(&log.path)?;
            log.write_offset = LOG_METADATA_SIZE as u64;
        }

        tracing::debug!(
            path = %log.path.display(),
            base_index = log.base_index,
            last_index = log.last_index(),
            outcome = ?recovered.outcome,
            "opened log"
        );
        Ok((log, recovered.outcome))
    }

    pub fn set_fault_injector(&mut self, faults: FaultInjector) {
        self.faults = faults;
    }

    /// Append a new entry at `last_index() + 1`. Durable on return.
    pub fn append(&mut self, entry: NewEntry) -> Result<LogIndex, LogError> {
        let index = self.last_index() + 1;
        self.append_entry(entry.with_index(index))?;
        Ok(index)
    }

    /// Append an entry that already carries its index (follower replication).
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::IndexGap {
                expected,
                found: entry.index,
            });
        }
        if entry.term < self.last_term() {
            return Err(LogError::TermRegression {
                index: entry.index,
                previous: self.last_term(),
                found: entry.term,
            });
        }
        if entry.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LogError::PayloadTooLarge {
                size: entry.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let frame = encode_frame(&entry);
        if let Err(e) = self.write_frame(&frame) {
            // Drop whatever part of the frame reached the file so a later
            // append does not leave garbage behind a shorter frame.
            if let Err(truncate_error) = self.file.set_len(self.write_offset) {
                tracing::warn!(
                    offset = self.write_offset,
                    error = %truncate_error,
                    "failed to drop partial frame"
                );
            }
            return Err(e.into());
        }

        self.offsets.push_back(self.write_offset);
        self.write_offset += frame.len() as u64;
        self.entries.push_back(entry);
        self.write_count += 1;
        Ok(())
    }

    /// Merge a leader's entries into the log.
    ///
    /// Entries already present with the same term are skipped. The first
    /// entry whose term differs truncates the local suffix from its index;
    /// the rest are appended. Entries at or below the compaction base are
    /// ignored. Returns the number of entries written.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> Result<usize, LogError> {
        let mut written = 0;
        for entry in entries {
            if entry.index <= self.base_index {
                continue;
            }
            if entry.index <= self.last_index() {
                if self.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                self.truncate_from(entry.index)?;
            }
            self.append_entry(entry.clone())?;
            written += 1;
        }
        Ok(written)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.faults.check_write()?;
        self.file.write_all_at(frame, self.write_offset)
    }

    /// Entry at `index`.
    pub fn get(&self, index: LogIndex) -> Result<&LogEntry, LogError> {
        if index <= self.base_index {
            return Err(LogError::Compacted {
                index,
                base_index: self.base_index,
            });
        }
        self.entries
            .get((index - self.base_index - 1) as usize)
            .ok_or(LogError::NotFound {
                index,
                last_index: self.last_index(),
            })
    }

    /// Term of the entry at `index`. Index 0 and the compaction base are
    /// known even though no entry is stored for them.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.get(index).ok().map(|e| e.term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start <= self.base_index || start > self.last_index() {
            return Vec::new();
        }
        let skip = (start - self.base_index - 1) as usize;
        self.entries.iter().skip(skip).take(max).cloned().collect()
    }

    /// Iterate over entries in `(from, to]`.
    pub fn iter_range(&self, from: LogIndex, to: LogIndex) -> impl Iterator<Item = &LogEntry> {
        let start = from.max(self.base_index);
        let skip = (start - self.base_index) as usize;
        let take = to.saturating_sub(start) as usize;
        self.entries.iter().skip(skip).take(take)
    }

    /// Discard every entry at or after `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<(), LogError> {
        if index <= self.commit_floor {
            return Err(LogError::TruncateCommitted {
                index,
                commit_index: self.commit_floor,
            });
        }
        if index > self.last_index() {
            return Ok(());
        }

        let keep = (index - self.base_index - 1) as usize;
        let cut_at = self.offsets[keep];
        self.file.set_len(cut_at)?;
        self.file.sync_data()?;

        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        self.offsets.truncate(keep);
        self.write_offset = cut_at;
        tracing::debug!(from = index, removed, "truncated log suffix");
        Ok(())
    }

    /// Drop entries at or below `through_index`. They must already be
    /// committed and covered by a snapshot.
    pub fn compact(&mut self, through_index: LogIndex) -> Result<(), LogError> {
        if through_index <= self.base_index {
            return Ok(());
        }
        if through_index > self.commit_floor {
            return Err(LogError::CompactBeyondCommit {
                index: through_index,
                commit_index: self.commit_floor,
            });
        }
        let base_term = self.term_at(through_index).ok_or(LogError::NotFound {
            index: through_index,
            last_index: self.last_index(),
        })?;
        let drop = (through_index - self.base_index) as usize;
        let retained: Vec<LogEntry> = self.entries.iter().skip(drop).cloned().collect();
        self.rewrite(through_index, base_term, retained)
    }

    /// Install a snapshot covering `(.., index]` with `term` at `index`.
    ///
    /// If the log already holds that entry the suffix after it is kept;
    /// otherwise the whole log is discarded.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) -> Result<(), LogError> {
        self.commit_floor = self.commit_floor.max(index);
        if index <= self.base_index {
            return Ok(());
        }
        if self.term_at(index) == Some(term) {
            return self.compact(index);
        }
        self.rewrite(index, term, Vec::new())
    }

    /// Rewrite the file with a new base and the given entries, atomically.
    fn rewrite(
        &mut self,
        base_index: LogIndex,
        base_term: Term,
        retained: Vec<LogEntry>,
    ) -> Result<(), LogError> {
        let tmp_path = self.path.with_extension("compact");
        let mut offsets = VecDeque::with_capacity(retained.len());
        let mut offset = LOG_METADATA_SIZE as u64;
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&LogMetadata::new(base_index, base_term).to_bytes())?;
            for entry in &retained {
                let frame = encode_frame(entry);
                tmp.write_all(&frame)?;
                offsets.push_back(offset);
                offset += frame.len() as u64;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        self.file = open_dsync(&self.path)?;
        self.write_offset = offset;
        self.base_index = base_index;
        self.base_term = base_term;
        self.entries = retained.into();
        self.offsets = offsets;

        tracing::info!(base_index, base_term, retained = self.entries.len(), "compacted log");
        Ok(())
    }

    #[inline]
    pub fn last_index(&self) -> LogIndex {
        self.base_index + self.entries.len() as u64
    }

    #[inline]
    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    /// First index still stored.
    #[inline]
    pub fn first_index(&self) -> LogIndex {
        self.base_index + 1
    }

    #[inline]
    pub fn base_index(&self) -> LogIndex {
        self.base_index
    }

    #[inline]
    pub fn base_term(&self) -> Term {
        self.base_term
    }

    #[inline]
    pub fn commit_floor(&self) -> LogIndex {
        self.commit_floor
    }

    /// Raise the commit floor. It never moves backwards.
    pub fn set_commit_floor(&mut self, index: LogIndex) {
        self.commit_floor = self.commit_floor.max(index.min(self.last_index()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_dsync(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .custom_flags(libc::O_DSYNC)
        .open(path)
}
