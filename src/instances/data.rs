//! Instance data file.
//!
//! A headerless append-only heap: offsets handed out by
//! [`DataStore::append_instance`] are plain file offsets. Bytes are never
//! rewritten in place; only [`DataStore::rollback_transaction`] (truncate)
//! and [`DataStore::compact`] (rewrite) remove them.

use super::sibling_path;
use crate::error::{Result, StoreError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only byte heap backed by one file.
///
/// Not internally synchronized: callers serialize access.
pub struct DataStore {
    /// Path to the data file.
    path: PathBuf,

    /// Data file handle.
    file: File,

    /// Current file length (next append offset).
    len: u64,

    /// End of file when the open transaction began.
    checkpoint: Option<u64>,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl DataStore {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 64;

    /// Open or create a data file with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a data file, syncing every `sync_interval` appends
    /// (0 behaves like 1).
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();

        debug!(path = %path.display(), len, "opened data file");

        Ok(Self {
            path,
            file,
            len,
            checkpoint: None,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append bytes at end of file.
    ///
    /// Returns the offset the bytes were written at.
    pub fn append_instance(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len;

        self.file.seek(SeekFrom::Start(offset))?;
        let written = self.file.write_all(bytes).and_then(|_| {
            self.writes_since_sync += 1;
            if self.writes_since_sync >= self.sync_interval {
                self.file.sync_data()?;
                self.writes_since_sync = 0;
            }
            Ok(())
        });
        if let Err(e) = written {
            // Keep the heap ending at the last complete append
            let _ = self.file.set_len(offset);
            return Err(e.into());
        }
        self.len += bytes.len() as u64;

        Ok(offset)
    }

    /// Read `size` bytes at `offset`.
    pub fn load_instance(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let in_bounds = offset
            .checked_add(size)
            .map_or(false, |end| end <= self.len);
        if !in_bounds {
            return Err(StoreError::Range {
                offset,
                size,
                len: self.len,
            });
        }

        let mut buf = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read the whole file, orphaned bytes included.
    pub fn load_all_instances(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&mut self.file).take(self.len).read_to_end(&mut buf)?;

        if buf.len() as u64 != self.len {
            return Err(StoreError::Corruption(format!(
                "Data file {} shrank to {} bytes, expected {}",
                self.path.display(),
                buf.len(),
                self.len
            )));
        }
        Ok(buf)
    }

    /// Record the current end of file as the rollback point.
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.checkpoint.is_some() {
            return Err(StoreError::AlreadyOpenTransaction);
        }
        self.checkpoint = Some(self.len);
        Ok(())
    }

    /// Keep every append made since [`begin_transaction`](Self::begin_transaction).
    pub fn commit_transaction(&mut self) -> Result<()> {
        self.checkpoint
            .take()
            .ok_or(StoreError::NoOpenTransaction)?;
        Ok(())
    }

    /// Truncate the file back to the checkpoint.
    pub fn rollback_transaction(&mut self) -> Result<()> {
        let checkpoint = self.checkpoint.ok_or(StoreError::NoOpenTransaction)?;

        self.file.set_len(checkpoint)?;
        self.file.sync_data()?;

        debug!(
            path = %self.path.display(),
            discarded = self.len - checkpoint,
            "rolled back data file"
        );

        self.len = checkpoint;
        self.checkpoint = None;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Rewrite the file as the concatenation of the kept ranges, in order.
    ///
    /// `keep_flags`, `offsets` and `sizes` are parallel; ranges with a false
    /// flag are dropped and never read. Returns the new file length.
    pub fn compact(&mut self, keep_flags: &[bool], offsets: &[u64], sizes: &[u64]) -> Result<u64> {
        self.validate_plan(keep_flags, offsets, sizes)?;

        let tmp_path = sibling_path(&self.path, ".tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let new_len = match self.write_compacted(&tmp_path, keep_flags, offsets, sizes) {
            Ok(new_len) => new_len,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp_path) {
                    warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp file");
                }
                return Err(e);
            }
        };

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        debug!(
            path = %self.path.display(),
            before = self.len,
            after = new_len,
            "compacted data file"
        );

        self.len = new_len;
        self.writes_since_sync = 0;
        Ok(new_len)
    }

    /// Check that [`compact`](Self::compact) would accept a plan, without
    /// touching the file.
    pub fn validate_plan(&self, keep_flags: &[bool], offsets: &[u64], sizes: &[u64]) -> Result<()> {
        if keep_flags.len() != offsets.len() || offsets.len() != sizes.len() {
            return Err(StoreError::InvalidOperation(format!(
                "Compaction plan arrays differ in length ({}, {}, {})",
                keep_flags.len(),
                offsets.len(),
                sizes.len()
            )));
        }
        if self.checkpoint.is_some() {
            return Err(StoreError::InvalidOperation(
                "Cannot compact a data file with an open transaction".into(),
            ));
        }

        for ((&keep, &offset), &size) in keep_flags.iter().zip(offsets).zip(sizes) {
            let in_bounds = offset
                .checked_add(size)
                .map_or(false, |end| end <= self.len);
            if keep && !in_bounds {
                return Err(StoreError::Range {
                    offset,
                    size,
                    len: self.len,
                });
            }
        }

        Ok(())
    }

    /// Current file length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Path to the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    fn write_compacted(
        &mut self,
        tmp_path: &Path,
        keep_flags: &[bool],
        offsets: &[u64],
        sizes: &[u64],
    ) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(file);

        let mut written = 0u64;
        let mut buf = Vec::new();
        for ((&keep, &offset), &size) in keep_flags.iter().zip(offsets).zip(sizes) {
            if !keep {
                continue;
            }
            buf.resize(size as usize, 0);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf)?;
            writer.write_all(&buf)?;
            written += size;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok(written)
    }
}
