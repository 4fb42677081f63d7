//! Instance index file.
//!
//! ```text
//! Header:  magic "IDX\0" (4) | version u8 (1) | free_count u32 (4)
//! Record:  live u8 (1) | offset u64 (8) | size u64 (8) | key_len u32 (4)
//!          | key (key_len) | crc32(key_len ++ key) u32 (4)
//! ```
//!
//! Records are appended in creation order. Delete flips the `live` byte and
//! bumps the header free count in place; modify overwrites `offset`/`size` in
//! place. Only [`IndexStore::compact`] removes records.

use super::sibling_path;
use crate::error::{Result, StoreError};
use crate::types::{EntryList, IndexEntry, InstanceKey};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for index files.
const INDEX_MAGIC: &[u8; 4] = b"IDX\0";

/// Current index format version.
const INDEX_VERSION: u8 = 1;

/// Header size (magic + version + free count).
const HEADER_SIZE: u64 = 4 + 1 + 4;

/// Position of the free count inside the header.
const FREE_COUNT_OFFSET: u64 = 5;

/// Fixed part of a record (live + offset + size + key_len).
const RECORD_HEADER_SIZE: usize = 1 + 8 + 8 + 4;

/// Position of `offset` inside a record.
const LOCATION_OFFSET: u64 = 1;

const CHECKSUM_SIZE: usize = 4;

/// Largest key accepted, in bytes.
const MAX_KEY_LEN: usize = 64 * 1024;

const LIVE: u8 = 1;
const FREE: u8 = 0;

/// An entry and the file position of its record.
struct Slot {
    entry: IndexEntry,
    position: u64,
}

/// Ordered directory of `{key, offset, size, live}` entries backed by one file.
///
/// The whole directory is mirrored in memory; every mutation is written
/// through to the file before the mirror changes. Not internally
/// synchronized: callers serialize access.
pub struct IndexStore {
    /// Path to the index file.
    path: PathBuf,

    /// Index file handle.
    file: File,

    /// Entries in file order.
    slots: Vec<Slot>,

    /// Key -> ascending slot numbers of its live entries.
    live: HashMap<InstanceKey, Vec<usize>>,

    /// Free entries currently in the file.
    free_count: u32,

    /// End of the last complete record.
    end: u64,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl IndexStore {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 64;

    /// Open or create an index file with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create an index file, syncing every `sync_interval` writes
    /// (0 behaves like 1).
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(&header_bytes(0))?;
            file.sync_all()?;
        }

        let (stored_free, slots, end) = Self::load_records(&mut file)?;

        let file_len = file.metadata()?.len();
        if end < file_len {
            warn!(
                path = %path.display(),
                torn_bytes = file_len - end,
                "truncating incomplete record at end of index file"
            );
            file.set_len(end)?;
            file.sync_all()?;
        }

        let free_count = slots.iter().filter(|s| !s.entry.live).count() as u32;
        if free_count != stored_free {
            warn!(
                path = %path.display(),
                stored = stored_free,
                actual = free_count,
                "index free count out of date, rewriting"
            );
            write_free_count(&mut file, free_count)?;
            file.sync_all()?;
        }

        let live = build_live_map(&slots);

        debug!(
            path = %path.display(),
            entries = slots.len(),
            free = free_count,
            "opened index file"
        );

        Ok(Self {
            path,
            file,
            slots,
            live,
            free_count,
            end,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a new live entry.
    ///
    /// Does not check for an existing live entry with the same key.
    pub fn create_entry(&mut self, key: &InstanceKey, offset: u64, size: u64) -> Result<()> {
        check_range(offset, size)?;

        let entry = IndexEntry {
            key: key.clone(),
            offset,
            size,
            live: true,
        };
        let record = encode_record(&entry)?;

        self.file.seek(SeekFrom::Start(self.end))?;
        let written = self
            .file
            .write_all(&record)
            .map_err(StoreError::from)
            .and_then(|_| self.note_write());
        if let Err(e) = written {
            // Drop whatever part of the record made it to disk
            let _ = self.file.set_len(self.end);
            return Err(e);
        }

        let slot = self.slots.len();
        self.slots.push(Slot {
            entry,
            position: self.end,
        });
        self.end += record.len() as u64;
        self.live.entry(key.clone()).or_default().push(slot);

        Ok(())
    }

    /// Mark the first live entry for `key` free.
    ///
    /// Returns the new number of free entries in the file.
    pub fn delete_entry(&mut self, key: &InstanceKey) -> Result<u32> {
        let slot = self
            .first_live(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        // Header first: a count ahead of the records is reconciled on open
        let free_count = self.free_count + 1;
        write_free_count(&mut self.file, free_count)?;

        let flipped = self
            .file
            .seek(SeekFrom::Start(self.slots[slot].position))
            .and_then(|_| self.file.write_all(&[FREE]));
        if let Err(e) = flipped {
            let _ = write_free_count(&mut self.file, self.free_count);
            return Err(e.into());
        }

        self.slots[slot].entry.live = false;
        if let Some(slots) = self.live.get_mut(key) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                self.live.remove(key);
            }
        }
        self.free_count = free_count;
        self.note_write()?;

        Ok(free_count)
    }

    /// Point the first live entry for `key` at a new data range.
    ///
    /// The previous range becomes orphaned; the data file is not touched.
    /// Returns the current number of free entries.
    pub fn modify_entry(&mut self, key: &InstanceKey, offset: u64, size: u64) -> Result<u32> {
        let slot = self
            .first_live(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        self.write_location(slot, offset, size)?;
        Ok(self.free_count)
    }

    /// Point the live entry at file-order position `position` at a new range.
    ///
    /// Positions match those of [`enumerate_entries(true)`](Self::enumerate_entries).
    pub fn modify_entry_at(&mut self, position: usize, offset: u64, size: u64) -> Result<u32> {
        match self.slots.get(position) {
            Some(slot) if slot.entry.live => {}
            Some(_) => {
                return Err(StoreError::InvalidOperation(format!(
                    "Index entry {} is free",
                    position
                )))
            }
            None => {
                return Err(StoreError::InvalidOperation(format!(
                    "Index entry {} does not exist ({} entries)",
                    position,
                    self.slots.len()
                )))
            }
        }

        self.write_location(position, offset, size)?;
        Ok(self.free_count)
    }

    /// First live entry for `key` in file order.
    pub fn lookup_entry(&self, key: &InstanceKey) -> Option<&IndexEntry> {
        self.first_live(key).map(|slot| &self.slots[slot].entry)
    }

    /// All entries (or only live ones) in file order.
    pub fn enumerate_entries(&self, include_free: bool) -> EntryList {
        self.slots
            .iter()
            .map(|slot| &slot.entry)
            .filter(|entry| include_free || entry.live)
            .collect()
    }

    /// Rewrite the file keeping only live entries, in their current order.
    ///
    /// Offsets and sizes are copied unchanged; the free count becomes zero.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = sibling_path(&self.path, ".tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let (slots, end) = match self.write_compacted(&tmp_path) {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        debug!(
            path = %self.path.display(),
            before = self.slots.len(),
            after = slots.len(),
            "compacted index file"
        );

        self.live = build_live_map(&slots);
        self.slots = slots;
        self.end = end;
        self.free_count = 0;
        self.writes_since_sync = 0;

        Ok(())
    }

    /// Number of free entries in the file.
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// Number of entries, live and free.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.live.values().map(Vec::len).sum()
    }

    /// Whether any entry is live.
    pub fn has_live_entries(&self) -> bool {
        !self.live.is_empty()
    }

    /// Total size of the ranges referenced by live entries.
    pub fn live_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter(|slot| slot.entry.live)
            .map(|slot| slot.entry.size)
            .sum()
    }

    /// Path to the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    fn first_live(&self, key: &InstanceKey) -> Option<usize> {
        self.live.get(key).and_then(|slots| slots.first().copied())
    }

    fn write_location(&mut self, slot: usize, offset: u64, size: u64) -> Result<()> {
        check_range(offset, size)?;

        let mut location = [0u8; 16];
        location[..8].copy_from_slice(&offset.to_le_bytes());
        location[8..].copy_from_slice(&size.to_le_bytes());

        self.file
            .seek(SeekFrom::Start(self.slots[slot].position + LOCATION_OFFSET))?;
        self.file.write_all(&location)?;

        let entry = &mut self.slots[slot].entry;
        entry.offset = offset;
        entry.size = size;
        self.note_write()
    }

    fn write_compacted(&self, tmp_path: &Path) -> Result<(Vec<Slot>, u64)> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&header_bytes(0))?;

        let mut position = HEADER_SIZE;
        let mut slots = Vec::with_capacity(self.live_count());
        for slot in self.slots.iter().filter(|slot| slot.entry.live) {
            let record = encode_record(&slot.entry)?;
            writer.write_all(&record)?;
            slots.push(Slot {
                entry: slot.entry.clone(),
                position,
            });
            position += record.len() as u64;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok((slots, position))
    }

    fn note_write(&mut self) -> Result<()> {
        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Read header and every complete record.
    ///
    /// Returns the stored free count, the records, and the end of the last
    /// complete record (anything past it is a torn write).
    fn load_records(file: &mut File) -> Result<(u32, Vec<Slot>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.len() < HEADER_SIZE as usize {
            return Err(StoreError::InvalidFormat("Index header truncated".into()));
        }

        // Read magic
        if &buf[0..4] != INDEX_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid index magic".into()));
        }

        // Read version
        if buf[4] != INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported index version: {}",
                buf[4]
            )));
        }

        let free_count = le_u32(&buf[FREE_COUNT_OFFSET as usize..]);

        let mut slots = Vec::new();
        let mut pos = HEADER_SIZE as usize;

        while buf.len() - pos >= RECORD_HEADER_SIZE {
            let live = match buf[pos] {
                LIVE => true,
                FREE => false,
                other => {
                    return Err(StoreError::Corruption(format!(
                        "Invalid live flag {} at index offset {}",
                        other, pos
                    )))
                }
            };
            let offset = le_u64(&buf[pos + 1..]);
            let size = le_u64(&buf[pos + 9..]);
            let key_len = le_u32(&buf[pos + 17..]) as usize;

            if key_len > MAX_KEY_LEN {
                return Err(StoreError::Corruption(format!(
                    "Key length {} at index offset {} exceeds limit",
                    key_len, pos
                )));
            }

            if offset.checked_add(size).is_none() {
                return Err(StoreError::Corruption(format!(
                    "Range [{}, {}+{}) at index offset {} overflows",
                    offset, offset, size, pos
                )));
            }

            let record_len = RECORD_HEADER_SIZE + key_len + CHECKSUM_SIZE;
            if buf.len() - pos < record_len {
                break;
            }

            let key_start = pos + RECORD_HEADER_SIZE;
            let key_bytes = &buf[key_start..key_start + key_len];
            let stored_checksum = le_u32(&buf[key_start + key_len..]);
            let computed_checksum = record_checksum(key_bytes);

            if stored_checksum != computed_checksum {
                return Err(StoreError::ChecksumMismatch {
                    expected: stored_checksum,
                    got: computed_checksum,
                });
            }

            slots.push(Slot {
                entry: IndexEntry {
                    key: InstanceKey::from_utf8(key_bytes.to_vec())?,
                    offset,
                    size,
                    live,
                },
                position: pos as u64,
            });
            pos += record_len;
        }

        Ok((free_count, slots, pos as u64))
    }
}

/// Reject ranges whose end does not fit in a file offset.
fn check_range(offset: u64, size: u64) -> Result<()> {
    if offset.checked_add(size).is_none() {
        return Err(StoreError::InvalidOperation(format!(
            "Range [{}, {}+{}) overflows",
            offset, offset, size
        )));
    }
    Ok(())
}

fn header_bytes(free_count: u32) -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(INDEX_MAGIC);
    header[4] = INDEX_VERSION;
    header[5..9].copy_from_slice(&free_count.to_le_bytes());
    header
}

fn write_free_count(file: &mut File, free_count: u32) -> Result<()> {
    file.seek(SeekFrom::Start(FREE_COUNT_OFFSET))?;
    file.write_all(&free_count.to_le_bytes())?;
    Ok(())
}

fn encode_record(entry: &IndexEntry) -> Result<Vec<u8>> {
    let key = entry.key.as_bytes();
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "Key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + CHECKSUM_SIZE);
    record.push(if entry.live { LIVE } else { FREE });
    record.extend_from_slice(&entry.offset.to_le_bytes());
    record.extend_from_slice(&entry.size.to_le_bytes());
    record.extend_from_slice(&(key.len() as u32).to_le_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(&record_checksum(key).to_le_bytes());
    Ok(record)
}

fn record_checksum(key: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(key.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.finalize()
}

fn build_live_map(slots: &[Slot]) -> HashMap<InstanceKey, Vec<usize>> {
    let mut live: HashMap<InstanceKey, Vec<usize>> = HashMap::new();
    for (i, slot) in slots.iter().enumerate() {
        if slot.entry.live {
            live.entry(slot.entry.key.clone()).or_default().push(i);
        }
    }
    live
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
