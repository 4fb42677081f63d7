//! Space reclamation for an index/data file pair.
//!
//! Live entries keep their relative order and are packed from offset zero:
//! each one's new offset is the sum of the sizes of the live entries before
//! it. The index is pointed at the new offsets first, then the data file is
//! rewritten, then free index entries are dropped.

use crate::error::Result;
use crate::instances::{DataStore, IndexStore};
use crate::types::{EntryList, InstanceKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A live entry whose offset changes during compaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Position in the full entry list.
    pub position: usize,
    pub key: InstanceKey,
    pub old_offset: u64,
    pub new_offset: u64,
    pub size: u64,
}

/// What a compaction would do, computed without touching either file.
#[derive(Clone, Debug)]
pub struct CompactionPlan {
    /// Full entry list, free entries included, in file order.
    pub entries: EntryList,

    /// Live entries that move.
    pub relocations: Vec<Relocation>,

    /// Data file length now.
    pub bytes_before: u64,

    /// Data file length afterwards.
    pub bytes_after: u64,
}

impl CompactionPlan {
    /// Bytes the data file would shrink by.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Free entries that would be dropped from the index.
    pub fn free_entries(&self) -> usize {
        self.entries.free_count()
    }

    /// Whether running the plan would change anything.
    pub fn is_noop(&self) -> bool {
        self.relocations.is_empty() && self.free_entries() == 0 && self.reclaimable_bytes() == 0
    }
}

/// Outcome of one compaction run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub entries_before: u64,
    pub entries_after: u64,
    pub freed_entries: u64,
    pub relocated_entries: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionStats {
    /// Bytes removed from the data file.
    pub fn reclaimed_bytes(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Compacts one index/data pair.
///
/// Holds both stores mutably for its lifetime, so nothing else can touch the
/// pair while it runs.
pub struct Compactor<'a> {
    index: &'a mut IndexStore,
    data: &'a mut DataStore,
}

impl<'a> Compactor<'a> {
    pub fn new(index: &'a mut IndexStore, data: &'a mut DataStore) -> Self {
        Self { index, data }
    }

    /// Enumerate entries and compute every surviving entry's new offset.
    pub fn plan(&self) -> CompactionPlan {
        let entries = self.index.enumerate_entries(true);

        let mut relocations = Vec::new();
        let mut next_offset = 0u64;
        for (position, entry) in entries.iter().enumerate() {
            if !entry.live {
                continue;
            }
            if entry.offset != next_offset {
                relocations.push(Relocation {
                    position,
                    key: entry.key,
                    old_offset: entry.offset,
                    new_offset: next_offset,
                    size: entry.size,
                });
            }
            next_offset = next_offset.saturating_add(entry.size);
        }

        CompactionPlan {
            entries,
            relocations,
            bytes_before: self.data.len(),
            bytes_after: next_offset,
        }
    }

    /// Compact both files.
    pub fn run(self) -> Result<CompactionStats> {
        let plan = self.plan();
        let entries_before = plan.entries.len() as u64;

        // Refuse before any index offset moves
        self.data.validate_plan(
            &plan.entries.live_flags,
            &plan.entries.offsets,
            &plan.entries.sizes,
        )?;

        // Point live entries at their post-compaction offsets
        for relocation in &plan.relocations {
            self.index
                .modify_entry_at(relocation.position, relocation.new_offset, relocation.size)?;
        }
        debug!(
            relocated = plan.relocations.len(),
            "updated index offsets for compaction"
        );

        // Rewrite data using the offsets the plan was computed from
        let bytes_after = self.data.compact(
            &plan.entries.live_flags,
            &plan.entries.offsets,
            &plan.entries.sizes,
        )?;

        self.index.compact()?;

        let stats = CompactionStats {
            entries_before,
            entries_after: self.index.len() as u64,
            freed_entries: plan.free_entries() as u64,
            relocated_entries: plan.relocations.len() as u64,
            bytes_before: plan.bytes_before,
            bytes_after,
        };

        info!(
            index = %self.index.path().display(),
            entries_before = stats.entries_before,
            entries_after = stats.entries_after,
            reclaimed_bytes = stats.reclaimed_bytes(),
            "compacted instance files"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_pair(dir: &TempDir) -> (IndexStore, DataStore) {
        let index = IndexStore::open(dir.path().join("test.idx")).unwrap();
        let data = DataStore::open(dir.path().join("test.instances")).unwrap();
        (index, data)
    }

    fn put(index: &mut IndexStore, data: &mut DataStore, key: &str, bytes: &[u8]) {
        let offset = data.append_instance(bytes).unwrap();
        index
            .create_entry(&InstanceKey::new(key), offset, bytes.len() as u64)
            .unwrap();
    }

    fn read(index: &IndexStore, data: &mut DataStore, key: &str) -> Vec<u8> {
        let entry = index.lookup_entry(&InstanceKey::new(key)).unwrap().clone();
        data.load_instance(entry.offset, entry.size).unwrap()
    }

    #[test]
    fn test_plan_prefix_sums() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "a", b"AAAA");
        put(&mut index, &mut data, "b", b"BB");
        put(&mut index, &mut data, "c", b"CCC");
        index.delete_entry(&InstanceKey::new("a")).unwrap();

        let plan = Compactor::new(&mut index, &mut data).plan();

        assert_eq!(plan.bytes_before, 9);
        assert_eq!(plan.bytes_after, 5);
        assert_eq!(plan.reclaimable_bytes(), 4);
        assert_eq!(plan.free_entries(), 1);

        let moves: Vec<_> = plan
            .relocations
            .iter()
            .map(|r| (r.key.as_str().to_string(), r.old_offset, r.new_offset))
            .collect();
        assert_eq!(
            moves,
            vec![("b".to_string(), 4, 0), ("c".to_string(), 6, 2)]
        );

        // Planning has no side effects
        assert_eq!(index.free_count(), 1);
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn test_run_preserves_live_content() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "a", b"AAAAAAAA");
        put(&mut index, &mut data, "b", b"BBBBBBBB");
        put(&mut index, &mut data, "c", b"CCCCCCCC");
        index.delete_entry(&InstanceKey::new("b")).unwrap();

        let stats = Compactor::new(&mut index, &mut data).run().unwrap();

        assert_eq!(stats.entries_before, 3);
        assert_eq!(stats.entries_after, 2);
        assert_eq!(stats.freed_entries, 1);
        assert_eq!(stats.relocated_entries, 1);
        assert_eq!(stats.reclaimed_bytes(), 8);

        assert_eq!(data.load_all_instances().unwrap(), b"AAAAAAAACCCCCCCC");
        assert_eq!(read(&index, &mut data, "a"), b"AAAAAAAA");
        assert_eq!(read(&index, &mut data, "c"), b"CCCCCCCC");
        assert_eq!(index.free_count(), 0);
    }

    #[test]
    fn test_run_drops_orphans_from_modify() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "a", b"old-a");
        put(&mut index, &mut data, "b", b"bbb");

        let offset = data.append_instance(b"new-a!").unwrap();
        index.modify_entry(&InstanceKey::new("a"), offset, 6).unwrap();

        Compactor::new(&mut index, &mut data).run().unwrap();

        // Index order decides data order: a was created first
        assert_eq!(data.load_all_instances().unwrap(), b"new-a!bbb");
        assert_eq!(read(&index, &mut data, "a"), b"new-a!");
        assert_eq!(read(&index, &mut data, "b"), b"bbb");
    }

    #[test]
    fn test_run_with_duplicate_live_keys() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "x", b"1111");
        put(&mut index, &mut data, "dup", b"first");
        put(&mut index, &mut data, "dup", b"second");
        index.delete_entry(&InstanceKey::new("x")).unwrap();

        Compactor::new(&mut index, &mut data).run().unwrap();

        let all = index.enumerate_entries(true);
        assert_eq!(all.offsets, vec![0, 5]);
        assert_eq!(all.sizes, vec![5, 6]);
        assert_eq!(data.load_instance(0, 5).unwrap(), b"first");
        assert_eq!(data.load_instance(5, 6).unwrap(), b"second");
    }

    #[test]
    fn test_run_on_empty_pair() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        let compactor = Compactor::new(&mut index, &mut data);
        assert!(compactor.plan().is_noop());

        let stats = compactor.run().unwrap();
        assert_eq!(stats, CompactionStats::default());
        assert!(index.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    fn test_failed_run_leaves_index_untouched() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "a", b"AAAA");
        put(&mut index, &mut data, "b", b"BBBB");
        put(&mut index, &mut data, "c", b"CCCC");
        index.delete_entry(&InstanceKey::new("a")).unwrap();

        // "c" points past the end of the data file
        index.modify_entry(&InstanceKey::new("c"), 12, 4).unwrap();
        let before = index.enumerate_entries(true);

        let result = Compactor::new(&mut index, &mut data).run();
        assert!(matches!(
            result,
            Err(crate::error::StoreError::Range { offset: 12, size: 4, len: 12 })
        ));

        assert_eq!(index.enumerate_entries(true), before);
        assert_eq!(read(&index, &mut data, "b"), b"BBBB");
        assert_eq!(data.load_all_instances().unwrap(), b"AAAABBBBCCCC");
    }

    #[test]
    fn test_run_refused_during_transaction() {
        let dir = TempDir::new().unwrap();
        let (mut index, mut data) = open_pair(&dir);

        put(&mut index, &mut data, "a", b"AAAA");
        put(&mut index, &mut data, "b", b"BBBB");
        index.delete_entry(&InstanceKey::new("a")).unwrap();
        data.begin_transaction().unwrap();

        assert!(Compactor::new(&mut index, &mut data).run().is_err());
        assert_eq!(index.lookup_entry(&InstanceKey::new("b")).unwrap().offset, 4);
        assert_eq!(index.free_count(), 1);
    }
}
