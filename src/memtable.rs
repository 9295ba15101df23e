//! In-memory write buffer.
//!
//! A memtable is an ordered map over a concurrent skip list, paired with the
//! append-only KV log that makes its contents durable. Every mutation is
//! appended to the log and fsynced before it becomes visible in the map, so
//! the log is always a superset of what readers can observe.
//!
//! Each memtable is bound to one sequence number for its whole life; the
//! sequence doubles as the log's file name. Once sealed, a memtable accepts
//! no further mutations and waits to be persisted as a level-0 sstable.

use crossbeam_skiplist::SkipMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::ids::{Gen, Seq};
use crate::kv::Record;
use crate::sstable::SsTable;
use crate::wal::{kv_log_path, LogWriter};

pub struct Memtable {
    data: SkipMap<String, Option<Vec<u8>>>,
    wal: Mutex<Option<LogWriter<Record>>>,
    wal_path: PathBuf,
    seq: Seq,
    size: AtomicUsize,
    capacity: usize,
    sealed: AtomicBool,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("seq", &self.seq)
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("capacity", &self.capacity)
            .field("sealed", &self.sealed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Memtable {
    /// Creates an empty memtable with a fresh KV log in `dir`.
    pub fn create(dir: &Path, seq: Seq, capacity: usize) -> Result<Self> {
        let wal_path = kv_log_path(dir, seq);
        let wal = LogWriter::create(&wal_path)?;
        Ok(Self {
            data: SkipMap::new(),
            wal: Mutex::new(Some(wal)),
            wal_path,
            seq,
            size: AtomicUsize::new(0),
            capacity,
            sealed: AtomicBool::new(false),
        })
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Inserts or updates a key.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.insert(Record::put(key, value.to_vec()))
    }

    /// Deletes a key by storing a tombstone. The tombstone must be written
    /// like any other record: silently dropping the key would unmask an
    /// older value in some deeper sstable.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.insert(Record::tombstone(key))
    }

    fn insert(&self, record: Record) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let size = record.size_on_disk();

        // The log entry must be on stable storage before the map insert
        // makes the mutation observable.
        let mut wal = self.wal.lock().unwrap();
        let writer = wal.as_mut().ok_or(Error::ReadOnly)?;
        writer.append(&record)?;
        writer.sync()?;

        self.data.insert(record.key, record.value);
        self.size.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    /// Point lookup. The outer `Option` is presence; the inner one is the
    /// stored value, where `None` is a tombstone.
    pub fn get(&self, key: &str) -> Option<Option<Vec<u8>>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Whether the inserted bytes have reached capacity.
    pub fn is_full(&self) -> bool {
        self.size.load(Ordering::SeqCst) >= self.capacity
    }

    /// Marks the memtable read-only.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Closes the KV log, rejecting any further mutations.
    pub fn close_wal(&self) -> Result<()> {
        if let Some(mut writer) = self.wal.lock().unwrap().take() {
            writer.sync()?;
        }
        Ok(())
    }

    /// Writes the memtable out as a level-0 sstable at the given generation.
    /// Seals the memtable and closes its log first.
    pub fn persist(&self, dir: &Path, gen: Gen) -> Result<SsTable> {
        self.seal();
        self.close_wal()?;

        let records: Vec<Record> = self
            .data
            .iter()
            .map(|entry| Record {
                key: entry.key().clone(),
                value: entry.value().clone(),
            })
            .collect();
        SsTable::create(dir, gen, 0, &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::size_on_disk;
    use crate::wal::LogIter;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let mem = Memtable::create(dir.path(), Seq(1), 1 << 20).unwrap();

        mem.put("key1", b"value1").unwrap();
        mem.put("key2", b"value2").unwrap();
        mem.remove("key3").unwrap();

        assert_eq!(mem.get("key1"), Some(Some(b"value1".to_vec())));
        assert_eq!(mem.get("key2"), Some(Some(b"value2".to_vec())));
        assert_eq!(mem.get("key3"), Some(None));
        assert_eq!(mem.get("key4"), None);

        mem.remove("key1").unwrap();
        assert_eq!(mem.get("key1"), Some(None));
    }

    #[test]
    fn test_every_mutation_reaches_the_log() {
        let dir = tempdir().unwrap();
        let mem = Memtable::create(dir.path(), Seq(1), 1 << 20).unwrap();

        mem.put("key1", b"value1").unwrap();
        mem.remove("key1").unwrap();
        mem.put("key1", b"value2").unwrap();

        let mut iter = LogIter::<Record>::open(mem.wal_path()).unwrap();
        let mut logged = Vec::new();
        while iter.next().unwrap() {
            logged.push(iter.read().unwrap());
        }
        assert_eq!(
            logged,
            vec![
                Record::put("key1", b"value1".to_vec()),
                Record::tombstone("key1"),
                Record::put("key1", b"value2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_is_full_counts_on_disk_bytes() {
        let dir = tempdir().unwrap();
        let record_size = size_on_disk("key1", Some(b"value1"));
        let mem = Memtable::create(dir.path(), Seq(1), 2 * record_size).unwrap();

        mem.put("key1", b"value1").unwrap();
        assert!(!mem.is_full());
        mem.put("key2", b"value2").unwrap();
        assert!(mem.is_full());
    }

    #[test]
    fn test_sealed_rejects_writes() {
        let dir = tempdir().unwrap();
        let mem = Memtable::create(dir.path(), Seq(1), 1 << 20).unwrap();
        mem.put("key1", b"value1").unwrap();

        mem.seal();
        assert_eq!(mem.put("key2", b"value2"), Err(Error::ReadOnly));
        assert_eq!(mem.remove("key1"), Err(Error::ReadOnly));
        // Reads still work.
        assert_eq!(mem.get("key1"), Some(Some(b"value1".to_vec())));
    }

    #[test]
    fn test_persist_writes_sorted_level0_table() {
        let dir = tempdir().unwrap();
        let mem = Memtable::create(dir.path(), Seq(1), 1 << 20).unwrap();

        // Insert out of order.
        mem.put("key4", b"value4").unwrap();
        mem.put("key3", b"value3").unwrap();
        mem.put("key1", b"value1").unwrap();
        mem.put("key2", b"value2").unwrap();
        mem.remove("key2").unwrap();

        let table = mem.persist(dir.path(), Gen(1)).unwrap();
        assert_eq!(table.gen(), Gen(1));
        assert_eq!(table.level(), 0);
        assert_eq!(
            table.records().unwrap(),
            vec![
                Record::put("key1", b"value1".to_vec()),
                Record::tombstone("key2"),
                Record::put("key3", b"value3".to_vec()),
                Record::put("key4", b"value4".to_vec()),
            ]
        );

        // Persisting seals the memtable.
        assert_eq!(mem.put("key5", b"value5"), Err(Error::ReadOnly));
    }
}
