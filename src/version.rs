//! Versions and the version log.
//!
//! A version is an immutable snapshot of the live sstables, grouped per
//! level, plus the sequence of the last memtable whose flush it reflects.
//! Mutations never edit a version in place: [`Version::apply`] clones the
//! snapshot, applies the additions and deletions, and appends one delta
//! record to the version log. The fsynced delta is the linearization point
//! for every multi-file change (flush or compaction); whatever the delta
//! does not mention never happened.
//!
//! On recovery the whole log is replayed to rebuild the latest version. A
//! truncated delta at the tail is the expected residue of a crash: the log
//! is truncated back to its clean prefix and every earlier delta remains
//! authoritative.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::config::MAX_LEVELS;
use crate::error::{Error, Result};
use crate::ids::{Gen, Seq};
use crate::sstable::{self, SsTable};
use crate::wal::{version_log_path, LogIter, LogRecord, LogWriter};

/// One delta record in the version log.
///
/// ```text
/// +---------+----------+---------+----------+---------+
/// | ndel:u16| del:i64..| nadd:u16| add:i64..| seq:u64 |
/// +---------+----------+---------+----------+---------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEdit {
    pub del: Vec<Gen>,
    pub add: Vec<Gen>,
    pub seq: Seq,
}

impl LogRecord for VersionEdit {
    fn encode_into(&self, w: &mut impl Write) -> io::Result<usize> {
        w.write_u16::<BigEndian>(self.del.len() as u16)?;
        for gen in &self.del {
            w.write_i64::<BigEndian>(gen.0)?;
        }
        w.write_u16::<BigEndian>(self.add.len() as u16)?;
        for gen in &self.add {
            w.write_i64::<BigEndian>(gen.0)?;
        }
        w.write_u64::<BigEndian>(self.seq.0 as u64)?;
        Ok(self.size_on_disk())
    }

    fn decode_from(r: &mut impl Read) -> io::Result<Self> {
        let ndel = r.read_u16::<BigEndian>()? as usize;
        let mut del = Vec::with_capacity(ndel);
        for _ in 0..ndel {
            del.push(Gen(r.read_i64::<BigEndian>()?));
        }
        let nadd = r.read_u16::<BigEndian>()? as usize;
        let mut add = Vec::with_capacity(nadd);
        for _ in 0..nadd {
            add.push(Gen(r.read_i64::<BigEndian>()?));
        }
        let seq = Seq(r.read_u64::<BigEndian>()? as i64);
        Ok(Self { del, add, seq })
    }

    fn size_on_disk(&self) -> usize {
        2 + self.del.len() * 8 + 2 + self.add.len() * 8 + 8
    }
}

/// Immutable snapshot of the live sstables per level.
///
/// Within each level the handles are kept in descending generation order, so
/// the read path probes newer tables first where scopes overlap (level 0).
#[derive(Debug, Clone)]
pub struct Version {
    levels: [Vec<Arc<SsTable>>; MAX_LEVELS],
    seq: Seq,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            levels: Default::default(),
            seq: Seq(0),
        }
    }

    /// Sequence of the latest memtable whose flush this version reflects.
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Tables at one level, descending by generation.
    pub fn level_tables(&self, level: usize) -> &[Arc<SsTable>] {
        &self.levels[level]
    }

    /// All levels in probe order.
    pub fn levels(&self) -> impl Iterator<Item = &[Arc<SsTable>]> {
        self.levels.iter().map(Vec::as_slice)
    }

    /// Highest generation referenced by any level, or `Gen(0)` if empty.
    pub fn max_gen(&self) -> Gen {
        self.levels
            .iter()
            .flatten()
            .map(|table| table.gen())
            .max()
            .unwrap_or(Gen(0))
    }

    /// Returns a new version with `add` inserted and `del` removed, after
    /// durably appending the corresponding delta to the version log. `self`
    /// is not modified.
    pub fn apply(
        &self,
        log: &mut LogWriter<VersionEdit>,
        add: &[Arc<SsTable>],
        del: &[Arc<SsTable>],
        seq: Seq,
    ) -> Result<Version> {
        let edit = VersionEdit {
            del: del.iter().map(|table| table.gen()).collect(),
            add: add.iter().map(|table| table.gen()).collect(),
            seq,
        };

        let mut next = self.clone();
        for table in add {
            next.insert(table.clone());
        }
        for table in del {
            next.remove(table.level() as usize, table.gen());
        }
        next.seq = seq;

        log.append(&edit)?;
        log.sync()?;
        Ok(next)
    }

    fn insert(&mut self, table: Arc<SsTable>) {
        let tables = &mut self.levels[table.level() as usize];
        let pos = tables
            .iter()
            .position(|t| t.gen() < table.gen())
            .unwrap_or(tables.len());
        tables.insert(pos, table);
    }

    fn remove(&mut self, level: usize, gen: Gen) {
        self.levels[level].retain(|table| table.gen() != gen);
    }

    /// Multi-line dump of the levels, for diagnostic output.
    pub fn describe(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (level, tables) in self.levels.iter().enumerate() {
            let _ = writeln!(out, "Level {level}:");
            for table in tables {
                let _ = writeln!(out, "\t{}, {}", table.gen(), table.scope());
            }
        }
        let _ = writeln!(out, "Seq: {}", self.seq);
        out
    }
}

/// Rebuilds the latest version by replaying the version log in `dir`, and
/// opens the log for appending.
///
/// An incomplete delta at the tail is truncated away; everything before it
/// stands. Sstable files whose generation the final version does not
/// reference are leftovers of a flush or compaction that crashed before its
/// delta became durable, and are deleted.
pub fn load_latest(dir: &Path) -> Result<(Version, LogWriter<VersionEdit>)> {
    let path = version_log_path(dir);
    let mut version = Version::empty();

    if path.exists() {
        let mut gens = BTreeSet::new();
        let mut iter = LogIter::<VersionEdit>::open(&path)?;
        loop {
            match iter.next() {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(e),
            }
            match iter.read() {
                Ok(edit) => {
                    gens.extend(edit.add);
                    for gen in &edit.del {
                        gens.remove(gen);
                    }
                    version.seq = edit.seq;
                }
                Err(Error::Incomplete { valid }) => {
                    drop(iter);
                    truncate(&path, valid)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        for gen in &gens {
            version.insert(Arc::new(SsTable::load(dir, *gen)?));
        }
        remove_unreferenced_sstables(dir, &gens)?;
    }

    let log = LogWriter::open(&path)?;
    Ok((version, log))
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

fn remove_unreferenced_sstables(dir: &Path, live: &BTreeSet<Gen>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(gen) = sstable::gen_from_path(&path) else {
            continue;
        };
        if !live.contains(&gen) {
            tracing::warn!(gen = gen.0, "removing sstable not referenced by any version");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Record;
    use std::fs;
    use tempfile::tempdir;

    fn table(dir: &Path, gen: Gen, level: u8, keys: &[&str]) -> Arc<SsTable> {
        let records: Vec<Record> = keys
            .iter()
            .map(|key| Record::put(*key, b"value".to_vec()))
            .collect();
        Arc::new(SsTable::create(dir, gen, level, &records).unwrap())
    }

    fn version_log(dir: &Path) -> LogWriter<VersionEdit> {
        LogWriter::open(version_log_path(dir)).unwrap()
    }

    #[test]
    fn test_edit_roundtrip() {
        let edits = vec![
            VersionEdit {
                del: vec![Gen(1), Gen(2)],
                add: vec![Gen(3)],
                seq: Seq(7),
            },
            VersionEdit {
                del: vec![],
                add: vec![],
                seq: Seq(0),
            },
        ];
        for edit in edits {
            let mut buf = Vec::new();
            let n = edit.encode_into(&mut buf).unwrap();
            assert_eq!(n, buf.len());
            assert_eq!(n, edit.size_on_disk());
            let decoded = VersionEdit::decode_from(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, edit);
        }
    }

    #[test]
    fn test_apply_is_copy_on_write() {
        let dir = tempdir().unwrap();
        let mut log = version_log(dir.path());

        let t1 = table(dir.path(), Gen(1), 0, &["a", "c"]);
        let t2 = table(dir.path(), Gen(2), 0, &["b", "d"]);

        let empty = Version::empty();
        let v1 = empty
            .apply(&mut log, &[t1.clone()], &[], Seq(1))
            .unwrap();
        let v2 = v1.apply(&mut log, &[t2.clone()], &[], Seq(2)).unwrap();

        assert_eq!(empty.level_tables(0).len(), 0);
        assert_eq!(v1.level_tables(0).len(), 1);
        assert_eq!(v1.seq(), Seq(1));
        assert_eq!(v2.level_tables(0).len(), 2);
        assert_eq!(v2.seq(), Seq(2));

        let v3 = v2.apply(&mut log, &[], &[t1], Seq(2)).unwrap();
        assert_eq!(v3.level_tables(0).len(), 1);
        assert_eq!(v3.level_tables(0)[0].gen(), Gen(2));
        assert_eq!(v2.level_tables(0).len(), 2);
    }

    #[test]
    fn test_levels_are_descending_by_gen() {
        let dir = tempdir().unwrap();
        let mut log = version_log(dir.path());

        let t1 = table(dir.path(), Gen(1), 0, &["a"]);
        let t3 = table(dir.path(), Gen(3), 0, &["b"]);
        let t2 = table(dir.path(), Gen(2), 0, &["c"]);

        let version = Version::empty()
            .apply(&mut log, &[t1, t3, t2], &[], Seq(1))
            .unwrap();
        let gens: Vec<Gen> = version.level_tables(0).iter().map(|t| t.gen()).collect();
        assert_eq!(gens, vec![Gen(3), Gen(2), Gen(1)]);
        assert_eq!(version.max_gen(), Gen(3));
    }

    #[test]
    fn test_load_latest_from_empty_dir() {
        let dir = tempdir().unwrap();
        let (version, _log) = load_latest(dir.path()).unwrap();
        assert_eq!(version.seq(), Seq(0));
        assert_eq!(version.max_gen(), Gen(0));
        assert!(version_log_path(dir.path()).exists());
    }

    #[test]
    fn test_load_latest_replays_deltas() {
        let dir = tempdir().unwrap();

        let t1 = table(dir.path(), Gen(1), 0, &["a", "c"]);
        let t2 = table(dir.path(), Gen(2), 0, &["b", "d"]);
        let t3 = table(dir.path(), Gen(3), 1, &["a", "d"]);
        {
            let mut log = version_log(dir.path());
            let v = Version::empty()
                .apply(&mut log, &[t1.clone(), t2.clone()], &[], Seq(4))
                .unwrap();
            v.apply(&mut log, &[t3], &[t1, t2], Seq(4)).unwrap();
        }

        let (version, _log) = load_latest(dir.path()).unwrap();
        assert_eq!(version.seq(), Seq(4));
        assert!(version.level_tables(0).is_empty());
        let level1: Vec<Gen> = version.level_tables(1).iter().map(|t| t.gen()).collect();
        assert_eq!(level1, vec![Gen(3)]);
        // The superseded files were dropped during replay.
        assert!(!sstable::sstable_path(dir.path(), Gen(1)).exists());
        assert!(!sstable::sstable_path(dir.path(), Gen(2)).exists());
    }

    #[test]
    fn test_load_latest_truncates_incomplete_tail() {
        let dir = tempdir().unwrap();
        {
            let mut log = version_log(dir.path());
            log.append(&VersionEdit {
                del: vec![Gen(1)],
                add: vec![],
                seq: Seq(1),
            })
            .unwrap();
            log.append(&VersionEdit {
                del: vec![Gen(2)],
                add: vec![],
                seq: Seq(2),
            })
            .unwrap();
            log.sync().unwrap();
        }
        // Crash mid-append: two stray bytes after the last complete delta.
        let path = version_log_path(dir.path());
        let before = fs::metadata(&path).unwrap().len();
        {
            use std::io::Write as _;
            let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0u8, 1]).unwrap();
            file.sync_all().unwrap();
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), before + 2);

        let (version, _log) = load_latest(dir.path()).unwrap();
        assert_eq!(version.seq(), Seq(2));
        // The stray bytes are gone; the two complete deltas remain.
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn test_load_latest_removes_unreferenced_tables() {
        let dir = tempdir().unwrap();

        let referenced = table(dir.path(), Gen(1), 0, &["a"]);
        let orphan = table(dir.path(), Gen(2), 1, &["b"]);
        {
            let mut log = version_log(dir.path());
            Version::empty()
                .apply(&mut log, &[referenced], &[], Seq(1))
                .unwrap();
        }

        let (version, _log) = load_latest(dir.path()).unwrap();
        assert_eq!(version.level_tables(0).len(), 1);
        assert!(sstable::sstable_path(dir.path(), Gen(1)).exists());
        assert!(!orphan.path().exists());
    }

    #[test]
    fn test_describe_lists_levels_and_seq() {
        let dir = tempdir().unwrap();
        let mut log = version_log(dir.path());
        let t = table(dir.path(), Gen(1), 0, &["a", "b"]);
        let version = Version::empty().apply(&mut log, &[t], &[], Seq(9)).unwrap();

        let dump = version.describe();
        assert!(dump.contains("Level 0:"));
        assert!(dump.contains("1, [\"a\", \"b\"]"));
        assert!(dump.contains("Seq: 9"));
    }
}
