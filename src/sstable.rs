//! Immutable on-disk sorted runs.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | data block       |  records, key-ascending, each key at most once
//! +------------------+
//! | index block      |  reserved, currently empty
//! +------------------+
//! | metadata block   |  min key, max key, each length-prefixed
//! +------------------+
//! | footer (17 bytes)|  level:u8, index_offset:u32, index_length:u32,
//! +------------------+  meta_offset:u32, meta_length:u32
//! ```
//!
//! All integers are big-endian. Loading a table touches only the footer and
//! metadata blocks; the data block is read on lookup.
//!
//! The in-memory [`SsTable`] is a handle: generation, level, key scope, and
//! the backing path. The file itself is opened per operation.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::errdata;
use crate::ids::Gen;
use crate::kv::{self, Record};
use crate::scope::Scope;

const SSTABLE_EXTENSION: &str = "sstable";

const FOOTER_SIZE: u64 = 17;

/// Path of the sstable file with the given generation.
pub fn sstable_path(dir: &Path, gen: Gen) -> PathBuf {
    dir.join(format!("{gen}.{SSTABLE_EXTENSION}"))
}

/// Parses the generation out of an sstable file name.
pub fn gen_from_path(path: &Path) -> Option<Gen> {
    if path.extension()? != SSTABLE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<i64>().ok().map(Gen)
}

/// Fixed-size trailer locating the other blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Footer {
    level: u8,
    index_offset: u32,
    index_length: u32,
    meta_offset: u32,
    meta_length: u32,
}

impl Footer {
    fn encode_into(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u8(self.level)?;
        w.write_u32::<BigEndian>(self.index_offset)?;
        w.write_u32::<BigEndian>(self.index_length)?;
        w.write_u32::<BigEndian>(self.meta_offset)?;
        w.write_u32::<BigEndian>(self.meta_length)?;
        Ok(())
    }

    fn decode_from(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            level: r.read_u8()?,
            index_offset: r.read_u32::<BigEndian>()?,
            index_length: r.read_u32::<BigEndian>()?,
            meta_offset: r.read_u32::<BigEndian>()?,
            meta_length: r.read_u32::<BigEndian>()?,
        })
    }

    /// Seeks to the trailer and decodes it.
    fn load(file: &mut File) -> Result<Self> {
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        Ok(Self::decode_from(file)?)
    }
}

fn write_len_prefixed(w: &mut impl Write, bytes: &[u8]) -> io::Result<usize> {
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(4 + bytes.len())
}

fn read_len_prefixed(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Handle to one sstable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsTable {
    gen: Gen,
    level: u8,
    scope: Scope,
    path: PathBuf,
}

impl SsTable {
    /// Writes a new sstable file from records already sorted by key, and
    /// returns its handle. Refuses to overwrite an existing file: generations
    /// are unique, so a collision means the generator went backwards.
    pub fn create(dir: &Path, gen: Gen, level: u8, records: &[Record]) -> Result<Self> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(errdata!("sstable {gen} would be empty")),
        };
        let path = sstable_path(dir, gen);
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let mut w = BufWriter::new(file);

        let mut data_len = 0u32;
        for record in records {
            data_len += record.encode_into(&mut w)? as u32;
        }

        let mut meta_len = 0u32;
        meta_len += write_len_prefixed(&mut w, first.key.as_bytes())? as u32;
        meta_len += write_len_prefixed(&mut w, last.key.as_bytes())? as u32;

        let footer = Footer {
            level,
            index_offset: data_len,
            index_length: 0,
            meta_offset: data_len,
            meta_length: meta_len,
        };
        footer.encode_into(&mut w)?;
        w.flush()?;
        w.into_inner().map_err(|e| Error::Io(e.to_string()))?.sync_all()?;

        Ok(Self {
            gen,
            level,
            scope: Scope::new(first.key.clone(), last.key.clone()),
            path,
        })
    }

    /// Rebuilds the handle for an existing file from its footer and metadata
    /// blocks. The data block is not touched.
    pub fn load(dir: &Path, gen: Gen) -> Result<Self> {
        let path = sstable_path(dir, gen);
        let mut file = File::open(&path)?;
        let footer = Footer::load(&mut file)?;

        let file_len = file.metadata()?.len();
        let expect =
            u64::from(footer.meta_offset) + u64::from(footer.meta_length) + FOOTER_SIZE;
        if file_len != expect {
            return Err(errdata!(
                "sstable {gen}: footer expects {expect} bytes, file has {file_len}"
            ));
        }

        file.seek(SeekFrom::Start(footer.meta_offset as u64))?;
        let min = String::from_utf8(read_len_prefixed(&mut file)?)
            .map_err(|e| errdata!("sstable {gen}: bad min key: {e}"))?;
        let max = String::from_utf8(read_len_prefixed(&mut file)?)
            .map_err(|e| errdata!("sstable {gen}: bad max key: {e}"))?;

        Ok(Self {
            gen,
            level: footer.level,
            scope: Scope::new(min, max),
            path,
        })
    }

    pub fn gen(&self) -> Gen {
        self.gen
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup. The outer `Option` is presence in this table; the inner
    /// one is the stored value, where `None` is a tombstone the caller must
    /// honor by stopping the search.
    pub fn get(&self, key: &str) -> Result<Option<Option<Vec<u8>>>> {
        if !self.scope.contains(key) {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        let footer = Footer::load(&mut file)?;
        file.seek(SeekFrom::Start(0))?;
        let mut r = BufReader::new(file).take(footer.index_offset as u64);

        // Records are key-ascending, so the scan can stop at the first key
        // past the target.
        while r.limit() > 0 {
            let record = Record::decode_from(&mut r)
                .map_err(|e| errdata!("sstable {}: truncated data block: {e}", self.gen))?;
            if record.key.as_str() == key {
                return Ok(Some(record.value));
            }
            if record.key.as_str() > key {
                break;
            }
        }
        Ok(None)
    }

    /// Reads the whole data block.
    pub fn records(&self) -> Result<Vec<Record>> {
        let mut file = File::open(&self.path)?;
        let footer = Footer::load(&mut file)?;
        file.seek(SeekFrom::Start(0))?;
        let mut r = BufReader::new(file.take(footer.index_offset as u64));
        kv::read_records(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::put("apple", b"red".to_vec()),
            Record::tombstone("banana"),
            Record::put("cherry", b"dark".to_vec()),
            Record::put("damson", Vec::new()),
        ]
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let created = SsTable::create(dir.path(), Gen(3), 1, &sample_records()).unwrap();
        assert_eq!(created.gen(), Gen(3));
        assert_eq!(created.level(), 1);
        assert_eq!(created.scope(), &Scope::new("apple", "damson"));

        let loaded = SsTable::load(dir.path(), Gen(3)).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        SsTable::create(dir.path(), Gen(1), 0, &sample_records()).unwrap();
        let err = SsTable::create(dir.path(), Gen(1), 0, &sample_records()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_create_refuses_empty_table() {
        let dir = tempdir().unwrap();
        assert!(SsTable::create(dir.path(), Gen(1), 0, &[]).is_err());
    }

    #[test]
    fn test_get() {
        let dir = tempdir().unwrap();
        let table = SsTable::create(dir.path(), Gen(1), 0, &sample_records()).unwrap();

        assert_eq!(table.get("apple").unwrap(), Some(Some(b"red".to_vec())));
        assert_eq!(table.get("damson").unwrap(), Some(Some(Vec::new())));
        // Tombstones are hits, not misses.
        assert_eq!(table.get("banana").unwrap(), Some(None));
        // Outside the scope.
        assert_eq!(table.get("aardvark").unwrap(), None);
        assert_eq!(table.get("elder").unwrap(), None);
        // Inside the scope but absent.
        assert_eq!(table.get("blueberry").unwrap(), None);
    }

    #[test]
    fn test_records_roundtrip() {
        let dir = tempdir().unwrap();
        let records = sample_records();
        let table = SsTable::create(dir.path(), Gen(5), 2, &records).unwrap();
        assert_eq!(table.records().unwrap(), records);
    }

    #[test]
    fn test_footer_partitions_file_exactly() {
        let dir = tempdir().unwrap();
        let records = sample_records();
        let table = SsTable::create(dir.path(), Gen(9), 3, &records).unwrap();

        let mut file = File::open(table.path()).unwrap();
        let footer = Footer::load(&mut file).unwrap();

        let data_len: usize = records.iter().map(Record::size_on_disk).sum();
        assert_eq!(footer.index_offset as usize, data_len);
        assert_eq!(footer.index_length, 0);
        assert_eq!(footer.meta_offset, footer.index_offset + footer.index_length);
        let file_len = file.metadata().unwrap().len();
        assert_eq!(
            file_len,
            u64::from(footer.meta_offset) + u64::from(footer.meta_length) + FOOTER_SIZE
        );
        assert_eq!(footer.level, 3);
    }

    #[test]
    fn test_single_record_table() {
        let dir = tempdir().unwrap();
        let records = vec![Record::put("only", b"one".to_vec())];
        let table = SsTable::create(dir.path(), Gen(2), 0, &records).unwrap();
        assert_eq!(table.scope(), &Scope::new("only", "only"));
        assert_eq!(table.get("only").unwrap(), Some(Some(b"one".to_vec())));
    }

    #[test]
    fn test_gen_from_path() {
        let dir = Path::new("/db");
        assert_eq!(gen_from_path(&sstable_path(dir, Gen(7))), Some(Gen(7)));
        assert_eq!(gen_from_path(Path::new("/db/version.wal")), None);
        assert_eq!(gen_from_path(Path::new("/db/x.sstable")), None);
    }
}
