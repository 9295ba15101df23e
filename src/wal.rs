//! Append-only record logs.
//!
//! One generic writer/reader pair serves both log flavors in the directory:
//! the per-memtable KV log (`<seq>.wal`) and the version log
//! (`version.wal`). Records are written back to back with no extra framing;
//! each payload knows its own size.
//!
//! A crash mid-append leaves a truncated record at the tail. Readers surface
//! that as [`Error::Incomplete`] carrying the length of the clean prefix, so
//! the caller can either truncate the file back to it (version log) or stop
//! replaying (KV log).

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::ids::Seq;
use crate::kv::Record;

const WAL_EXTENSION: &str = "wal";

/// Path of the KV log bound to the memtable with the given sequence.
pub fn kv_log_path(dir: &Path, seq: Seq) -> PathBuf {
    dir.join(format!("{seq}.{WAL_EXTENSION}"))
}

/// Path of the version log. There is exactly one per directory.
pub fn version_log_path(dir: &Path) -> PathBuf {
    dir.join(format!("version.{WAL_EXTENSION}"))
}

/// Parses the sequence out of a KV log file name. Returns `None` for the
/// version log and for names that are not `<number>.wal`.
pub fn seq_from_path(path: &Path) -> Option<Seq> {
    if path.extension()? != WAL_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<i64>().ok().map(Seq)
}

/// A payload that can be appended to and replayed from a log file.
pub trait LogRecord: Sized {
    fn encode_into(&self, w: &mut impl Write) -> io::Result<usize>;
    fn decode_from(r: &mut impl Read) -> io::Result<Self>;
    fn size_on_disk(&self) -> usize;
}

impl LogRecord for Record {
    fn encode_into(&self, w: &mut impl Write) -> io::Result<usize> {
        Record::encode_into(self, w)
    }

    fn decode_from(r: &mut impl Read) -> io::Result<Self> {
        Record::decode_from(r)
    }

    fn size_on_disk(&self) -> usize {
        Record::size_on_disk(self)
    }
}

/// Appends records to a log file. `sync` must be called to make an append
/// durable; the write path calls it after every logical record.
#[derive(Debug)]
pub struct LogWriter<T> {
    file: File,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: LogRecord> LogWriter<T> {
    /// Opens a fresh log, discarding any stale file left at the same path by
    /// an earlier epoch.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Self::open(path)
    }

    /// Opens a log in append mode, creating it if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            path,
            _marker: PhantomData,
        })
    }

    pub fn append(&mut self, record: &T) -> Result<()> {
        record.encode_into(&mut self.file)?;
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replays records from a log file in append order.
pub struct LogIter<T> {
    reader: BufReader<File>,
    valid: u64,
    _marker: PhantomData<T>,
}

impl<T: LogRecord> LogIter<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            valid: 0,
            _marker: PhantomData,
        })
    }

    /// Whether at least one more byte is present. A `true` here does not
    /// promise the next record is complete; `read` reports that.
    pub fn next(&mut self) -> Result<bool> {
        Ok(!self.reader.fill_buf()?.is_empty())
    }

    /// Decodes the next record. A record cut short by a crash surfaces as
    /// [`Error::Incomplete`] with the byte length of the clean prefix.
    pub fn read(&mut self) -> Result<T> {
        match T::decode_from(&mut self.reader) {
            Ok(record) => {
                self.valid += record.size_on_disk() as u64;
                Ok(record)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::Incomplete { valid: self.valid })
            }
            Err(e) => Err(e.into()),
        }
    }
}
