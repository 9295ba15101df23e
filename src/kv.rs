//! Key-value record codec.
//!
//! A record is one key paired with either a value or a tombstone. Deletes are
//! stored, not elided: a key removed from the memtable must still shadow an
//! older value sitting in a deeper sstable, so the delete itself is written
//! as a record whose value is the tombstone marker.
//!
//! On disk a record is:
//!
//! ```text
//! +-------------+-------+---------------+-------+
//! | key_len:u32 | key   | value_len:u32 | value |
//! +-------------+-------+---------------+-------+
//! ```
//!
//! All integers are big-endian. A tombstone is encoded with
//! `value_len = 0xFFFF_FFFF` and no value bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, BufRead, Read, Write};

use crate::error::Result;

/// Value length marking a deleted key.
pub const TOMBSTONE_LEN: u32 = u32::MAX;

/// A single key-value pair. `value` of `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Number of bytes this record occupies on disk.
    pub fn size_on_disk(&self) -> usize {
        size_on_disk(&self.key, self.value.as_deref())
    }

    /// Writes the record and returns the number of bytes written.
    pub fn encode_into(&self, w: &mut impl Write) -> io::Result<usize> {
        w.write_u32::<BigEndian>(self.key.len() as u32)?;
        w.write_all(self.key.as_bytes())?;
        match &self.value {
            Some(value) => {
                w.write_u32::<BigEndian>(value.len() as u32)?;
                w.write_all(value)?;
            }
            None => w.write_u32::<BigEndian>(TOMBSTONE_LEN)?,
        }
        Ok(self.size_on_disk())
    }

    /// Reads one record.
    ///
    /// Callers are expected to check for end-of-stream before calling, so any
    /// EOF seen here means the record was cut short; it surfaces as
    /// `ErrorKind::UnexpectedEof` for the caller to classify.
    pub fn decode_from(r: &mut impl Read) -> io::Result<Self> {
        let key_len = r.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        r.read_exact(&mut key)?;
        let key = String::from_utf8(key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let value_len = r.read_u32::<BigEndian>()?;
        if value_len == TOMBSTONE_LEN {
            return Ok(Self { key, value: None });
        }
        let mut value = vec![0u8; value_len as usize];
        r.read_exact(&mut value)?;
        Ok(Self {
            key,
            value: Some(value),
        })
    }
}

/// On-disk size of a record with the given key and value. Tombstones carry no
/// value bytes but still pay the length field.
pub fn size_on_disk(key: &str, value: Option<&[u8]>) -> usize {
    4 + key.len() + 4 + value.map_or(0, <[u8]>::len)
}

/// Reads records until the reader is exhausted.
///
/// Used for sstable data blocks, whose length is known in advance; a record
/// cut short here means the file disagrees with its own footer.
pub fn read_records(r: &mut impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    while !r.fill_buf()?.is_empty() {
        let record = Record::decode_from(r)
            .map_err(|e| crate::errdata!("truncated record in data block: {e}"))?;
        records.push(record);
    }
    Ok(records)
}
