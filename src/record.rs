//! Internal record types and their binary encoding.
//!
//! Every durable byte the engine writes is either a record or an index key:
//!
//! ```text
//! record:    key_len:u32 | key | lsn:u64 | val_len:u32 | value | deleted:u8
//! index key: key_len:u32 | key | lsn:u64
//! ```
//!
//! All integers are little-endian. The same record layout is used in the
//! write-ahead log payloads and in table files.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::Result;

/// A user key tagged with the log sequence number of the write that produced
/// it. Orders by user key first, then by LSN, both ascending.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaggedKey {
    pub user_key: Vec<u8>,
    pub lsn: u64,
}

impl TaggedKey {
    pub fn new(user_key: impl Into<Vec<u8>>, lsn: u64) -> Self {
        Self {
            user_key: user_key.into(),
            lsn,
        }
    }
}

/// A value carrying its tombstone flag. Tombstones have an empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedValue {
    pub value: Vec<u8>,
    pub deleted: bool,
}

impl TaggedValue {
    pub fn live(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            deleted: false,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            value: Vec::new(),
            deleted: true,
        }
    }
}

/// One internal key-value record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: TaggedKey,
    pub value: TaggedValue,
}

impl Record {
    pub fn new(key: TaggedKey, value: TaggedValue) -> Self {
        Self { key, value }
    }

    /// Size of this record in the on-disk encoding.
    pub fn encoded_len(&self) -> usize {
        4 + self.key.user_key.len() + 8 + 4 + self.value.value.len() + 1
    }
}

/// Append the record encoding to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, record: &Record) {
    buf.write_u32::<LittleEndian>(record.key.user_key.len() as u32)
        .expect("vec write is infallible");
    buf.write_all(&record.key.user_key)
        .expect("vec write is infallible");
    buf.write_u64::<LittleEndian>(record.key.lsn)
        .expect("vec write is infallible");
    buf.write_u32::<LittleEndian>(record.value.value.len() as u32)
        .expect("vec write is infallible");
    buf.write_all(&record.value.value)
        .expect("vec write is infallible");
    buf.write_u8(record.value.deleted as u8)
        .expect("vec write is infallible");
}

/// Decode one record from `buf` starting at `*pos`, advancing `*pos` past it.
/// Returns `None` without advancing when the remaining bytes do not hold a
/// complete record.
pub fn decode_record(buf: &[u8], pos: &mut usize) -> Option<Record> {
    let mut cur = *pos;

    if cur + 4 > buf.len() {
        return None;
    }
    let key_len = LittleEndian::read_u32(&buf[cur..]) as usize;
    cur += 4;
    if cur + key_len + 8 > buf.len() {
        return None;
    }
    let user_key = buf[cur..cur + key_len].to_vec();
    cur += key_len;
    let lsn = LittleEndian::read_u64(&buf[cur..]);
    cur += 8;

    if cur + 4 > buf.len() {
        return None;
    }
    let val_len = LittleEndian::read_u32(&buf[cur..]) as usize;
    cur += 4;
    if cur + val_len + 1 > buf.len() {
        return None;
    }
    let value = buf[cur..cur + val_len].to_vec();
    cur += val_len;
    let deleted = buf[cur] != 0;
    cur += 1;

    *pos = cur;
    Some(Record {
        key: TaggedKey { user_key, lsn },
        value: TaggedValue { value, deleted },
    })
}

/// Append the index-key encoding to `buf`.
pub fn encode_index_key(buf: &mut Vec<u8>, key: &TaggedKey) {
    buf.write_u32::<LittleEndian>(key.user_key.len() as u32)
        .expect("vec write is infallible");
    buf.write_all(&key.user_key)
        .expect("vec write is infallible");
    buf.write_u64::<LittleEndian>(key.lsn)
        .expect("vec write is infallible");
}

/// Decode one index key from `buf` at `*pos`, advancing `*pos` past it.
pub fn decode_index_key(buf: &[u8], pos: &mut usize) -> Result<TaggedKey> {
    let mut cur = *pos;
    if cur + 4 > buf.len() {
        return Err(crate::corruption!("truncated index key length"));
    }
    let key_len = LittleEndian::read_u32(&buf[cur..]) as usize;
    cur += 4;
    if cur + key_len + 8 > buf.len() {
        return Err(crate::corruption!("truncated index key"));
    }
    let user_key = buf[cur..cur + key_len].to_vec();
    cur += key_len;
    let lsn = LittleEndian::read_u64(&buf[cur..]);
    cur += 8;
    *pos = cur;
    Ok(TaggedKey { user_key, lsn })
}
