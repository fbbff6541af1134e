//! Sorted key/value block codec.
//!
//! A block is a sequence of length-prefixed pairs terminated by the entry
//! count, all little-endian:
//!
//! ```text
//! +------------+-----+------------+-------+-----+-------------+
//! | keyLen:u32 | key | valLen:u32 | value | ... | count:u32   |
//! +------------+-----+------------+-------+-----+-------------+
//! ```
//!
//! The count makes the block parseable in one pass and binary-searchable
//! through its iterator. Both data blocks and index blocks use this codec;
//! the iterator takes the comparator that ordered the entries, so seeks
//! agree with the writer's sort order.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::Comparator;

/// Locator of a block inside an SSTable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u32,
    pub size: u32,
}

pub const BLOCK_HANDLE_SIZE: usize = 8;

impl BlockHandle {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(BLOCK_HANDLE_SIZE);
        data.write_u32::<LittleEndian>(self.offset).unwrap();
        data.write_u32::<LittleEndian>(self.size).unwrap();
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HANDLE_SIZE {
            return Err(Error::Corruption("block handle too short".to_string()));
        }
        Ok(Self {
            offset: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(data[4..8].try_into().unwrap()),
        })
    }
}

pub struct BlockBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            count: 0,
        }
    }

    /// Append a pair. Keys must arrive in non-decreasing comparator order;
    /// this is the caller's responsibility.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.buf.write_u32::<LittleEndian>(key.len() as u32).unwrap();
        self.buf.extend_from_slice(key);
        self.buf
            .write_u32::<LittleEndian>(value.len() as u32)
            .unwrap();
        self.buf.extend_from_slice(value);
        self.count += 1;
    }

    /// Append the entry count and return the finished block bytes.
    pub fn finish(&mut self) -> &[u8] {
        self.buf.write_u32::<LittleEndian>(self.count).unwrap();
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.count = 0;
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed, immutable block.
pub struct Block {
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

impl Block {
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let count = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
        let body = &data[..data.len() - 4];

        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        let mut offset = 0usize;
        for _ in 0..count {
            let key = Self::read_slice(body, &mut offset)?;
            let value = Self::read_slice(body, &mut offset)?;
            keys.push(key);
            values.push(value);
        }
        if offset != body.len() {
            return Err(Error::Corruption("trailing bytes in block".to_string()));
        }

        Ok(Self { keys, values })
    }

    fn read_slice(body: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
        if *offset + 4 > body.len() {
            return Err(Error::Corruption("block entry truncated".to_string()));
        }
        let len = u32::from_le_bytes(body[*offset..*offset + 4].try_into().unwrap()) as usize;
        *offset += 4;
        if *offset + len > body.len() {
            return Err(Error::Corruption("block entry truncated".to_string()));
        }
        let slice = body[*offset..*offset + len].to_vec();
        *offset += len;
        Ok(slice)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(self: Arc<Self>, cmp: Comparator) -> BlockIterator {
        BlockIterator {
            block: self,
            index: 0,
            cmp,
        }
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    index: usize,
    cmp: Comparator,
}

impl BlockIterator {
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Position on the first entry whose key is >= `target`.
    /// `valid()` is false afterwards iff no such entry exists.
    pub fn seek(&mut self, target: &[u8]) {
        self.index = self
            .block
            .keys
            .partition_point(|key| (self.cmp)(key, target) == Ordering::Less);
    }

    pub fn next(&mut self) {
        self.index += 1;
    }

    /// Positions before the first entry become invalid.
    pub fn prev(&mut self) {
        if self.index == 0 {
            self.index = self.block.len();
        } else {
            self.index -= 1;
        }
    }

    pub fn valid(&self) -> bool {
        self.index < self.block.len()
    }

    /// Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        &self.block.keys[self.index]
    }

    /// Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        &self.block.values[self.index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_handle_round_trip() {
        let handle = BlockHandle {
            offset: 4096,
            size: 777,
        };
        let encoded = handle.encode();
        assert_eq!(encoded.len(), BLOCK_HANDLE_SIZE);
        assert_eq!(BlockHandle::decode(&encoded).expect("decode"), handle);
    }

    #[test]
    fn test_build_and_read_back() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key{:03}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect();

        let mut builder = BlockBuilder::new();
        for (key, value) in &entries {
            builder.add(key, value);
        }
        let block = Arc::new(Block::new(builder.finish()).expect("parse"));
        assert_eq!(block.len(), entries.len());

        let mut iter = block.iter(bytewise);
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            assert_eq!(iter.value(), value.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_is_lower_bound() {
        let mut builder = BlockBuilder::new();
        for key in [b"b".as_slice(), b"d", b"f"] {
            builder.add(key, b"x");
        }
        let block = Arc::new(Block::new(builder.finish()).expect("parse"));
        let mut iter = block.iter(bytewise);

        iter.seek(b"a");
        assert_eq!(iter.key(), b"b");
        iter.seek(b"d");
        assert_eq!(iter.key(), b"d");
        iter.seek(b"e");
        assert_eq!(iter.key(), b"f");
        iter.seek(b"g");
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_pairs_round_trip() {
        let mut builder = BlockBuilder::new();
        builder.add(b"", b"");
        builder.add(b"k", b"");
        let block = Arc::new(Block::new(builder.finish()).expect("parse"));
        assert_eq!(block.len(), 2);

        let mut iter = block.iter(bytewise);
        assert_eq!(iter.key(), b"");
        assert_eq!(iter.value(), b"");
        iter.next();
        assert_eq!(iter.key(), b"k");
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let mut builder = BlockBuilder::new();
        builder.add(b"key", b"value");
        let data = builder.finish().to_vec();

        assert!(matches!(Block::new(&[]), Err(Error::Corruption(_))));
        assert!(matches!(Block::new(&data[1..]), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_builder_reset_reuse() {
        let mut builder = BlockBuilder::new();
        builder.add(b"a", b"1");
        let first = builder.finish().to_vec();
        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"b", b"2");
        let second = builder.finish().to_vec();

        let block = Arc::new(Block::new(&second).expect("parse"));
        let mut iter = block.iter(bytewise);
        assert_eq!(iter.key(), b"b");
        assert_ne!(first, second);
    }
}
