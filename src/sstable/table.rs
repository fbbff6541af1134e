//! SSTable file format: builder, reader, and two-level iterator.
//!
//! # File layout
//!
//! ```text
//! +-------------------+
//! | data block 0      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | data block N-1    |
//! +-------------------+
//! | index block       |
//! +-------------------+
//! | footer (16 bytes) |
//! +-------------------+
//! ```
//!
//! Data blocks store encoded internal keys as block keys with empty block
//! values (the user value is embedded in the internal key). The index
//! block maps the *largest* internal key of each data block to that
//! block's handle: a seek for target T lands on the first block whose
//! largest key is >= T, which is exactly the block that must contain the
//! answer if one exists.
//!
//! The footer is a block handle for the index block followed by the magic
//! number, both little-endian.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use super::block::{Block, BlockBuilder, BlockHandle, BlockIterator, BLOCK_HANDLE_SIZE};
use crate::error::{Error, Result};
use crate::key::{self, InternalKey, KeyType};

/// Soft target size for a data block; the block is closed after the pair
/// that first reaches it.
pub const MAX_DATA_BLOCK_SIZE: usize = 4 * 1024;

const MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;
const FOOTER_SIZE: usize = BLOCK_HANDLE_SIZE + 8;

struct Footer {
    index_handle: BlockHandle,
}

impl Footer {
    fn encode(&self) -> Vec<u8> {
        let mut data = self.index_handle.encode();
        data.write_u64::<LittleEndian>(MAGIC_NUMBER).unwrap();
        data
    }

    fn decode(data: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let index_handle = BlockHandle::decode(&data[..BLOCK_HANDLE_SIZE])?;
        let magic = u64::from_le_bytes(data[BLOCK_HANDLE_SIZE..].try_into().unwrap());
        if magic != MAGIC_NUMBER {
            return Err(Error::Corruption(format!(
                "invalid sstable magic number: {magic:#x}"
            )));
        }
        Ok(Self { index_handle })
    }
}

/// Streams sorted internal keys into a new SSTable file.
pub struct TableBuilder {
    file: File,
    file_size: u64,
    offset: u32,
    data_block: BlockBuilder,
    index_block: BlockBuilder,

    // When a data block rolls, its index entry is deferred until the next
    // add or finish so the key written is the true maximum of the closed
    // block.
    pending_index_entry: Option<BlockHandle>,
    max_key: Vec<u8>,
}

impl TableBuilder {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            file_size: 0,
            offset: 0,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            pending_index_entry: None,
            max_key: Vec::new(),
        })
    }

    /// Append an encoded internal key. Keys must arrive in ascending
    /// internal-key order. `value` stays empty for engine use.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(handle) = self.pending_index_entry.take() {
            self.index_block.add(&self.max_key, &handle.encode());
        }

        self.max_key = key.to_vec();
        self.data_block.add(key, value);

        if self.data_block.size() >= MAX_DATA_BLOCK_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the open data block, emit any pending index entry, write the
    /// index block and footer, and sync. Returns the final file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;

        if let Some(handle) = self.pending_index_entry.take() {
            self.index_block.add(&self.max_key, &handle.encode());
        }

        let index_handle = Self::write_block(
            &mut self.file,
            &mut self.index_block,
            &mut self.offset,
            &mut self.file_size,
        )?;

        let footer = Footer { index_handle };
        let footer_data = footer.encode();
        self.file.write_all(&footer_data)?;
        self.file_size += footer_data.len() as u64;

        self.file.sync_all()?;
        Ok(self.file_size)
    }

    /// Estimated output size so far; the final size is larger.
    pub fn file_size(&self) -> u64 {
        self.file_size + self.data_block.size() as u64
    }

    fn flush(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let handle = Self::write_block(
            &mut self.file,
            &mut self.data_block,
            &mut self.offset,
            &mut self.file_size,
        )?;
        self.pending_index_entry = Some(handle);
        Ok(())
    }

    fn write_block(
        file: &mut File,
        builder: &mut BlockBuilder,
        offset: &mut u32,
        file_size: &mut u64,
    ) -> Result<BlockHandle> {
        let data = builder.finish();
        file.write_all(data)?;
        *file_size += data.len() as u64;

        let handle = BlockHandle {
            offset: *offset,
            size: data.len() as u32,
        };
        *offset += handle.size;
        builder.reset();
        Ok(handle)
    }
}

/// An open, immutable SSTable. The index block is loaded once and cached
/// for the table's lifetime; data blocks are read on demand.
pub struct SSTable {
    file: File,
    path: PathBuf,
    index: Arc<Block>,
}

impl SSTable {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "sstable {} too short for footer",
                path.display()
            )));
        }

        let mut footer_data = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer_data)?;
        let footer = Footer::decode(&footer_data)?;

        let index = Arc::new(Self::read_block(&file, footer.index_handle)?);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            index,
        })
    }

    /// Probe for the freshest record visible at the lookup key.
    ///
    /// Returns `None` when this table holds no record for the user key,
    /// `Some(None)` when the freshest visible record is a tombstone, and
    /// `Some(Some(value))` otherwise.
    pub fn get(&self, lookup: &InternalKey) -> Result<Option<Option<Vec<u8>>>> {
        let mut iter = self.iter();
        iter.seek(&lookup.encode())?;
        if !iter.valid() {
            return Ok(None);
        }

        let found = InternalKey::decode(iter.key())?;
        if found.user_key != lookup.user_key {
            return Ok(None);
        }
        match found.kind {
            KeyType::Deletion => Ok(Some(None)),
            KeyType::Value => Ok(Some(Some(found.user_value))),
        }
    }

    pub fn iter(&self) -> SSTableIterator<'_> {
        SSTableIterator {
            table: self,
            index_iter: Arc::clone(&self.index).iter(key::compare),
            data_iter: None,
        }
    }

    /// Number of entries in the index block, one per data block.
    pub fn num_data_blocks(&self) -> usize {
        self.index.len()
    }

    fn read_block(file: &File, handle: BlockHandle) -> Result<Block> {
        let mut data = vec![0u8; handle.size as usize];
        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(handle.offset as u64))?;
        reader.read_exact(&mut data)?;
        Block::new(&data)
    }

    fn load_data_block(&self, handle_data: &[u8]) -> Result<BlockIterator> {
        let handle = BlockHandle::decode(handle_data)?;
        let block = Arc::new(Self::read_block(&self.file, handle)?);
        Ok(block.iter(key::compare))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Two-level cursor: an outer iterator over the index block and an inner
/// iterator over the data block the outer currently points at.
pub struct SSTableIterator<'a> {
    table: &'a SSTable,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
}

impl SSTableIterator<'_> {
    /// Position on the first entry whose key is >= `target`. `valid()` is
    /// false afterwards iff no such entry exists.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.data_iter = None;

        // The right block is the first whose largest key is >= target; the
        // previous block's largest key is < target, so the answer cannot
        // live there.
        self.index_iter.seek(target);
        if !self.index_iter.valid() {
            return Ok(());
        }

        let mut data_iter = self.table.load_data_block(self.index_iter.value())?;
        data_iter.seek(target);
        self.data_iter = Some(data_iter);
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.data_iter = None;
        self.index_iter.rewind();
        if !self.index_iter.valid() {
            return Ok(());
        }
        self.data_iter = Some(self.table.load_data_block(self.index_iter.value())?);
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.index_iter.valid()
            && self.data_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    /// Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    /// Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    /// Requires `valid()`.
    pub fn next(&mut self) -> Result<()> {
        let data_iter = self.data_iter.as_mut().unwrap();
        data_iter.next();
        if !data_iter.valid() {
            self.index_iter.next();
            if self.index_iter.valid() {
                self.data_iter = Some(self.table.load_data_block(self.index_iter.value())?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::lookup_key;

    fn build_table(path: &Path, entries: &[InternalKey]) -> u64 {
        let mut builder = TableBuilder::new(path).expect("create builder");
        for ik in entries {
            builder.add(&ik.encode(), &[]).expect("add");
        }
        builder.finish().expect("finish")
    }

    fn sorted_entries(n: usize) -> Vec<InternalKey> {
        (0..n)
            .map(|i| {
                InternalKey::new(
                    format!("key{:06}", i).as_bytes(),
                    format!("val{:06}", i).as_bytes(),
                    1,
                    KeyType::Value,
                )
            })
            .collect()
    }

    #[test]
    fn test_round_trip_multi_block() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");
        let entries = sorted_entries(2000);
        let file_size = build_table(&path, &entries);

        assert_eq!(std::fs::metadata(&path).expect("stat").len(), file_size);

        let table = SSTable::open(&path).expect("open");
        assert!(table.num_data_blocks() > 1);

        let mut iter = table.iter();
        iter.seek_to_first().expect("seek");
        for ik in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), ik.encode().as_slice());
            assert_eq!(iter.value(), b"");
            iter.next().expect("next");
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_index_has_one_entry_per_data_block() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");

        // Every entry encodes to the same size, so the block capacity is
        // uniform and the block count is predictable.
        let entries = sorted_entries(1000);
        let entry_size = entries[0].encode().len() + 8;
        let per_block = MAX_DATA_BLOCK_SIZE.div_ceil(entry_size);
        let expected_blocks = entries.len().div_ceil(per_block);

        build_table(&path, &entries);
        let table = SSTable::open(&path).expect("open");
        assert_eq!(table.num_data_blocks(), expected_blocks);
    }

    #[test]
    fn test_point_get() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");
        let entries = sorted_entries(500);
        build_table(&path, &entries);

        let table = SSTable::open(&path).expect("open");
        for (i, ik) in entries.iter().enumerate() {
            let result = table.get(&lookup_key(&ik.user_key, 1)).expect("get");
            assert_eq!(
                result,
                Some(Some(format!("val{:06}", i).into_bytes())),
                "key {i}"
            );
        }

        // Absent keys, including ones between present keys.
        assert_eq!(table.get(&lookup_key(b"key000010x", 1)).expect("get"), None);
        assert_eq!(table.get(&lookup_key(b"zzz", 1)).expect("get"), None);
    }

    #[test]
    fn test_get_sees_tombstone() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");
        let entries = vec![
            InternalKey::new(b"a", &[], 2, KeyType::Deletion),
            InternalKey::new(b"a", b"old", 1, KeyType::Value),
            InternalKey::new(b"b", b"live", 3, KeyType::Value),
        ];
        build_table(&path, &entries);

        let table = SSTable::open(&path).expect("open");
        assert_eq!(table.get(&lookup_key(b"a", 5)).expect("get"), Some(None));
        assert_eq!(
            table.get(&lookup_key(b"a", 1)).expect("get"),
            Some(Some(b"old".to_vec()))
        );
        assert_eq!(
            table.get(&lookup_key(b"b", 5)).expect("get"),
            Some(Some(b"live".to_vec()))
        );
    }

    #[test]
    fn test_seek_positions_across_blocks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");
        let entries = sorted_entries(2000);
        build_table(&path, &entries);

        let table = SSTable::open(&path).expect("open");
        let mut iter = table.iter();

        let target = lookup_key(b"key001500", u64::MAX).encode();
        iter.seek(&target).expect("seek");
        assert!(iter.valid());
        assert_eq!(
            key::decode_user_key(iter.key()),
            b"key001500".as_slice()
        );

        iter.seek(&lookup_key(b"zzz", u64::MAX).encode()).expect("seek");
        assert!(!iter.valid());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("000001.ldb");
        build_table(&path, &sorted_entries(10));

        // Corrupt the magic number in place.
        let mut data = std::fs::read(&path).expect("read");
        let len = data.len();
        data[len - 1] ^= 0xff;
        std::fs::write(&path, &data).expect("write");

        assert!(matches!(
            SSTable::open(&path),
            Err(Error::Corruption(_))
        ));
    }
}
