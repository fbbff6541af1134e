//! The leveled file catalog.
//!
//! A `Version` is the set of SSTable files at a point in time, organized
//! into levels, plus the counters that name new files and sequence new
//! writes. Every catalog mutation (memtable flush, compaction) produces a
//! new Version that is published atomically: the encoded Version is
//! written to a fresh `MANIFEST-NNNNNN` file and the CURRENT pointer is
//! swapped to it.
//!
//! Level 0 files come straight from memtable flushes and may overlap one
//! another; point reads probe them newest-first. Files on levels 1 and up
//! are sorted by smallest key and cover disjoint user-key ranges, so a
//! binary search names the single file that can hold a key.

pub mod compaction;
pub mod merge;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::files;
use crate::key::{self, InternalKey};
use crate::memtable::Memtable;
use crate::sstable::{SSTable, TableBuilder};

pub const NUM_LEVELS: usize = 7;

/// A single SSTable file in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    /// Seeks allowed before this file becomes a compaction candidate.
    /// Persisted but not yet consulted.
    pub(crate) allow_seeks: u64,
    pub(crate) number: u64,
    pub(crate) file_size: u64,
    pub(crate) smallest: InternalKey,
    pub(crate) largest: InternalKey,
}

impl FileMetaData {
    fn encode_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.allow_seeks)?;
        w.write_u64::<LittleEndian>(self.number)?;
        w.write_u64::<LittleEndian>(self.file_size)?;
        write_prefixed_slice(w, &self.smallest.encode())?;
        write_prefixed_slice(w, &self.largest.encode())?;
        Ok(())
    }

    fn decode_from(r: &mut impl Read) -> Result<Self> {
        let allow_seeks = r.read_u64::<LittleEndian>()?;
        let number = r.read_u64::<LittleEndian>()?;
        let file_size = r.read_u64::<LittleEndian>()?;
        let smallest = InternalKey::decode(&read_prefixed_slice(r)?)?;
        let largest = InternalKey::decode(&read_prefixed_slice(r)?)?;
        Ok(Self {
            allow_seeks,
            number,
            file_size,
            smallest,
            largest,
        })
    }
}

fn write_prefixed_slice(w: &mut impl Write, data: &[u8]) -> Result<()> {
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

fn read_prefixed_slice(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

/// Counters shared between a Version and its compaction-time copies, so a
/// copy installed after background work can never hand out a sequence
/// number or file number the original already consumed.
struct Counters {
    next_file_number: AtomicU64,
    seq: AtomicU64,
}

pub struct Version {
    dir: PathBuf,
    max_file_size: u64,
    l0_compaction_trigger: usize,

    counters: Arc<Counters>,

    /// `files[0]` is unordered; higher levels are sorted by smallest key
    /// with disjoint user-key ranges.
    pub(crate) files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    /// Per-level key at which the next compaction at that level resumes.
    /// Empty until a compaction has run there.
    pub(crate) compact_pointer: [Vec<u8>; NUM_LEVELS],
}

impl Version {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            dir: config.dir.clone(),
            max_file_size: config.max_file_size,
            l0_compaction_trigger: config.l0_compaction_trigger,
            counters: Arc::new(Counters {
                next_file_number: AtomicU64::new(1),
                seq: AtomicU64::new(0),
            }),
            files: std::array::from_fn(|_| Vec::new()),
            compact_pointer: std::array::from_fn(|_| Vec::new()),
        })
    }

    /// Load a Version from the manifest named by `number`.
    pub fn load(config: &Config, number: u64) -> Result<Self> {
        let mut version = Self::new(config)?;
        let file = File::open(files::manifest_file_name(&config.dir, number))?;
        version.decode_from(&mut BufReader::new(file))?;
        Ok(version)
    }

    /// Write this Version to a new manifest file and return its number.
    /// The caller publishes it by swapping CURRENT.
    pub fn save(&self) -> Result<u64> {
        let number = self.counters.next_file_number.fetch_add(1, Ordering::SeqCst);
        let path = files::manifest_file_name(&self.dir, number);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        self.encode_to(&mut writer)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.to_string()))?
            .sync_all()?;
        Ok(number)
    }

    fn encode_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.counters.next_file_number.load(Ordering::SeqCst))?;
        w.write_u64::<LittleEndian>(self.counters.seq.load(Ordering::SeqCst))?;
        for level in 0..NUM_LEVELS {
            w.write_u32::<LittleEndian>(self.files[level].len() as u32)?;
            for meta in &self.files[level] {
                meta.encode_to(w)?;
            }
        }
        Ok(())
    }

    fn decode_from(&mut self, r: &mut impl Read) -> Result<()> {
        let next_file_number = r.read_u64::<LittleEndian>()?;
        let seq = r.read_u64::<LittleEndian>()?;
        self.counters = Arc::new(Counters {
            next_file_number: AtomicU64::new(next_file_number),
            seq: AtomicU64::new(seq),
        });
        for level in 0..NUM_LEVELS {
            let count = r.read_u32::<LittleEndian>()? as usize;
            let mut metas = Vec::with_capacity(count);
            for _ in 0..count {
                metas.push(Arc::new(FileMetaData::decode_from(r)?));
            }
            self.files[level] = metas;
        }
        Ok(())
    }

    /// Bump and return the next write sequence number.
    pub fn next_seq(&self) -> u64 {
        self.counters.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest sequence number handed out.
    pub fn seq(&self) -> u64 {
        self.counters.seq.load(Ordering::SeqCst)
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub(crate) fn next_file_number(&self) -> u64 {
        self.counters.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Shallow copy for background compaction: file metadata and counters
    /// are shared, the level arrays are cloned.
    pub fn copy(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            max_file_size: self.max_file_size,
            l0_compaction_trigger: self.l0_compaction_trigger,
            counters: Arc::clone(&self.counters),
            files: self.files.clone(),
            compact_pointer: self.compact_pointer.clone(),
        }
    }

    /// Register a file in the catalog.
    pub(crate) fn add_file(&mut self, level: usize, meta: Arc<FileMetaData>) {
        tracing::debug!(
            level,
            file = meta.number,
            smallest = %String::from_utf8_lossy(&meta.smallest.user_key),
            largest = %String::from_utf8_lossy(&meta.largest.user_key),
            "adding file to level"
        );

        if level == 0 {
            // Level 0 files come from memtable flushes and overlap; no
            // order is maintained.
            self.files[0].push(meta);
        } else {
            let encoded = meta.smallest.encode();
            let idx = self.files[level]
                .partition_point(|f| key::compare(&f.smallest.encode(), &encoded).is_lt());
            self.files[level].insert(idx, meta);
        }
    }

    pub(crate) fn delete_file(&mut self, level: usize, number: u64) {
        self.files[level].retain(|f| f.number != number);
    }

    /// Flush a sealed memtable into a new level-0 SSTable.
    pub fn write_level0_table(&mut self, imm: &Memtable) -> Result<()> {
        let index = imm.index();
        let mut iter = index.iter();
        iter.seek_to_first();
        if !iter.valid() {
            return Ok(());
        }

        let number = self.next_file_number();
        let path = files::sstable_file_name(&self.dir, number);
        let mut builder = TableBuilder::new(&path)?;

        let smallest = InternalKey::decode(iter.key())?;
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = InternalKey::decode(iter.key())?;
            builder.add(iter.key(), &[])?;
            iter.next();
        }
        let file_size = builder.finish()?;

        tracing::info!(file = number, file_size, "flushed memtable to level 0");
        self.add_file(
            0,
            Arc::new(FileMetaData {
                allow_seeks: 0,
                number,
                file_size,
                smallest,
                largest,
            }),
        );
        Ok(())
    }

    /// Point lookup across the leveled catalog.
    ///
    /// Returns `None` when no level holds a record for the user key,
    /// `Some(None)` when the freshest visible record is a tombstone, and
    /// `Some(Some(value))` otherwise.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<Option<Option<Vec<u8>>>> {
        let lookup = key::lookup_key(user_key, seq);

        // Level 0 files overlap, so every file whose range covers the key
        // is a candidate and must be probed newest-first: a fresher flush
        // has a larger file number and shadows older ones.
        let mut candidates: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                user_key >= f.smallest.user_key.as_slice()
                    && user_key <= f.largest.user_key.as_slice()
            })
            .collect();
        candidates.sort_by(|a, b| b.number.cmp(&a.number));

        for meta in candidates {
            if let Some(result) = self.open_table(meta)?.get(&lookup)? {
                return Ok(Some(result));
            }
        }

        // Higher levels hold disjoint ranges; binary search names the one
        // file that can contain the key. Lower levels hold fresher data,
        // so the first hit wins.
        for level in 1..NUM_LEVELS {
            let level_files = &self.files[level];
            if level_files.is_empty() {
                continue;
            }

            let idx =
                level_files.partition_point(|f| f.largest.user_key.as_slice() < user_key);
            if idx == level_files.len() {
                continue;
            }

            if let Some(result) = self.open_table(&level_files[idx])?.get(&lookup)? {
                return Ok(Some(result));
            }
        }

        Ok(None)
    }

    pub(crate) fn open_table(&self, meta: &FileMetaData) -> Result<SSTable> {
        SSTable::open(&files::sstable_file_name(&self.dir, meta.number))
    }

    /// File numbers referenced by this Version.
    pub(crate) fn live_files(&self) -> std::collections::HashSet<u64> {
        self.files
            .iter()
            .flat_map(|level| level.iter().map(|f| f.number))
            .collect()
    }

    /// One-line level occupancy summary for logs.
    pub(crate) fn levels_summary(&self) -> String {
        let counts: Vec<String> = self
            .files
            .iter()
            .map(|level| level.len().to_string())
            .collect();
        format!("[{}]", counts.join(" "))
    }
}
