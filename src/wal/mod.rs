//! Write-ahead log: durable, replayable append-only storage of opaque
//! payloads.
//!
//! A WAL is a directory of segment files named `%016d.seg`. Exactly one
//! segment is active and receives appends; when an append would push the
//! active segment past the configured size, a new segment with the next id
//! becomes active. Each payload is framed into CRC-protected chunks inside
//! 32KiB physical blocks (see [`segment`]).
//!
//! With `sync` enabled every append is fsynced before returning; a failed
//! sync truncates the segment back to the pre-write position so the
//! on-disk state never contains an unacknowledged record.

pub mod segment;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub use segment::{ChunkPosition, ChunkType, SegmentId, BLOCK_SIZE, CHUNK_HEADER_SIZE};
use segment::{segment_file_name, Segment, SegmentReader};

const INITIAL_SEGMENT_ID: SegmentId = 1;

/// WAL options.
#[derive(Debug, Clone)]
pub struct Options {
    pub dir: PathBuf,

    /// Size cap of one segment file.
    pub segment_size: u64,

    /// Fsync after every payload. Disabling improves throughput but loses
    /// durability: payloads reach the OS buffer cache only.
    pub sync: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./wal"),
            segment_size: 1 << 30,
            sync: true,
        }
    }
}

impl Options {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}

pub struct Wal {
    segments: BTreeMap<SegmentId, Segment>,
    active_id: SegmentId,
    options: Options,
    closed: bool,
}

impl Wal {
    /// Open the WAL directory, picking up existing segments. The segment
    /// with the highest id becomes the append target.
    pub fn open(options: Options) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;

        let mut ids: Vec<SegmentId> = Vec::new();
        for entry in fs::read_dir(&options.dir)? {
            let entry = entry?;
            if let Some(id) = parse_segment_file_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }

        let mut segments = BTreeMap::new();
        let active_id = if ids.is_empty() {
            let seg = Segment::open(&options.dir, INITIAL_SEGMENT_ID, true)?;
            segments.insert(INITIAL_SEGMENT_ID, seg);
            INITIAL_SEGMENT_ID
        } else {
            ids.sort_unstable();
            let last = *ids.last().unwrap();
            for id in ids {
                let seg = Segment::open(&options.dir, id, id == last)?;
                segments.insert(id, seg);
            }
            last
        };

        Ok(Self {
            segments,
            active_id,
            options,
            closed: false,
        })
    }

    /// Append one payload. Returns the position of its first chunk.
    pub fn write(&mut self, data: &[u8]) -> Result<ChunkPosition> {
        if self.closed {
            return Err(Error::Closed);
        }

        if self.is_full(data.len() as u64) {
            self.cycle()?;
        }

        let sync = self.options.sync;
        let active = self
            .segments
            .get_mut(&self.active_id)
            .expect("active segment always present");
        let pos = active.write(data)?;

        if sync {
            if let Err(err) = active.sync() {
                // The written chunk is not durable; roll the segment back
                // to the pre-write state before reporting.
                tracing::warn!(segment = pos.segment_id, error = %err, "wal sync failed, truncating");
                active.truncate(pos.block_number, pos.block_offset)?;
                return Err(err);
            }
        }

        Ok(pos)
    }

    /// Random-access read of the payload at `pos`.
    pub fn read(&self, pos: &ChunkPosition) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::Closed);
        }
        let segment = self
            .segments
            .get(&pos.segment_id)
            .ok_or_else(|| Error::Io(format!("segment {} not found", pos.segment_id)))?;
        segment.read(pos.block_number, pos.block_offset)
    }

    /// Iterate every payload from the earliest segment onward.
    pub fn reader(&self) -> Result<WalReader> {
        let readers = self.open_readers()?;
        Ok(WalReader {
            readers,
            current: 0,
        })
    }

    /// Iterate payloads on or after `start`. If the starting segment has
    /// been removed, reading begins at the earliest remaining segment; a
    /// start past the tail yields an exhausted reader.
    pub fn reader_with_start(&self, start: ChunkPosition) -> Result<WalReader> {
        let mut readers = self.open_readers()?;

        let current = match readers.iter().position(|r| r.id() >= start.segment_id) {
            Some(idx) => idx,
            None => readers.len(),
        };

        if current < readers.len() && readers[current].id() == start.segment_id {
            let target = start.block_number as u64 * BLOCK_SIZE as u64 + start.block_offset as u64;
            let reader = &mut readers[current];
            while reader.position() < target {
                if reader.next()?.is_none() {
                    break;
                }
            }
        }

        Ok(WalReader { readers, current })
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.segments
            .get(&self.active_id)
            .expect("active segment always present")
            .sync()
    }

    /// Whether the log holds no payloads at all.
    pub fn is_empty(&self) -> bool {
        self.segments.len() == 1
            && self
                .segments
                .get(&self.active_id)
                .is_some_and(|seg| seg.size() == 0)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for segment in self.segments.values_mut() {
            segment.close()?;
        }
        self.closed = true;
        Ok(())
    }

    /// Remove every segment file and consume the log.
    pub fn delete(mut self) -> Result<()> {
        self.closed = true;
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        Ok(())
    }

    fn open_readers(&self) -> Result<Vec<SegmentReader>> {
        // BTreeMap iteration yields segments in id order.
        self.segments
            .keys()
            .map(|&id| SegmentReader::open(&self.options.dir, id))
            .collect()
    }

    /// Whether appending `data_len` payload bytes could overflow the
    /// active segment: worst-case padding plus one chunk header per block
    /// touched.
    fn is_full(&self, data_len: u64) -> bool {
        let overhead = CHUNK_HEADER_SIZE as u64
            + data_len.div_ceil(BLOCK_SIZE as u64).max(1) * CHUNK_HEADER_SIZE as u64;
        let active = self
            .segments
            .get(&self.active_id)
            .expect("active segment always present");
        active.size() + data_len + overhead > self.options.segment_size
    }

    /// The active segment is full: retire it and open the next one.
    fn cycle(&mut self) -> Result<()> {
        let next_id = self.active_id + 1;
        tracing::debug!(from = self.active_id, to = next_id, "rotating wal segment");

        self.segments
            .get_mut(&self.active_id)
            .expect("active segment always present")
            .sync()?;

        let seg = Segment::open(&self.options.dir, next_id, true)?;
        self.segments
            .get_mut(&self.active_id)
            .expect("active segment always present")
            .set_active(false);
        self.segments.insert(next_id, seg);
        self.active_id = next_id;
        Ok(())
    }
}

fn parse_segment_file_name(name: &str) -> Option<SegmentId> {
    let stem = name.strip_suffix(".seg")?;
    if stem.len() != 16 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<SegmentId>().ok()
}

/// Streams payloads across all segments in id order.
pub struct WalReader {
    readers: Vec<SegmentReader>,
    current: usize,
}

impl WalReader {
    /// Read the next payload, or `None` at the end of the log.
    pub fn read_next(&mut self) -> Result<Option<(Vec<u8>, ChunkPosition)>> {
        while self.current < self.readers.len() {
            match self.readers[self.current].next()? {
                Some(entry) => return Ok(Some(entry)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }

    /// Position of the next chunk to be read, or `None` once exhausted.
    pub fn position(&self) -> Option<ChunkPosition> {
        let reader = self.readers.get(self.current)?;
        Some(ChunkPosition {
            segment_id: reader.id(),
            block_number: reader.block_number,
            block_offset: reader.block_offset,
            size: 0,
        })
    }
}

impl Iterator for WalReader {
    type Item = Result<(Vec<u8>, ChunkPosition)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
