//! A single WAL segment file: chunked records inside 32KiB physical
//! blocks.
//!
//! Payloads are framed as one or more chunks. A chunk carries a 7-byte
//! header followed by its payload bytes:
//!
//! ```text
//! +-----------+------------+----------+---------+
//! | crc32:u32 | length:u16 | type:u8  | payload |
//! +-----------+------------+----------+---------+
//! ```
//!
//! Header integers are big-endian. The CRC covers `[length | type |
//! payload]`. A chunk never crosses a 32KiB block boundary: when a block's
//! tail cannot hold a chunk header, the tail is zero-padded and the chunk
//! starts at the next block. Payloads that do not fit in the current block
//! are split `First (.. Middle ..) Last`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, Result};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Physical block size.
pub const BLOCK_SIZE: u32 = 32 * 1024;

/// checksum(4) + length(2) + chunk type(1).
pub const CHUNK_HEADER_SIZE: u32 = 7;

/// Maximum payload of a single chunk; the length field is a u16.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

pub type SegmentId = u32;

pub(crate) fn segment_file_name(id: SegmentId) -> String {
    format!("{:016}.seg", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Full = 0,
    First = 1,
    Middle = 2,
    Last = 3,
}

impl ChunkType {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ChunkType::Full),
            1 => Ok(ChunkType::First),
            2 => Ok(ChunkType::Middle),
            3 => Ok(ChunkType::Last),
            other => Err(Error::Corruption(format!("invalid chunk type: {other}"))),
        }
    }
}

/// Location of a payload's first chunk. `block_number * BLOCK_SIZE +
/// block_offset` is the byte offset in the segment file; `size` counts the
/// chunk bytes written for the payload (headers included, padding
/// excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    pub segment_id: SegmentId,
    pub block_number: u32,
    pub block_offset: u32,
    pub size: u32,
}

pub(crate) struct Segment {
    id: SegmentId,
    file: File,
    path: PathBuf,

    // block_number * BLOCK_SIZE + block_offset is the next write position.
    block_number: u32,
    block_offset: u32,

    closed: bool,
    active: bool,
}

impl Segment {
    pub fn open(dir: &Path, id: SegmentId, active: bool) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let offset = file.metadata()?.len();
        Ok(Self {
            id,
            file,
            path,
            block_number: (offset / BLOCK_SIZE as u64) as u32,
            block_offset: (offset % BLOCK_SIZE as u64) as u32,
            closed: false,
            active,
        })
    }

    pub fn size(&self) -> u64 {
        self.block_number as u64 * BLOCK_SIZE as u64 + self.block_offset as u64
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Append one payload as chunks. Returns the position of its first
    /// chunk.
    pub fn write(&mut self, data: &[u8]) -> Result<ChunkPosition> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.active {
            return Err(Error::InactiveSegmentWrite);
        }

        let (buf, pos) = self.encode_chunks(data)?;
        self.file.write_all(&buf)?;

        // Counters move only after the write lands; pos already accounts
        // for any leading padding.
        let end = pos.block_offset + pos.size;
        self.block_number = pos.block_number + end / BLOCK_SIZE;
        self.block_offset = end % BLOCK_SIZE;
        tracing::trace!(
            segment = self.id,
            block = pos.block_number,
            offset = pos.block_offset,
            size = pos.size,
            "wrote wal chunk"
        );
        Ok(pos)
    }

    /// Frame `data` into chunk bytes starting at the current write
    /// position. The returned position accounts for any leading padding;
    /// `pos.size` covers only chunk bytes.
    fn encode_chunks(&self, data: &[u8]) -> Result<(Vec<u8>, ChunkPosition)> {
        let mut buf = Vec::with_capacity(data.len() + 2 * CHUNK_HEADER_SIZE as usize);
        let mut block_number = self.block_number;
        let mut start_offset = self.block_offset;

        // Not enough room for a chunk header in this block: pad to the
        // boundary.
        if start_offset + CHUNK_HEADER_SIZE >= BLOCK_SIZE {
            let padding = BLOCK_SIZE - start_offset;
            buf.resize(padding as usize, 0);
            block_number += 1;
            start_offset = 0;
        }

        let mut pos = ChunkPosition {
            segment_id: self.id,
            block_number,
            block_offset: start_offset,
            size: 0,
        };

        let data_size = data.len() as u32;
        if start_offset + CHUNK_HEADER_SIZE + data_size <= BLOCK_SIZE {
            append_chunk(&mut buf, data, ChunkType::Full)?;
            pos.size = CHUNK_HEADER_SIZE + data_size;
            return Ok((buf, pos));
        }

        // The payload spans blocks: First, zero or more Middle, Last.
        let mut start = 0u32;
        let mut chunk_count = 0u32;
        let mut block_offset = start_offset;
        loop {
            let room = BLOCK_SIZE - block_offset - CHUNK_HEADER_SIZE;
            let end = data_size.min(start + room);
            let chunk_type = if start == 0 {
                ChunkType::First
            } else if end == data_size {
                ChunkType::Last
            } else {
                ChunkType::Middle
            };

            append_chunk(&mut buf, &data[start as usize..end as usize], chunk_type)?;
            chunk_count += 1;
            block_offset = (block_offset + CHUNK_HEADER_SIZE + end - start) % BLOCK_SIZE;
            start = end;

            if chunk_type == ChunkType::Last {
                break;
            }
        }
        pos.size = chunk_count * CHUNK_HEADER_SIZE + data_size;
        Ok((buf, pos))
    }

    /// Read one whole payload starting at the given position.
    pub fn read(&self, block_number: u32, block_offset: u32) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::Closed);
        }

        let size = self.size();
        let mut result = Vec::new();
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        let mut current_block = block_number;
        let mut current_offset = block_offset as usize;

        loop {
            let file_offset = current_block as u64 * BLOCK_SIZE as u64;
            if file_offset >= size {
                return Err(Error::Io("read past wal segment end".to_string()));
            }
            let read_len = (BLOCK_SIZE as u64).min(size - file_offset) as usize;

            let mut reader = self.file.try_clone()?;
            reader.seek(SeekFrom::Start(file_offset))?;
            reader.read_exact(&mut block[..read_len])?;

            let (data, _, end) = read_chunks(&block[..read_len], current_offset)?;
            result.extend_from_slice(&data);
            if end {
                break;
            }
            current_block += 1;
            current_offset = 0;
        }

        Ok(result)
    }

    pub fn sync(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Discard everything from the given position onward, restoring the
    /// pre-write state after a failed sync.
    pub fn truncate(&mut self, block_number: u32, block_offset: u32) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.active {
            return Err(Error::InactiveSegmentWrite);
        }

        let offset = block_number as u64 * BLOCK_SIZE as u64 + block_offset as u64;
        if offset > self.size() {
            return Err(Error::Io(format!(
                "truncate past segment end: {offset} > {}",
                self.size()
            )));
        }

        tracing::debug!(segment = self.id, offset, "truncating wal segment");
        self.file.set_len(offset)?;
        self.block_number = block_number;
        self.block_offset = block_offset;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.sync()?;
        self.closed = true;
        Ok(())
    }

    pub fn remove(mut self) -> Result<()> {
        self.closed = true;
        let path = std::mem::take(&mut self.path);
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_chunk(buf: &mut Vec<u8>, data: &[u8], chunk_type: ChunkType) -> Result<()> {
    if data.len() > MAX_CHUNK_SIZE {
        return Err(Error::ChunkTooBig);
    }

    let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
    BigEndian::write_u16(&mut header[4..6], data.len() as u16);
    header[6] = chunk_type as u8;

    let mut digest = CRC32.digest();
    digest.update(&header[4..]);
    digest.update(data);
    BigEndian::write_u32(&mut header[..4], digest.finalize());

    buf.extend_from_slice(&header);
    buf.extend_from_slice(data);
    Ok(())
}

/// Read chunks from `offset` to the end of one payload or the end of the
/// block, whichever comes first. Returns the payload bytes read, the chunk
/// bytes consumed, and whether the payload is complete.
fn read_chunks(block: &[u8], offset: usize) -> Result<(Vec<u8>, u32, bool)> {
    let mut data = Vec::new();
    let mut size = 0u32;
    let mut offset = offset;

    loop {
        if offset + CHUNK_HEADER_SIZE as usize > block.len() {
            // The rest of the block is padding or a torn header.
            return Ok((data, size, false));
        }

        let header = &block[offset..offset + CHUNK_HEADER_SIZE as usize];
        let saved_checksum = BigEndian::read_u32(&header[..4]);
        let length = BigEndian::read_u16(&header[4..6]) as usize;
        let chunk_type = ChunkType::from_u8(header[6])?;

        let payload_start = offset + CHUNK_HEADER_SIZE as usize;
        let payload_end = payload_start + length;
        if payload_end > block.len() {
            return Err(Error::InvalidCrc);
        }

        let mut digest = CRC32.digest();
        digest.update(&block[offset + 4..payload_end]);
        if digest.finalize() != saved_checksum {
            return Err(Error::InvalidCrc);
        }

        size += CHUNK_HEADER_SIZE + length as u32;
        data.extend_from_slice(&block[payload_start..payload_end]);

        if chunk_type == ChunkType::Full || chunk_type == ChunkType::Last {
            return Ok((data, size, true));
        }
        offset = payload_end;
    }
}

/// Streams payloads out of one segment in write order, using its own file
/// handle.
pub(crate) struct SegmentReader {
    id: SegmentId,
    file: File,
    size: u64,
    pub block_number: u32,
    pub block_offset: u32,
}

impl SegmentReader {
    pub fn open(dir: &Path, id: SegmentId) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            id,
            file,
            size,
            block_number: 0,
            block_offset: 0,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Byte position of the next chunk to read.
    pub fn position(&self) -> u64 {
        self.block_number as u64 * BLOCK_SIZE as u64 + self.block_offset as u64
    }

    /// Read the next payload, or `None` at the end of the segment.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, ChunkPosition)>> {
        let mut result = Vec::new();
        let mut chunk_pos = ChunkPosition {
            segment_id: self.id,
            block_number: self.block_number,
            block_offset: self.block_offset,
            size: 0,
        };
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        let mut current_block = self.block_number;
        let mut current_offset = self.block_offset;

        loop {
            let file_offset = current_block as u64 * BLOCK_SIZE as u64;
            if file_offset >= self.size {
                return Ok(None);
            }
            let read_len = (BLOCK_SIZE as u64).min(self.size - file_offset) as usize;
            if read_len as u64 <= current_offset as u64 {
                return Ok(None);
            }

            self.file.seek(SeekFrom::Start(file_offset))?;
            self.file.read_exact(&mut block[..read_len])?;

            let (data, consumed, end) = read_chunks(&block[..read_len], current_offset as usize)?;
            if consumed == 0 && !end {
                // Nothing but padding left in the file.
                return Ok(None);
            }
            chunk_pos.size += consumed;
            current_offset += consumed;
            result.extend_from_slice(&data);

            if end {
                break;
            }
            current_block += 1;
            current_offset = 0;
        }

        // Skip the padding so the next read starts on a chunk header.
        if current_offset + CHUNK_HEADER_SIZE >= BLOCK_SIZE
            && current_block as u64 * BLOCK_SIZE as u64 + (current_offset as u64) < self.size
        {
            current_block += 1;
            current_offset = 0;
        }

        self.block_number = current_block;
        self.block_offset = current_offset;
        Ok(Some((result, chunk_pos)))
    }
}
