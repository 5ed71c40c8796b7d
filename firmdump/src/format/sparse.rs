// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse image codec. The decoder is the core of this module. The
//! writer and [`encode`] exist so that raw images can be packed back up and so
//! the decoder has a reference encoder to be checked against.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    ops::Range,
    sync::atomic::AtomicBool,
};

use crc32fast::Hasher;
use thiserror::Error;
use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::{self, ReadDiscardExt};

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u16 = 0;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} < {size}", size = mem::size_of::<RawHeader>())]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {size}", size = mem::size_of::<RawChunk>())]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Size overflow: {chunk_size} * {block_size}")]
    ChunkSizeOverflow {
        index: u32,
        chunk_size: u32,
        block_size: u32,
    },
    #[error("Chunk #{index}: Invalid type: {chunk_type}")]
    InvalidChunkType { index: u32, chunk_type: u16 },
    #[error("Chunk #{index}: Data size too large: {data_size}")]
    DataSizeTooLarge { index: u32, data_size: u32 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk is not empty")]
    Crc32ChunkNotEmpty { index: u32, chunk_size: u32 },
    #[error("Chunk #{index}: Total size {total_size} does not cover {header_size}-byte header")]
    TotalSizeTooSmall {
        index: u32,
        total_size: u32,
        header_size: u16,
    },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u32,
        total_size: u32,
    },
    // Reader errors.
    #[error("Must fully consume data when CRC validation is enabled")]
    Crc32RandomRead,
    #[error("Previous chunk still has {0} unread bytes")]
    UnreadChunkData(u32),
    #[error("Expected checkpoint CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Checkpoint { expected: u32, actual: u32 },
    #[error("Expected final CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Final { expected: u32, actual: u32 },
    #[error("Chunks cover {actual} blocks, but header declares {expected}")]
    MissingBlocks { actual: u32, expected: u32 },
    // Writer errors.
    #[error("Minor version not supported for writing: {0}")]
    UnsupportedMinorVersion(u16),
    #[error("Previous chunk still has {0} unwritten bytes")]
    UnwrittenChunkData(u32),
    #[error("Already wrote all chunk headers")]
    TooManyChunks,
    #[error("Gap between end of last chunk {prev_end} and start of new chunk {cur_start}")]
    GapBetweenChunks { prev_end: u32, cur_start: u32 },
    // Encoder errors.
    #[error("File size {size} is not a multiple of block size {block_size}")]
    UnalignedFileSize { size: u64, block_size: u32 },
    #[error("File size {size} has too many blocks for block size {block_size}")]
    TooManyBlocks { size: u64, block_size: u32 },
    // Wrapped errors.
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
    #[error("Failed to copy sparse data: {0}")]
    DataCopy(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    major_version: little_endian::U16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`].
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.file_hdr_sz.get() < mem::size_of::<Self>() as u16 {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if self.chunk_hdr_sz.get() < mem::size_of::<RawChunk>() as u16 {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }

    fn excess_raw_header_bytes(&self) -> u16 {
        self.file_hdr_sz.get() - mem::size_of::<Self>() as u16
    }

    fn excess_raw_chunk_bytes(&self) -> u16 {
        self.chunk_hdr_sz.get() - mem::size_of::<RawChunk>() as u16
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], or [`CHUNK_TYPE_CRC32`].
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &self.chunk_type.get())
            .field("reserved1", &format_args!("{:#010x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

impl RawChunk {
    fn expected_size(&self, index: u32, header: &RawHeader) -> Result<u32> {
        let data_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => self
                .chunk_sz
                .get()
                .checked_mul(header.blk_sz.get())
                .ok_or_else(|| Error::ChunkSizeOverflow {
                    index,
                    chunk_size: self.chunk_sz.get(),
                    block_size: header.blk_sz.get(),
                })?,
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
            CHUNK_TYPE_DONT_CARE => 0,
            t => {
                return Err(Error::InvalidChunkType {
                    index,
                    chunk_type: t,
                });
            }
        };

        data_size
            .checked_add(header.chunk_hdr_sz.into())
            .ok_or(Error::DataSizeTooLarge { index, data_size })
    }

    fn validate(&self, index: u32, header: &RawHeader, start_block: u32) -> Result<()> {
        let end_block = start_block
            .checked_add(self.chunk_sz.get())
            .ok_or_else(|| Error::BlockCountOverflow {
                index,
                start_block,
                chunk_size: self.chunk_sz.get(),
            })?;

        if end_block > header.total_blks.get() {
            return Err(Error::EndBlockExceedsTotal {
                index,
                end_block,
                total_blocks: header.total_blks.get(),
            })?;
        }

        if self.chunk_type.get() == CHUNK_TYPE_CRC32 && self.chunk_sz.get() != 0 {
            return Err(Error::Crc32ChunkNotEmpty {
                index,
                chunk_size: self.chunk_sz.get(),
            });
        }

        if self.total_sz.get() < u32::from(header.chunk_hdr_sz.get()) {
            return Err(Error::TotalSizeTooSmall {
                index,
                total_size: self.total_sz.get(),
                header_size: header.chunk_hdr_sz.get(),
            });
        }

        let expected_size = self.expected_size(index, header)?;

        if expected_size != self.total_sz.get() {
            return Err(Error::InvalidChunkSize {
                index,
                expected_size,
                total_size: self.total_sz.get(),
            });
        }

        Ok(())
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    pub major_version: u16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for ChunkBounds {
    type Item = u32;

    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// The type of data contained in a chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// The chunk is filled with raw data.
    Data,
    /// The chunk is filled with repeating patterns of the specified integer
    /// encoded in little-endian.
    Fill(u32),
    /// The chunk is a hole and does not represent useful or valid data.
    Hole,
    /// The chunk is a CRC32 checksum. This does not represent actual data but
    /// serves as a checkpoint for validating the current checksum while in the
    /// middle of the sparse file.
    Crc32(u32),
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => f
                .debug_tuple("Crc32")
                .field(&format_args!("{checksum:#010x}"))
                .finish(),
        }
    }
}

/// A type that represents a contiguous list of blocks and the type of data or
/// metadata they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// When [`Self::data`] is [`ChunkData::Data`], this is guaranteed to not
    /// exceed the bounds of [`u32`] when multiplied by [`Header::block_size`].
    /// For other types of data, a 64-bit signed or unsigned integer is needed.
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("bounds", &self.bounds)
            .field("data", &format_args!("{:?}", self.data))
            .finish()
    }
}

/// Whether to validate CRC32 checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    Ignore,
}

/// Hash what a fill chunk's contents would be if it were unsparsed.
fn hash_fill_chunk(
    raw_chunk: &RawChunk,
    fill_value: little_endian::U32,
    raw_header: &RawHeader,
    hasher: &mut Hasher,
) {
    let buf = [fill_value; 1024];
    let mut remain = u64::from(raw_chunk.chunk_sz) * u64::from(raw_header.blk_sz);

    while remain > 0 {
        let n = remain.min(buf.as_bytes().len() as u64) as usize;
        hasher.update(&buf.as_bytes()[..n]);
        remain -= n as u64;
    }
}

/// A type for reading sparse files.
pub struct SparseReader<R> {
    inner: R,
    seek_relative: Option<fn(&mut R, i64) -> io::Result<()>>,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to read.
    chunk: u32,
    /// Number of bytes left to read for the current chunk if the chunk has
    /// [`ChunkData::Data`].
    data_remain: u32,
    hasher: Option<Hasher>,
}

impl<R: Read + Seek> SparseReader<R> {
    /// Create a new reader from a seekable file. This allows data chunks to be
    /// efficiently skipped without reading them.
    pub fn new_seekable(inner: R, crc_mode: CrcMode) -> Result<Self> {
        let mut result = Self::new(inner, crc_mode)?;
        result.seek_relative = Some(Seek::seek_relative);
        Ok(result)
    }
}

impl<R: Read> SparseReader<R> {
    /// Create a new reader from a stream. This cannot efficiently skip reading
    /// data chunks if they are not needed. If the underlying file is seekable
    /// and skipping chunks is needed, use [`Self::new_seekable`] instead.
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let header =
            RawHeader::read_from_io(&mut inner).map_err(|e| Error::DataRead("header", e))?;

        header.validate()?;

        inner
            .read_discard(header.excess_raw_header_bytes().into())
            .map_err(|e| Error::DataRead("header_excess", e))?;

        Ok(Self {
            inner,
            seek_relative: None,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            hasher: match crc_mode {
                CrcMode::Validate => Some(Hasher::new()),
                CrcMode::Ignore => None,
            },
        })
    }

    /// Get the sparse file header.
    pub fn header(&self) -> Header {
        Header {
            major_version: self.header.major_version.get(),
            minor_version: self.header.minor_version.get(),
            block_size: self.header.blk_sz.get(),
            num_blocks: self.header.total_blks.get(),
            num_chunks: self.header.total_chunks.get(),
            crc32: self.header.image_checksum.get(),
        }
    }

    /// Read the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully read first unless the
    /// reader is seekable and CRC validation is disabled. If the last chunk has
    /// already been read, then [`None`] is returned.
    ///
    /// For chunks with [`ChunkData::Crc32`], if CRC validation is enabled, the
    /// checksum will have already been verified. The caller does not need to
    /// perform its own verification.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.data_remain != 0 {
            if let Some(seek_relative) = self.seek_relative {
                if self.hasher.is_some() {
                    return Err(Error::Crc32RandomRead);
                }

                seek_relative(&mut self.inner, self.data_remain.into())
                    .map_err(|e| Error::DataRead("data_remain", e))?;
                self.data_remain = 0;
            } else {
                return Err(Error::UnreadChunkData(self.data_remain));
            }
        }

        let raw_chunk = loop {
            if self.chunk == self.header.total_chunks.get() {
                return Ok(None);
            }

            let raw_chunk =
                RawChunk::read_from_io(&mut self.inner).map_err(|e| Error::DataRead("chunk", e))?;

            match raw_chunk.chunk_type.get() {
                CHUNK_TYPE_RAW | CHUNK_TYPE_FILL | CHUNK_TYPE_DONT_CARE | CHUNK_TYPE_CRC32 => {
                    break raw_chunk;
                }
                _ => self.skip_unknown_chunk(&raw_chunk)?,
            }
        };

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.inner
            .read_discard(self.header.excess_raw_chunk_bytes().into())
            .map_err(|e| Error::DataRead("chunk_excess", e))?;

        let data: ChunkData;

        match raw_chunk.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                self.data_remain =
                    raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());

                data = ChunkData::Data;
            }
            CHUNK_TYPE_FILL => {
                let fill_value = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_fill_value", e))?;

                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(&raw_chunk, fill_value, &self.header, hasher);
                }

                data = ChunkData::Fill(fill_value.get());
            }
            CHUNK_TYPE_DONT_CARE => {
                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(&raw_chunk, 0.into(), &self.header, hasher);
                }

                data = ChunkData::Hole;
            }
            CHUNK_TYPE_CRC32 => {
                let expected = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_crc32", e))?;

                if let Some(hasher) = &mut self.hasher {
                    let actual = hasher.clone().finalize();

                    if actual != expected.get() {
                        return Err(Error::MismatchedCrc32Checkpoint {
                            expected: expected.get(),
                            actual,
                        });
                    }
                }

                data = ChunkData::Crc32(expected.get());
            }
            _ => unreachable!(),
        }

        let chunk = Chunk {
            bounds: ChunkBounds {
                start: self.block,
                end: self.block + raw_chunk.chunk_sz.get(),
            },
            data,
        };

        self.chunk += 1;
        self.block = chunk.bounds.end;

        Ok(Some(chunk))
    }

    /// Discard a chunk with an unknown type. Like CRC32 checkpoints, these
    /// occupy no blocks and produce no output.
    fn skip_unknown_chunk(&mut self, raw_chunk: &RawChunk) -> Result<()> {
        let header_size = self.header.chunk_hdr_sz.get();
        let data_size = raw_chunk
            .total_sz
            .get()
            .checked_sub(header_size.into())
            .ok_or(Error::TotalSizeTooSmall {
                index: self.chunk,
                total_size: raw_chunk.total_sz.get(),
                header_size,
            })?;

        warn!(
            "Skipping chunk #{} with unknown type {:#06x}",
            self.chunk,
            raw_chunk.chunk_type.get(),
        );

        self.inner
            .read_discard_exact(
                u64::from(self.header.excess_raw_chunk_bytes()) + u64::from(data_size),
            )
            .map_err(|e| Error::DataRead("chunk_unknown", e))?;

        self.chunk += 1;

        Ok(())
    }

    /// Verify that the chunks covered every block, verify the final checksum,
    /// and return the underlying reader.
    pub fn finish(self) -> Result<R> {
        if self.block != self.header.total_blks.get() {
            return Err(Error::MissingBlocks {
                actual: self.block,
                expected: self.header.total_blks.get(),
            });
        }

        if let Some(hasher) = self.hasher {
            let expected = self.header.image_checksum.get();
            if expected != 0 {
                let actual = hasher.finalize();

                if actual != expected {
                    return Err(Error::MismatchedCrc32Final { expected, actual });
                }
            }
        }

        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.data_remain as usize);

        let n = self.inner.read(&mut buf[..to_read])?;

        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }

        self.data_remain -= n as u32;

        Ok(n)
    }
}

/// A type for writing sparse files.
pub struct SparseWriter<W> {
    inner: W,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to write.
    chunk: u32,
    /// Number of bytes left to write for the current chunk if the chunk has
    /// [`ChunkData::Data`].
    data_remain: u32,
    hasher: Hasher,
}

impl<W: Write> SparseWriter<W> {
    /// Create a new writer from a stream. This does not require the underlying
    /// file to be seekable, so the [`Header`] must be fully known up front.
    pub fn new(mut inner: W, header: Header) -> Result<Self> {
        if header.minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion(header.minor_version));
        }

        let header = RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: header.major_version.into(),
            minor_version: header.minor_version.into(),
            file_hdr_sz: (mem::size_of::<RawHeader>() as u16).into(),
            chunk_hdr_sz: (mem::size_of::<RawChunk>() as u16).into(),
            blk_sz: header.block_size.into(),
            total_blks: header.num_blocks.into(),
            total_chunks: header.num_chunks.into(),
            image_checksum: header.crc32.into(),
        };

        header.validate()?;

        header
            .write_to_io(&mut inner)
            .map_err(|e| Error::DataWrite("header", e))?;

        Ok(Self {
            inner,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            // We include this unconditionally because we don't know if we'll
            // get any CRC32 chunks later.
            hasher: Hasher::new(),
        })
    }

    /// Write the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully written first.
    pub fn start_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if self.data_remain != 0 {
            return Err(Error::UnwrittenChunkData(self.data_remain));
        }

        if self.chunk == self.header.total_chunks.get() {
            return Err(Error::TooManyChunks);
        }

        if chunk.bounds.start != self.block {
            return Err(Error::GapBetweenChunks {
                prev_end: self.block,
                cur_start: chunk.bounds.start,
            });
        }

        let mut raw_chunk = RawChunk {
            chunk_type: match chunk.data {
                ChunkData::Data => CHUNK_TYPE_RAW.into(),
                ChunkData::Fill(_) => CHUNK_TYPE_FILL.into(),
                ChunkData::Hole => CHUNK_TYPE_DONT_CARE.into(),
                ChunkData::Crc32(_) => CHUNK_TYPE_CRC32.into(),
            },
            reserved1: 0.into(),
            chunk_sz: chunk.bounds.len().into(),
            total_sz: 0.into(),
        };

        raw_chunk.total_sz = raw_chunk.expected_size(self.chunk, &self.header)?.into();

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.chunk += 1;
        self.block = chunk.bounds.end;

        raw_chunk
            .write_to_io(&mut self.inner)
            .map_err(|e| Error::DataWrite("chunk", e))?;

        match chunk.data {
            ChunkData::Data => {
                self.data_remain =
                    raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());
            }
            ChunkData::Fill(fill_value) => {
                self.inner
                    .write_all(&fill_value.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_fill_value", e))?;

                hash_fill_chunk(
                    &raw_chunk,
                    fill_value.into(),
                    &self.header,
                    &mut self.hasher,
                );
            }
            ChunkData::Hole => {
                hash_fill_chunk(&raw_chunk, 0.into(), &self.header, &mut self.hasher);
            }
            ChunkData::Crc32(expected) => {
                self.inner
                    .write_all(&expected.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_crc32", e))?;

                let actual = self.hasher.clone().finalize();
                if actual != expected {
                    return Err(Error::MismatchedCrc32Checkpoint { expected, actual });
                }
            }
        }

        Ok(())
    }

    /// Verify the final checksum and return the underlying writer.
    pub fn finish(self) -> Result<W> {
        let expected = self.header.image_checksum.get();
        if expected != 0 {
            let actual = self.hasher.finalize();

            if actual != expected {
                return Err(Error::MismatchedCrc32Final { expected, actual });
            }
        }

        Ok(self.inner)
    }
}

impl<W: Write> Write for SparseWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let to_write = buf.len().min(self.data_remain as usize);

        let n = self.inner.write(&buf[..to_write])?;

        self.hasher.update(&buf[..n]);

        self.data_remain -= n as u32;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Check if `reader` begins with a sparse image header. At most the size of the
/// canonical header is read. Streams that are too short to contain a header are
/// not sparse images.
pub fn check(reader: impl Read) -> io::Result<bool> {
    let mut buf = Vec::with_capacity(mem::size_of::<RawHeader>());
    reader
        .take(mem::size_of::<RawHeader>() as u64)
        .read_to_end(&mut buf)?;

    Ok(RawHeader::ref_from_bytes(&buf).is_ok_and(|h| h.magic.get() == HEADER_MAGIC))
}

/// Unsparse all chunks from `reader` into `writer`, calling `write_hole` for
/// [`ChunkData::Hole`] regions.
fn unsparse<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    crc_mode: CrcMode,
    mut write_hole: impl FnMut(&mut W, u64) -> io::Result<()>,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    let mut sparse_reader = SparseReader::new(reader, crc_mode)?;
    let header = sparse_reader.header();
    let block_size = u64::from(header.block_size);

    debug!("Unsparsing image: {header:?}");

    while let Some(chunk) = sparse_reader.next_chunk()? {
        trace!("Chunk: {chunk:?}");

        let size = u64::from(chunk.bounds.len()) * block_size;

        match chunk.data {
            ChunkData::Data => {
                stream::copy_n(&mut sparse_reader, &mut writer, size, cancel_signal)
                    .map_err(|e| Error::DataCopy("chunk_data", e))?;
            }
            ChunkData::Fill(value) => {
                let buf = [little_endian::U32::new(value); 1024];
                let mut remain = size;

                while remain > 0 {
                    stream::check_cancel(cancel_signal)
                        .map_err(|e| Error::DataWrite("chunk_fill", e))?;

                    let n = remain.min(buf.as_bytes().len() as u64) as usize;
                    writer
                        .write_all(&buf.as_bytes()[..n])
                        .map_err(|e| Error::DataWrite("chunk_fill", e))?;

                    remain -= n as u64;
                }
            }
            ChunkData::Hole => {
                write_hole(&mut writer, size).map_err(|e| Error::DataWrite("chunk_hole", e))?;
            }
            // Checkpoints occupy no blocks.
            ChunkData::Crc32(_) => {}
        }
    }

    sparse_reader.finish()?;

    writer
        .flush()
        .map_err(|e| Error::DataWrite("flush", e))?;

    Ok(header)
}

/// Decode a sparse image into a raw image. The output is written strictly
/// sequentially and hole chunks are written out as zeros.
pub fn decode(
    reader: impl Read,
    writer: impl Write,
    crc_mode: CrcMode,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    unsparse(
        reader,
        writer,
        crc_mode,
        |w, size| stream::copy_n(io::repeat(0), w, size, cancel_signal),
        cancel_signal,
    )
}

/// Decode a sparse image into a raw image, seeking forward over hole chunks
/// instead of writing zeros. Existing data in the holes is left intact, which
/// allows several sparse images covering disjoint blocks to be unsparsed into
/// the same file. The output must be positioned at the start of the image.
///
/// A trailing hole does not extend the output. The caller is responsible for
/// setting the final file size.
pub fn decode_seekable(
    reader: impl Read,
    writer: impl Write + Seek,
    crc_mode: CrcMode,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    unsparse(
        reader,
        writer,
        crc_mode,
        |w, size| {
            let offset = i64::try_from(size).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "Hole size too large")
            })?;

            w.seek_relative(offset)
        },
        cancel_signal,
    )
}

/// Compute the list of chunks for a raw image. Blocks consisting of a repeated
/// 4-byte pattern become fill chunks and everything else becomes data chunks.
/// Data chunks are split so that none exceed 64 MiB, matching AOSP's
/// libsparse.
fn compute_chunks(
    mut reader: impl Read,
    block_size: u32,
    num_blocks: u32,
    cancel_signal: &AtomicBool,
) -> Result<(Vec<Chunk>, u32)> {
    const MAX_DATA_BYTES: u32 = 64 * 1024 * 1024;

    let max_data_blocks = (MAX_DATA_BYTES / block_size).max(1);
    let mut chunks = Vec::<Chunk>::new();
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; block_size as usize];

    for block in 0..num_blocks {
        stream::check_cancel(cancel_signal).map_err(|e| Error::DataRead("block", e))?;

        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::DataRead("block", e))?;

        hasher.update(&buf);

        let data = if buf.chunks_exact(4).all(|c| c == &buf[..4]) {
            ChunkData::Fill(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
        } else {
            ChunkData::Data
        };

        match chunks.last_mut() {
            Some(last)
                if last.data == data
                    && (data != ChunkData::Data || last.bounds.len() < max_data_blocks) =>
            {
                last.bounds.end = block + 1;
            }
            _ => chunks.push(Chunk {
                bounds: ChunkBounds {
                    start: block,
                    end: block + 1,
                },
                data,
            }),
        }
    }

    Ok((chunks, hasher.finalize()))
}

/// Encode a raw image into a sparse image. The size of the input must be a
/// multiple of `block_size`. The header always includes the CRC32 of the full
/// image.
pub fn encode(
    mut reader: impl Read + Seek,
    writer: impl Write,
    block_size: u32,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    if block_size == 0 || block_size % 4 != 0 {
        return Err(Error::InvalidBlockSize(block_size));
    }

    let file_size = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataRead("file_size", e))?;
    if file_size % u64::from(block_size) != 0 {
        return Err(Error::UnalignedFileSize {
            size: file_size,
            block_size,
        });
    }

    let num_blocks: u32 = (file_size / u64::from(block_size))
        .try_into()
        .map_err(|_| Error::TooManyBlocks {
            size: file_size,
            block_size,
        })?;

    reader.rewind().map_err(|e| Error::DataRead("rewind", e))?;

    let (chunks, crc32) = compute_chunks(&mut reader, block_size, num_blocks, cancel_signal)?;

    let header = Header {
        major_version: MAJOR_VERSION,
        minor_version: MINOR_VERSION,
        block_size,
        num_blocks,
        // There is at most one chunk per block.
        num_chunks: chunks.len() as u32,
        crc32,
    };

    debug!("Encoding sparse image: {header:?}");

    let mut sparse_writer = SparseWriter::new(writer, header)?;

    for chunk in chunks {
        sparse_writer.start_chunk(chunk)?;

        if chunk.data == ChunkData::Data {
            let offset = u64::from(chunk.bounds.start) * u64::from(block_size);
            let size = u64::from(chunk.bounds.len()) * u64::from(block_size);

            reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::DataRead("chunk_seek", e))?;

            stream::copy_n(&mut reader, &mut sparse_writer, size, cancel_signal)
                .map_err(|e| Error::DataCopy("chunk_data", e))?;
        }
    }

    sparse_writer
        .finish()?
        .flush()
        .map_err(|e| Error::DataWrite("flush", e))?;

    Ok(header)
}
