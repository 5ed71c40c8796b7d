// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek};

use brotli_decompressor::Decompressor;
use bzip2::read::BzDecoder;
use liblzma::read::XzDecoder;
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static BZIP2_MAGIC: &[u8; 3] = b"BZh";
static LZ4_FRAME_MAGIC: &[u8; 4] = b"\x04\x22\x4d\x18";
static LZ4_LEGACY_MAGIC: &[u8; 4] = b"\x02\x21\x4c\x18";
static XZ_MAGIC: &[u8; 6] = b"\xfd\x37\x7a\x58\x5a\x00";

/// Internal buffer size for the brotli decoder.
const BROTLI_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("I/O error when autodetecting compression format")]
    AutoDetect(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressedFormat {
    None,
    Brotli,
    Bzip2,
    Lz4,
    Xz,
}

impl CompressedFormat {
    /// Guess the format from the leading bytes of a stream. Brotli streams have
    /// no magic and are never detected.
    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(LZ4_FRAME_MAGIC) || magic.starts_with(LZ4_LEGACY_MAGIC) {
            Some(Self::Lz4)
        } else if magic.starts_with(XZ_MAGIC) {
            Some(Self::Xz)
        } else if magic.starts_with(BZIP2_MAGIC) {
            Some(Self::Bzip2)
        } else {
            None
        }
    }
}

pub enum CompressedReader<R: Read> {
    None(R),
    /// Not autodetected. Boxed because the decoder state is large.
    Brotli(Box<Decompressor<R>>),
    Bzip2(BzDecoder<R>),
    /// Handles both the frame format and the legacy format.
    Lz4(FrameDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Self {
        match format {
            CompressedFormat::None => Self::None(reader),
            CompressedFormat::Brotli => {
                Self::Brotli(Box::new(Decompressor::new(reader, BROTLI_BUFFER_SIZE)))
            }
            CompressedFormat::Bzip2 => Self::Bzip2(BzDecoder::new(reader)),
            CompressedFormat::Lz4 => Self::Lz4(FrameDecoder::new(reader)),
            CompressedFormat::Xz => Self::Xz(XzDecoder::new(reader)),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Brotli(_) => CompressedFormat::Brotli,
            Self::Bzip2(_) => CompressedFormat::Bzip2,
            Self::Lz4(_) => CompressedFormat::Lz4,
            Self::Xz(_) => CompressedFormat::Xz,
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Autodetect the compression format from the magic bytes at the current
    /// position of `reader`. The reader must be at the start of the stream.
    pub fn new(mut reader: R, raw_if_unknown: bool) -> Result<Self> {
        let mut magic = Vec::with_capacity(XZ_MAGIC.len());
        (&mut reader)
            .take(XZ_MAGIC.len() as u64)
            .read_to_end(&mut magic)
            .map_err(Error::AutoDetect)?;

        reader.rewind().map_err(Error::AutoDetect)?;

        match CompressedFormat::detect(&magic) {
            Some(format) => Ok(Self::with_format(reader, format)),
            None if raw_if_unknown => Ok(Self::None(reader)),
            None => Err(Error::UnknownFormat),
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}
