// SPDX-FileCopyrightText: 2022-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for update_engine OTA payloads (`payload.bin`). Only full payloads
//! can be reconstructed. Operations that depend on a source partition are
//! rejected.

use std::{
    fmt, fs,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bzip2::read::BzDecoder;
use liblzma::read::XzDecoder;
use prost::{DecodeError, Message};
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionUpdate, Signatures,
        install_operation::Type,
    },
    stream::{self, FromReader, HashingReader, ReadDiscardExt, ReadFixedSizeExt, SectionReader},
};

const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Only the major version 2 format is supported.
pub const SUPPORTED_VERSION: u64 = 2;

/// Block size used for all destination extents. The manifest's block size
/// field is ignored.
pub const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Partition not found in payload: {0}")]
    MissingPartition(String),
    #[error("Partition name is not a plain file name: {0:?}")]
    InvalidPartitionName(String),
    #[error("Operation #{index}: Unsupported operation type: {kind}")]
    UnsupportedOperation { index: usize, kind: String },
    #[error("Operation #{index}: No destination extents")]
    NoExtents { index: usize },
    #[error("Operation #{index}: Failed to decompress {kind} data")]
    Decompress {
        index: usize,
        kind: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Payload metadata ends at {expected}, but the file is only {actual} bytes")]
    Truncated { expected: u64, actual: u64 },
    #[error("Failed to create output: {0:?}")]
    CreateOutput(PathBuf, #[source] io::Error),
    #[error("Failed to read payload data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the fixed-size part of the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`PAYLOAD_MAGIC`].
    magic: [u8; 4],
    /// Major version.
    version: big_endian::U64,
    /// Size of the serialized [`DeltaArchiveManifest`].
    manifest_size: big_endian::U64,
    /// Size of the serialized metadata [`Signatures`].
    metadata_signature_size: big_endian::U32,
}

/// Size of the fixed-size header.
pub const HEADER_SIZE: u64 = size_of::<RawHeader>() as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

impl PayloadHeader {
    /// Offset of the data blob. All operation data offsets are relative to
    /// this.
    pub fn data_offset(&self) -> Result<u64> {
        HEADER_SIZE
            .checked_add(self.manifest_size)
            .and_then(|o| o.checked_add(self.metadata_signature_size.into()))
            .ok_or(Error::IntegerTooLarge("data_offset"))
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let raw_header =
            RawHeader::read_from_io(&mut reader).map_err(|e| Error::DataRead("header", e))?;

        if raw_header.magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(raw_header.magic));
        }

        let version = raw_header.version.get();
        if version != SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let header = Self {
            version,
            manifest_size: raw_header.manifest_size.get(),
            metadata_signature_size: raw_header.metadata_signature_size.get(),
        };

        // Reject sizes that don't fit before trying to read anything.
        header.data_offset()?;

        Ok(header)
    }
}

/// Why an operation's output could not be fully trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WarningKind {
    /// Number of bytes written differs from the destination extent size.
    LengthMismatch { expected: u64, actual: u64 },
    /// SHA-256 of the operation's data blob does not match the manifest.
    HashMismatch { expected: String, actual: String },
    /// Only the first of several destination extents was written.
    ExtraExtents { expected: usize, actual: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationWarning {
    /// Index of the operation within the partition.
    pub index: usize,
    pub kind: WarningKind,
}

impl fmt::Display for OperationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation #{}: ", self.index)?;

        match &self.kind {
            WarningKind::LengthMismatch { expected, actual } => {
                write!(f, "Expected {expected} bytes, but wrote {actual} bytes")
            }
            WarningKind::HashMismatch { expected, actual } => {
                write!(f, "Expected sha256 {expected}, but have {actual}")
            }
            WarningKind::ExtraExtents { expected, actual } => {
                write!(f, "Only {expected} of {actual} destination extents applied")
            }
        }
    }
}

/// Outcome of a partition reconstruction that did not fail outright.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconstruction {
    /// Every operation's length and hash checked out.
    Verified,
    /// The image was written, but some operations could not be verified.
    Degraded(Vec<OperationWarning>),
}

impl Reconstruction {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    pub fn warnings(&self) -> &[OperationWarning] {
        match self {
            Self::Verified => &[],
            Self::Degraded(w) => w,
        }
    }
}

/// Check that a partition name can be used as a file name without escaping the
/// output directory.
fn validate_partition_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(Error::InvalidPartitionName(name.to_owned()));
    }

    Ok(())
}

/// Copy at most `limit` bytes from `reader` to `writer` and discard the rest.
/// Returns the total number of bytes read.
fn copy_bounded(
    mut reader: impl Read,
    writer: impl Write,
    limit: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let written = stream::copy(Read::by_ref(&mut reader).take(limit), writer, cancel_signal)?;
    let excess = stream::copy(reader, io::sink(), cancel_signal)?;

    Ok(written + excess)
}

/// Apply a single full-OTA operation to `writer`. Length and hash mismatches
/// are pushed to `warnings`. Everything else is an error.
fn apply_operation(
    reader: &mut (impl Read + Seek),
    writer: &mut (impl Write + Seek),
    data_offset: u64,
    index: usize,
    op: &InstallOperation,
    warnings: &mut Vec<OperationWarning>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let op_type = Type::try_from(op.r#type).map_err(|_| Error::UnsupportedOperation {
        index,
        kind: op.r#type.to_string(),
    })?;

    let kind = match op_type {
        Type::Replace => "REPLACE",
        Type::ReplaceBz => "REPLACE_BZ",
        Type::ReplaceXz => "REPLACE_XZ",
        Type::Zero => "ZERO",
        other => {
            return Err(Error::UnsupportedOperation {
                index,
                kind: other.as_str_name().to_owned(),
            });
        }
    };

    let extent = op.dst_extents.first().ok_or(Error::NoExtents { index })?;
    if op.dst_extents.len() > 1 {
        warnings.push(OperationWarning {
            index,
            kind: WarningKind::ExtraExtents {
                expected: 1,
                actual: op.dst_extents.len(),
            },
        });
    }

    let out_offset = extent
        .start_block()
        .checked_mul(BLOCK_SIZE)
        .ok_or(Error::IntegerTooLarge("out_offset"))?;
    let out_length = extent
        .num_blocks()
        .checked_mul(BLOCK_SIZE)
        .ok_or(Error::IntegerTooLarge("out_length"))?;

    writer
        .seek(SeekFrom::Start(out_offset))
        .map_err(|e| Error::DataWrite("seek", e))?;

    if op_type == Type::Zero {
        stream::copy_n(io::repeat(0), writer, out_length, cancel_signal)
            .map_err(|e| Error::DataWrite("zero", e))?;

        return Ok(());
    }

    let in_offset = data_offset
        .checked_add(op.data_offset())
        .ok_or(Error::IntegerTooLarge("in_offset"))?;
    let data_length = op.data_length();

    let section = SectionReader::new(&mut *reader, in_offset, data_length)
        .map_err(|e| Error::DataRead("seek", e))?;
    let mut hashing_reader = HashingReader::new(section, Context::new(&ring::digest::SHA256));

    // Output beyond the destination extent is decoded for the length check,
    // but never written.
    let written = match op_type {
        Type::ReplaceBz => copy_bounded(
            BzDecoder::new(&mut hashing_reader),
            &mut *writer,
            out_length,
            cancel_signal,
        )
        .map_err(|source| Error::Decompress {
            index,
            kind,
            source,
        })?,
        Type::ReplaceXz => copy_bounded(
            XzDecoder::new(&mut hashing_reader),
            &mut *writer,
            out_length,
            cancel_signal,
        )
        .map_err(|source| Error::Decompress {
            index,
            kind,
            source,
        })?,
        _ => {
            stream::copy_n(
                &mut hashing_reader,
                &mut *writer,
                data_length.min(out_length),
                cancel_signal,
            )
            .map_err(|e| Error::DataRead("replace", e))?;
            data_length
        }
    };

    // Decoders may stop before consuming trailing padding in the blob.
    hashing_reader
        .read_discard(data_length)
        .map_err(|e| Error::DataRead("data_remain", e))?;

    if written != out_length {
        warnings.push(OperationWarning {
            index,
            kind: WarningKind::LengthMismatch {
                expected: out_length,
                actual: written,
            },
        });
    }

    let (_, context) = hashing_reader.finish();
    let digest = context.finish();

    match op.data_sha256_hash.as_deref() {
        Some(expected) if expected != digest.as_ref() => {
            warnings.push(OperationWarning {
                index,
                kind: WarningKind::HashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(digest),
                },
            });
        }
        Some(_) => {}
        None => debug!("Operation #{index}: No {kind} data hash to verify"),
    }

    Ok(())
}

/// An opened payload. The manifest is decoded permissively: if the manifest
/// bytes are corrupt, whatever fields were decoded before the error are kept
/// and the error is available via [`Self::manifest_error`].
pub struct Payload<R> {
    reader: R,
    header: PayloadHeader,
    manifest: DeltaArchiveManifest,
    manifest_error: Option<DecodeError>,
    metadata_signatures: Signatures,
    data_offset: u64,
}

impl<R: Read + Seek> Payload<R> {
    /// Parse the header, manifest, and metadata signatures. The signatures are
    /// not verified.
    pub fn open(mut reader: R) -> Result<Self> {
        reader
            .rewind()
            .map_err(|e| Error::DataRead("rewind", e))?;

        let header = PayloadHeader::from_reader(&mut reader)?;
        let data_offset = header.data_offset()?;

        let stream_size = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataRead("seek", e))?;
        if data_offset > stream_size {
            return Err(Error::Truncated {
                expected: data_offset,
                actual: stream_size,
            });
        }
        reader
            .seek(SeekFrom::Start(HEADER_SIZE))
            .map_err(|e| Error::DataRead("seek", e))?;

        let manifest_size = header
            .manifest_size
            .try_into()
            .map_err(|_| Error::IntegerTooLarge("manifest_size"))?;
        let manifest_raw = reader
            .read_vec_exact(manifest_size)
            .map_err(|e| Error::DataRead("manifest", e))?;

        let mut manifest = DeltaArchiveManifest::default();
        let manifest_error = manifest.merge(manifest_raw.as_slice()).err();

        if let Some(e) = &manifest_error {
            warn!("Manifest is only partially decodable: {e}");
        }

        let signatures_raw = reader
            .read_vec_exact(header.metadata_signature_size as usize)
            .map_err(|e| Error::DataRead("metadata_signatures", e))?;

        let mut metadata_signatures = Signatures::default();
        if let Err(e) = metadata_signatures.merge(signatures_raw.as_slice()) {
            debug!("Ignoring undecodable metadata signatures: {e}");
        }

        if manifest.block_size() != BLOCK_SIZE as u32 {
            warn!(
                "Manifest block size {} is not {BLOCK_SIZE}; ignoring",
                manifest.block_size(),
            );
        }

        Ok(Self {
            reader,
            header,
            manifest,
            manifest_error,
            metadata_signatures,
            data_offset,
        })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    pub fn manifest(&self) -> &DeltaArchiveManifest {
        &self.manifest
    }

    pub fn manifest_error(&self) -> Option<&DecodeError> {
        self.manifest_error.as_ref()
    }

    pub fn metadata_signatures(&self) -> &Signatures {
        &self.metadata_signatures
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
        self.manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Apply every operation for partition `name` to `writer` in manifest
    /// order. Later operations overwrite earlier ones where they overlap.
    pub fn reconstruct(
        &mut self,
        name: &str,
        mut writer: impl Write + Seek,
        cancel_signal: &AtomicBool,
    ) -> Result<Reconstruction> {
        let Self {
            reader,
            manifest,
            data_offset,
            ..
        } = self;

        let partition = manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
            .ok_or_else(|| Error::MissingPartition(name.to_owned()))?;

        debug!(
            "Reconstructing {name} from {} operations",
            partition.operations.len(),
        );

        let mut warnings = vec![];

        for (index, op) in partition.operations.iter().enumerate() {
            apply_operation(
                reader,
                &mut writer,
                *data_offset,
                index,
                op,
                &mut warnings,
                cancel_signal,
            )?;
        }

        writer.flush().map_err(|e| Error::DataWrite("flush", e))?;

        if warnings.is_empty() {
            Ok(Reconstruction::Verified)
        } else {
            for warning in &warnings {
                warn!("{name}: {warning}");
            }

            Ok(Reconstruction::Degraded(warnings))
        }
    }

    /// Reconstruct partition `name` into `<dir>/<name>.img`. The output file is
    /// removed if reconstruction fails.
    pub fn extract(
        &mut self,
        name: &str,
        dir: &Path,
        cancel_signal: &AtomicBool,
    ) -> Result<Reconstruction> {
        validate_partition_name(name)?;

        if self.partition(name).is_none() {
            return Err(Error::MissingPartition(name.to_owned()));
        }

        let path = dir.join(format!("{name}.img"));
        let file = File::create(&path).map_err(|e| Error::CreateOutput(path.clone(), e))?;

        let result = self.reconstruct(name, file, cancel_signal);

        if result.is_err() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove incomplete image: {path:?}: {e}");
            }
        }

        result
    }

    /// Reconstruct every partition in manifest order. A failure only affects
    /// the partition it occurred in. Cancellation stops before the next
    /// partition.
    pub fn extract_all(
        &mut self,
        dir: &Path,
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<(String, Result<Reconstruction>)>> {
        let names = self
            .manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.clone())
            .collect::<Vec<_>>();
        let mut results = Vec::with_capacity(names.len());

        for name in names {
            stream::check_cancel(cancel_signal).map_err(|e| Error::DataWrite("cancel", e))?;

            info!("Extracting {name} from payload");

            let result = self.extract(&name, dir, cancel_signal);

            match &result {
                Ok(Reconstruction::Verified) => {}
                Ok(Reconstruction::Degraded(w)) => {
                    warn!("{name}: Reconstructed with {} unverified operations", w.len());
                }
                Err(e) => warn!("{name}: Failed to reconstruct from payload: {e}"),
            }

            results.push((name, result));
        }

        Ok(results)
    }
}
