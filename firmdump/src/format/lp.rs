// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Read-only support for logical partition (dynamic partition) images, better
//! known as `super.img`. Only metadata slot 0 is used for extraction.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    path::Path,
    str,
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use ring::digest::{Context, SHA256};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    stream::{self, FromReader, ReadFixedSizeExt, WriteZerosExt},
    util,
};

/// Magic value for [`RawGeometry::magic`].
const GEOMETRY_MAGIC: u32 = 0x616c4467;

/// Padded size for storing a [`RawGeometry`].
const GEOMETRY_SIZE: u32 = 4096;

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0x414C5030;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 10;
/// Maximum supported minor version (inclusive).
pub const MINOR_VERSION_MAX: u16 = 2;

/// Metadata minor version needed for the 256-byte [`RawHeader`] instead of the
/// 128-byte header without [`RawHeader::flags`] and [`RawHeader::reserved`].
const VERSION_FOR_EXPANDED_HEADER: u16 = 2;

/// Size of a sector.
pub const SECTOR_SIZE: u32 = 512;

/// Padding at the beginning of a super image to avoid creating a boot sector.
const PARTITION_RESERVED_BYTES: u32 = 4096;

/// Maximum allowed size of [`RawGeometry::metadata_max_size`] to prevent the
/// memory usage from blowing up.
const METADATA_MAX_SIZE: u32 = 128 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition name: {0:?}")]
    PartitionNameInvalid(String),
    // Geometry errors.
    #[error("Invalid geometry magic: {0:#010x}")]
    GeometryInvalidMagic(u32),
    #[error("Invalid geometry size: {0} != {size}", size = mem::size_of::<RawGeometry>())]
    GeometryInvalidSize(u32),
    #[error("Expected geometry digest {expected}, but have {actual}")]
    GeometryInvalidDigest { expected: String, actual: String },
    #[error("Maximum metadata size is not sector-aligned: {0}")]
    MaxMetadataSizeUnaligned(u32),
    #[error("Maximum metadata size exceeds limit: {0} > {METADATA_MAX_SIZE}")]
    MaxMetadataSizeTooLarge(u32),
    #[error("No metadata slots defined")]
    NoMetadataSlots,
    // Header errors.
    #[error("Invalid header magic: {0:#010x}")]
    HeaderInvalidMagic(u32),
    #[error("Unsupported header version: {major}.{minor}")]
    HeaderUnsupportedVersion { major: u16, minor: u16 },
    #[error("Invalid header size: {0}")]
    HeaderInvalidSize(u32),
    #[error("Expected header digest {expected}, but have {actual}")]
    HeaderInvalidDigest { expected: String, actual: String },
    #[error("Tables size {tables_size} exceeds space left in metadata slot")]
    MetadataTooLarge { tables_size: u32 },
    #[error("Descriptors too large or have gaps")]
    DescriptorsInvalid,
    #[error("Expected tables digest {expected}, but have {actual}")]
    HeaderInvalidTablesDigest { expected: String, actual: String },
    // Table entry errors.
    #[error("Partition {name:?}: Extent indices out of bounds")]
    PartitionExtentIndicesTooLarge { name: String },
    #[error("Partition {name:?}: Invalid partition group index: {index}")]
    PartitionInvalidGroupIndex { name: String, index: u32 },
    #[error("Extent #{index}: Invalid block device index: {device_index}")]
    ExtentInvalidDeviceIndex { index: usize, device_index: u32 },
    #[error("Extent #{index}: Sectors {start}..{end} outside of block device")]
    ExtentOutOfBounds { index: usize, start: u64, end: u64 },
    #[error("Extent #{index}: Invalid type: {extent_type}")]
    ExtentInvalidType { index: usize, extent_type: u32 },
    // Extraction errors.
    #[error("Empty images contain no partition data")]
    EmptyImage,
    #[error("Partition {name:?}: Extent is on block device #{device_index}, not the super image")]
    ExtentOnOtherDevice { name: String, device_index: u32 },
    #[error("Failed to create output: {0:?}")]
    CreateOutput(std::path::PathBuf, #[source] io::Error),
    // Wrapped errors.
    #[error("Failed to read LP data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write partition data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the metadata geometry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGeometry {
    /// Magic value. This should be equal to [`GEOMETRY_MAGIC`].
    magic: little_endian::U32,
    /// Size of this [`RawGeometry`].
    struct_size: little_endian::U32,
    /// SHA-256 checksum of this [`RawGeometry`] when this field is set to all
    /// zeros.
    checksum: [u8; 32],
    /// Maximum size of a single copy of the metadata (header + tables).
    metadata_max_size: little_endian::U32,
    /// Number of metadata slots, excluding the backup copies.
    metadata_slot_count: little_endian::U32,
    /// Block device block size for the logical partitions.
    logical_block_size: little_endian::U32,
}

impl fmt::Debug for RawGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawGeometry")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("struct_size", &self.struct_size.get())
            .field("checksum", &hex::encode(self.checksum))
            .field("metadata_max_size", &self.metadata_max_size.get())
            .field("metadata_slot_count", &self.metadata_slot_count.get())
            .field("logical_block_size", &self.logical_block_size.get())
            .finish()
    }
}

impl RawGeometry {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != GEOMETRY_MAGIC {
            return Err(Error::GeometryInvalidMagic(self.magic.get()));
        }

        if self.struct_size.get() != mem::size_of::<Self>() as u32 {
            return Err(Error::GeometryInvalidSize(self.struct_size.get()));
        }

        let mut copy = *self;
        copy.checksum.fill(0);

        let digest = ring::digest::digest(&SHA256, copy.as_bytes());
        if digest.as_ref() != self.checksum {
            return Err(Error::GeometryInvalidDigest {
                expected: hex::encode(self.checksum),
                actual: hex::encode(digest),
            });
        }

        let max_size = self.metadata_max_size.get();
        if max_size == 0 || max_size % SECTOR_SIZE != 0 {
            return Err(Error::MaxMetadataSizeUnaligned(max_size));
        } else if max_size > METADATA_MAX_SIZE {
            return Err(Error::MaxMetadataSizeTooLarge(max_size));
        } else if self.metadata_slot_count.get() == 0 {
            return Err(Error::NoMetadataSlots);
        }

        Ok(())
    }
}

/// Raw on-disk layout for a table descriptor within a [`RawHeader`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawTableDescriptor {
    /// Offset relative to the end of the [`RawHeader`].
    offset: little_endian::U32,
    /// Number of entries in the table.
    num_entries: little_endian::U32,
    /// Size of each entry.
    entry_size: little_endian::U32,
}

impl RawTableDescriptor {
    /// Parse the table of `T` from the tables buffer. The descriptor must
    /// already have been checked against the header's tables size.
    fn parse<T: FromBytes + Immutable + Clone>(&self, buf: &[u8]) -> Result<Vec<T>> {
        if self.entry_size.get() as usize != mem::size_of::<T>() {
            return Err(Error::DescriptorsInvalid);
        }

        let offset = self.offset.get() as usize;
        let size = self.num_entries.get() as usize * mem::size_of::<T>();

        buf.get(offset..offset + size)
            .and_then(|b| <[T]>::ref_from_bytes(b).ok())
            .map(|items| items.to_vec())
            .ok_or(Error::DescriptorsInvalid)
    }

    /// Returns the offset of the next table if this one starts at
    /// `start_offset` and fits within `tables_size`.
    fn next_offset(&self, start_offset: u32, tables_size: u32) -> Option<u32> {
        if self.offset.get() != start_offset {
            return None;
        }

        let next = self
            .num_entries
            .get()
            .checked_mul(self.entry_size.get())
            .and_then(|s| s.checked_add(start_offset))?;

        (next <= tables_size).then_some(next)
    }
}

/// Raw on-disk layout for the metadata header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version.
    major_version: little_endian::U16,
    /// Minor version.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    header_size: little_endian::U32,
    /// SHA-256 checksum of this [`RawHeader`] when this field is set to all
    /// zeros.
    header_checksum: [u8; 32],
    /// Size of all tables.
    tables_size: little_endian::U32,
    /// SHA-256 checksum of all tables.
    tables_checksum: [u8; 32],
    partitions: RawTableDescriptor,
    extents: RawTableDescriptor,
    groups: RawTableDescriptor,
    block_devices: RawTableDescriptor,
    /// [Minor version >=2 only] Header flags.
    flags: little_endian::U32,
    /// [Minor version >=2 only] Reserved bytes for future header versions.
    reserved: [u8; 124],
}

impl RawHeader {
    const SIZE_V1_0: usize = mem::offset_of!(Self, flags);

    fn size(&self) -> usize {
        if self.minor_version.get() >= VERSION_FOR_EXPANDED_HEADER {
            mem::size_of::<Self>()
        } else {
            Self::SIZE_V1_0
        }
    }

    fn validate(&self, geometry: &RawGeometry) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::HeaderInvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION || self.minor_version.get() > MINOR_VERSION_MAX
        {
            return Err(Error::HeaderUnsupportedVersion {
                major: self.major_version.get(),
                minor: self.minor_version.get(),
            });
        }

        let size = self.size();
        if self.header_size.get() as usize != size {
            return Err(Error::HeaderInvalidSize(self.header_size.get()));
        }

        let mut copy = *self;
        copy.header_checksum.fill(0);

        let digest = ring::digest::digest(&SHA256, &copy.as_bytes()[..size]);
        if digest.as_ref() != self.header_checksum {
            return Err(Error::HeaderInvalidDigest {
                expected: hex::encode(self.header_checksum),
                actual: hex::encode(digest),
            });
        }

        // metadata_max_size is at least one sector and header_size is at most
        // 256 bytes.
        if self.tables_size.get() > geometry.metadata_max_size.get() - self.header_size.get() {
            return Err(Error::MetadataTooLarge {
                tables_size: self.tables_size.get(),
            });
        }

        // The tables must be contiguous with no trailing gap.
        let mut offset = 0;

        for descriptor in [
            &self.partitions,
            &self.extents,
            &self.groups,
            &self.block_devices,
        ] {
            offset = descriptor
                .next_offset(offset, self.tables_size.get())
                .ok_or(Error::DescriptorsInvalid)?;
        }

        if offset != self.tables_size.get() {
            return Err(Error::DescriptorsInvalid);
        }

        Ok(())
    }
}

/// A potentially invalid raw partition name string.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct PartitionName([u8; 36]);

impl PartitionName {
    fn as_str(&self) -> Result<&str> {
        let (prefix, suffix) = self
            .0
            .iter()
            .position(|b| *b == 0)
            .map_or((&self.0[..], &[][..]), |i| self.0.split_at(i));

        // AOSP creates partitions named like "system_b-cow".
        let prefix_valid = prefix
            .iter()
            .all(|b| matches!(*b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-'));

        if prefix_valid && util::is_zero(suffix) {
            // ASCII is always UTF-8.
            str::from_utf8(prefix).map_err(|_| Error::PartitionNameInvalid(String::new()))
        } else {
            Err(Error::PartitionNameInvalid(format!("{:?}", self.0.as_bstr())))
        }
    }
}

/// Raw on-disk layout for an entry in the logical partitions table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartition {
    name: PartitionName,
    attributes: little_endian::U32,
    /// Index of the first extent owned by this partition.
    first_extent_index: little_endian::U32,
    num_extents: little_endian::U32,
    /// Index of the group containing this partition.
    group_index: little_endian::U32,
}

/// Raw on-disk layout for an entry in the extent table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    num_sectors: little_endian::U64,
    /// device-mapper target type.
    target_type: little_endian::U32,
    /// Physical sector for linear extents. Always 0 for zero extents.
    target_data: little_endian::U64,
    /// Block device index for linear extents. Always 0 for zero extents.
    target_source: little_endian::U32,
}

impl RawExtent {
    /// dm-linear target.
    const TARGET_TYPE_LINEAR: u32 = 0;
    /// dm-zero target.
    const TARGET_TYPE_ZERO: u32 = 1;
}

/// Raw on-disk layout for an entry in the partition groups table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartitionGroup {
    name: PartitionName,
    flags: little_endian::U32,
    /// 0 means unlimited.
    maximum_size: little_endian::U64,
}

/// Raw on-disk layout for an entry in the block devices table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlockDevice {
    /// The first sector where data for the logical partitions can be
    /// allocated.
    first_logical_sector: little_endian::U64,
    alignment: little_endian::U32,
    alignment_offset: little_endian::U32,
    size: little_endian::U64,
    partition_name: PartitionName,
    flags: little_endian::U32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ImageType {
    /// A normal image containing partition data, with reserved bytes at the
    /// beginning and backup copies of the geometry and metadata.
    Normal,
    /// A fastboot-only image (`super_empty.img`) with a single copy of the
    /// geometry and metadata and no partition data.
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExtentType {
    Linear {
        start_sector: u64,
        block_device_index: u32,
    },
    Zero,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub num_sectors: u64,
    pub extent_type: ExtentType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub name: String,
    pub group: String,
    pub extents: Vec<Extent>,
}

impl Partition {
    /// Size in bytes when extracted.
    pub fn size(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| e.num_sectors * u64::from(SECTOR_SIZE))
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionGroup {
    pub name: String,
    /// [`None`] if the size is unlimited.
    pub maximum_size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub partition_name: String,
    pub first_logical_sector: u64,
    pub size: u64,
}

/// Parsed metadata for slot 0 of an LP image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub image_type: ImageType,
    pub metadata_max_size: u32,
    pub metadata_slot_count: u32,
    pub logical_block_size: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub partitions: Vec<Partition>,
    pub groups: Vec<PartitionGroup>,
    pub block_devices: Vec<BlockDevice>,
}

fn read_geometry_at(mut reader: impl Read + Seek, offset: u64) -> Result<RawGeometry> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::DataRead("geometry_seek", e))?;

    let buf = reader
        .read_array_exact::<{ GEOMETRY_SIZE as usize }>()
        .map_err(|e| Error::DataRead("geometry", e))?;

    let (geometry, _) =
        RawGeometry::read_from_prefix(&buf).map_err(|_| Error::GeometryInvalidSize(0))?;
    geometry.validate()?;

    Ok(geometry)
}

/// Read and validate one copy of a metadata slot, returning the header and
/// the raw tables.
fn read_slot_at(
    mut reader: impl Read + Seek,
    offset: u64,
    geometry: &RawGeometry,
) -> Result<(RawHeader, Vec<u8>)> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::DataRead("header_seek", e))?;

    let mut header = RawHeader::new_zeroed();

    reader
        .read_exact(&mut header.as_mut_bytes()[..RawHeader::SIZE_V1_0])
        .map_err(|e| Error::DataRead("header_v1.0", e))?;
    if header.size() > RawHeader::SIZE_V1_0 {
        reader
            .read_exact(&mut header.as_mut_bytes()[RawHeader::SIZE_V1_0..])
            .map_err(|e| Error::DataRead("header_v1.2", e))?;
    }

    header.validate(geometry)?;

    let tables = reader
        .read_vec_exact(header.tables_size.get() as usize)
        .map_err(|e| Error::DataRead("tables", e))?;

    let mut context = Context::new(&SHA256);
    context.update(&tables);
    let digest = context.finish();

    if digest.as_ref() != header.tables_checksum {
        return Err(Error::HeaderInvalidTablesDigest {
            expected: hex::encode(header.tables_checksum),
            actual: hex::encode(digest),
        });
    }

    Ok((header, tables))
}

impl Metadata {
    fn from_raw(
        image_type: ImageType,
        geometry: &RawGeometry,
        header: &RawHeader,
        tables: &[u8],
    ) -> Result<Self> {
        let raw_partitions = header.partitions.parse::<RawPartition>(tables)?;
        let raw_extents = header.extents.parse::<RawExtent>(tables)?;
        let raw_groups = header.groups.parse::<RawPartitionGroup>(tables)?;
        let raw_devices = header.block_devices.parse::<RawBlockDevice>(tables)?;

        let mut extents = Vec::with_capacity(raw_extents.len());

        for (index, raw_extent) in raw_extents.iter().enumerate() {
            let num_sectors = raw_extent.num_sectors.get();

            let extent_type = match raw_extent.target_type.get() {
                RawExtent::TARGET_TYPE_LINEAR => {
                    let device_index = raw_extent.target_source.get();
                    let device = raw_devices.get(device_index as usize).ok_or(
                        Error::ExtentInvalidDeviceIndex {
                            index,
                            device_index,
                        },
                    )?;

                    let start = raw_extent.target_data.get();
                    let end = start.checked_add(num_sectors);
                    let device_sectors = device.size.get() / u64::from(SECTOR_SIZE);

                    if start < device.first_logical_sector.get()
                        || end.is_none_or(|e| e > device_sectors)
                    {
                        return Err(Error::ExtentOutOfBounds {
                            index,
                            start,
                            end: end.unwrap_or(u64::MAX),
                        });
                    }

                    ExtentType::Linear {
                        start_sector: start,
                        block_device_index: device_index,
                    }
                }
                RawExtent::TARGET_TYPE_ZERO => ExtentType::Zero,
                n => {
                    return Err(Error::ExtentInvalidType {
                        index,
                        extent_type: n,
                    });
                }
            };

            extents.push(Extent {
                num_sectors,
                extent_type,
            });
        }

        let groups = raw_groups
            .iter()
            .map(|g| {
                Ok(PartitionGroup {
                    name: g.name.as_str()?.to_owned(),
                    maximum_size: Some(g.maximum_size.get()).filter(|s| *s != 0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut partitions = Vec::with_capacity(raw_partitions.len());

        for raw_partition in &raw_partitions {
            let name = raw_partition.name.as_str()?.to_owned();

            let first = raw_partition.first_extent_index.get() as usize;
            let count = raw_partition.num_extents.get() as usize;
            let partition_extents = first
                .checked_add(count)
                .and_then(|end| extents.get(first..end))
                .ok_or_else(|| Error::PartitionExtentIndicesTooLarge { name: name.clone() })?;

            let group_index = raw_partition.group_index.get();
            let group = groups.get(group_index as usize).ok_or_else(|| {
                Error::PartitionInvalidGroupIndex {
                    name: name.clone(),
                    index: group_index,
                }
            })?;

            partitions.push(Partition {
                name,
                group: group.name.clone(),
                extents: partition_extents.to_vec(),
            });
        }

        let block_devices = raw_devices
            .iter()
            .map(|d| {
                Ok(BlockDevice {
                    partition_name: d.partition_name.as_str()?.to_owned(),
                    first_logical_sector: d.first_logical_sector.get(),
                    size: d.size.get(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            image_type,
            metadata_max_size: geometry.metadata_max_size.get(),
            metadata_slot_count: geometry.metadata_slot_count.get(),
            logical_block_size: geometry.logical_block_size.get(),
            major_version: header.major_version.get(),
            minor_version: header.minor_version.get(),
            partitions,
            groups,
            block_devices,
        })
    }

    /// Read metadata slot 0 from an LP image. For normal images, the backup
    /// copies of the geometry and metadata are used if the primary copies are
    /// corrupt.
    pub fn read(mut reader: impl Read + Seek) -> Result<Self> {
        // Empty images have the geometry right at the start. Normal images
        // have it after the reserved area, which vendors sometimes fill with
        // their own signature structures.
        let (image_type, geometry, metadata_offset) = match read_geometry_at(&mut reader, 0) {
            Ok(g) => (ImageType::Empty, g, u64::from(GEOMETRY_SIZE)),
            Err(Error::GeometryInvalidMagic(_)) => {
                let primary = u64::from(PARTITION_RESERVED_BYTES);
                let backup = primary + u64::from(GEOMETRY_SIZE);

                let geometry = match read_geometry_at(&mut reader, primary) {
                    Ok(g) => g,
                    Err(e @ Error::DataRead(_, _)) => return Err(e),
                    Err(e) => {
                        warn!("Primary geometry is invalid, trying backup: {e}");
                        read_geometry_at(&mut reader, backup)?
                    }
                };

                (
                    ImageType::Normal,
                    geometry,
                    backup + u64::from(GEOMETRY_SIZE),
                )
            }
            Err(e) => return Err(e),
        };

        debug!("{image_type:?} image geometry: {geometry:?}");

        let (header, tables) = match read_slot_at(&mut reader, metadata_offset, &geometry) {
            Ok(slot) => slot,
            Err(e @ Error::DataRead(_, _)) => return Err(e),
            Err(e) if image_type == ImageType::Normal => {
                warn!("Primary metadata is invalid, trying backup: {e}");

                let backup_offset = metadata_offset
                    + u64::from(geometry.metadata_max_size.get())
                        * u64::from(geometry.metadata_slot_count.get());

                read_slot_at(&mut reader, backup_offset, &geometry)?
            }
            Err(e) => return Err(e),
        };

        Self::from_raw(image_type, &geometry, &header, &tables)
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

impl<R: Read + Seek> FromReader<R> for Metadata {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        Self::read(reader)
    }
}

/// Copy the contents of `partition` from the LP image to `writer`.
pub fn extract_partition(
    mut reader: impl Read + Seek,
    mut writer: impl Write,
    metadata: &Metadata,
    partition: &Partition,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    if metadata.image_type == ImageType::Empty {
        return Err(Error::EmptyImage);
    }

    for extent in &partition.extents {
        let size = extent.num_sectors * u64::from(SECTOR_SIZE);

        match extent.extent_type {
            ExtentType::Linear {
                start_sector,
                block_device_index: 0,
            } => {
                reader
                    .seek(SeekFrom::Start(start_sector * u64::from(SECTOR_SIZE)))
                    .map_err(|e| Error::DataRead("extent_seek", e))?;

                stream::copy_n(&mut reader, &mut writer, size, cancel_signal)
                    .map_err(|e| Error::DataRead("extent", e))?;
            }
            ExtentType::Linear {
                block_device_index, ..
            } => {
                return Err(Error::ExtentOnOtherDevice {
                    name: partition.name.clone(),
                    device_index: block_device_index,
                });
            }
            ExtentType::Zero => {
                stream::check_cancel(cancel_signal).map_err(|e| Error::DataWrite("zero", e))?;

                writer
                    .write_zeros_exact(size)
                    .map_err(|e| Error::DataWrite("zero", e))?;
            }
        }
    }

    writer.flush().map_err(|e| Error::DataWrite("flush", e))?;

    Ok(())
}

/// Extract every partition with at least one extent into `<dir>/<name>.img`.
/// A failure only affects the partition it occurred in and its output file is
/// removed.
pub fn extract_all(
    mut reader: impl Read + Seek,
    metadata: &Metadata,
    dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Vec<(String, Result<()>)>> {
    if metadata.image_type == ImageType::Empty {
        return Err(Error::EmptyImage);
    }

    let mut results = vec![];

    for partition in &metadata.partitions {
        if partition.extents.is_empty() {
            debug!("Skipping partition with no extents: {}", partition.name);
            continue;
        }

        stream::check_cancel(cancel_signal).map_err(|e| Error::DataWrite("cancel", e))?;

        info!(
            "Extracting {} from super image ({:?})",
            partition.name,
            util::NumBytes(partition.size()),
        );

        let path = dir.join(format!("{}.img", partition.name));

        let result = File::create(&path)
            .map_err(|e| Error::CreateOutput(path.clone(), e))
            .and_then(|file| {
                extract_partition(&mut reader, file, metadata, partition, cancel_signal)
            });

        if let Err(e) = &result {
            warn!("{}: Failed to extract from super image: {e}", partition.name);

            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove incomplete image: {path:?}: {e}");
                }
            }
        }

        results.push((partition.name.clone(), result));
    }

    Ok(results)
}
