// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{Cursor, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use firmdump::{
    format::payload::{self, Payload, Reconstruction, WarningKind},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate, Signatures,
        install_operation::Type, signatures::Signature,
    },
};
use prost::Message;

const BLOCK_SIZE: usize = 4096;

#[derive(Default)]
struct PayloadBuilder {
    manifest: DeltaArchiveManifest,
    blob: Vec<u8>,
}

impl PayloadBuilder {
    fn partition(&mut self, name: &str) -> usize {
        self.manifest.partitions.push(PartitionUpdate {
            partition_name: name.to_owned(),
            ..Default::default()
        });

        self.manifest.partitions.len() - 1
    }

    /// Append an operation. If `data` is not empty, it is appended to the data
    /// blob. `hash` overrides the sha256 digest of `data`.
    fn op(
        &mut self,
        partition: usize,
        kind: Type,
        data: &[u8],
        start_block: u64,
        num_blocks: u64,
        hash: Option<Vec<u8>>,
    ) {
        let mut op = InstallOperation {
            r#type: kind as i32,
            dst_extents: vec![Extent {
                start_block: Some(start_block),
                num_blocks: Some(num_blocks),
            }],
            ..Default::default()
        };

        if !data.is_empty() {
            op.data_offset = Some(self.blob.len() as u64);
            op.data_length = Some(data.len() as u64);
            op.data_sha256_hash = Some(hash.unwrap_or_else(|| sha256(data)));
            self.blob.extend_from_slice(data);
        }

        self.manifest.partitions[partition].operations.push(op);
    }

    fn build_with_manifest(&self, manifest_raw: &[u8]) -> Vec<u8> {
        let signatures = Signatures {
            signatures: vec![Signature {
                version: Some(2),
                data: Some(b"not a real signature".to_vec()),
                ..Default::default()
            }],
        }
        .encode_to_vec();

        let mut data = b"CrAU".to_vec();
        data.extend_from_slice(&2u64.to_be_bytes());
        data.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
        data.extend_from_slice(&(signatures.len() as u32).to_be_bytes());
        data.extend_from_slice(manifest_raw);
        data.extend_from_slice(&signatures);
        data.extend_from_slice(&self.blob);

        data
    }

    fn build(&self) -> Vec<u8> {
        self.build_with_manifest(&self.manifest.encode_to_vec())
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = liblzma::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn bz(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn zero_operation() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let mut builder = PayloadBuilder::default();
    let boot = builder.partition("boot");
    builder.op(boot, Type::Zero, &[], 0, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();
    assert!(payload.manifest_error().is_none());
    assert_eq!(payload.metadata_signatures().signatures.len(), 1);

    let result = payload.extract("boot", temp_dir.path(), &cancel_signal).unwrap();
    assert_eq!(result, Reconstruction::Verified);
    assert_eq!(
        fs::read(temp_dir.path().join("boot.img")).unwrap(),
        vec![0u8; BLOCK_SIZE],
    );
}

#[test]
fn replace_operations() {
    let cancel_signal = AtomicBool::new(false);

    let mut builder = PayloadBuilder::default();
    let system = builder.partition("system");
    builder.op(system, Type::Replace, &[0x11; BLOCK_SIZE], 0, 1, None);
    builder.op(system, Type::ReplaceXz, &xz(&[0x22; BLOCK_SIZE]), 1, 1, None);
    builder.op(system, Type::ReplaceBz, &bz(&[0x33; 2 * BLOCK_SIZE]), 2, 2, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();

    let mut writer = Cursor::new(Vec::new());
    let result = payload
        .reconstruct("system", &mut writer, &cancel_signal)
        .unwrap();
    assert!(result.is_verified());

    let mut expected = vec![0x11; BLOCK_SIZE];
    expected.extend_from_slice(&[0x22; BLOCK_SIZE]);
    expected.extend_from_slice(&[0x33; 2 * BLOCK_SIZE]);
    assert_eq!(writer.into_inner(), expected);
}

#[test]
fn overlapping_operations_last_write_wins() {
    let cancel_signal = AtomicBool::new(false);

    let mut builder = PayloadBuilder::default();
    let vendor = builder.partition("vendor");
    builder.op(vendor, Type::Replace, &[0xaa; 2 * BLOCK_SIZE], 0, 2, None);
    builder.op(vendor, Type::Replace, &[0xbb; BLOCK_SIZE], 1, 1, None);
    builder.op(vendor, Type::Zero, &[], 0, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();

    let mut writer = Cursor::new(Vec::new());
    payload
        .reconstruct("vendor", &mut writer, &cancel_signal)
        .unwrap();

    let mut expected = vec![0x00; BLOCK_SIZE];
    expected.extend_from_slice(&[0xbb; BLOCK_SIZE]);
    assert_eq!(writer.into_inner(), expected);
}

#[test]
fn unverifiable_operations_are_degraded() {
    let cancel_signal = AtomicBool::new(false);

    let mut builder = PayloadBuilder::default();
    let odm = builder.partition("odm");
    builder.op(odm, Type::Replace, &[0x44; BLOCK_SIZE], 0, 1, Some(vec![0; 32]));
    builder.op(odm, Type::Replace, &[0x55; 100], 1, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();

    let mut writer = Cursor::new(Vec::new());
    let result = payload
        .reconstruct("odm", &mut writer, &cancel_signal)
        .unwrap();

    let warnings = result.warnings();
    assert_eq!(warnings.len(), 2);
    assert_eq!(warnings[0].index, 0);
    assert_matches!(warnings[0].kind, WarningKind::HashMismatch { .. });
    assert_eq!(warnings[1].index, 1);
    assert_eq!(
        warnings[1].kind,
        WarningKind::LengthMismatch {
            expected: BLOCK_SIZE as u64,
            actual: 100,
        },
    );

    // The data is still written.
    let data = writer.into_inner();
    assert_eq!(&data[..BLOCK_SIZE], &[0x44; BLOCK_SIZE]);
    assert_eq!(&data[BLOCK_SIZE..], &[0x55; 100]);
}

#[test]
fn unsupported_operation_removes_output() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let mut builder = PayloadBuilder::default();
    let boot = builder.partition("boot");
    builder.op(boot, Type::Zero, &[], 0, 1, None);
    let vendor = builder.partition("vendor");
    builder.op(vendor, Type::Replace, &[0x66; BLOCK_SIZE], 0, 1, None);
    builder.op(vendor, Type::SourceCopy, &[], 1, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();
    let results = payload.extract_all(temp_dir.path(), &cancel_signal).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "boot");
    assert_matches!(results[0].1, Ok(Reconstruction::Verified));
    assert_eq!(results[1].0, "vendor");
    assert_matches!(
        &results[1].1,
        Err(payload::Error::UnsupportedOperation { index: 1, kind }) if kind == "SOURCE_COPY"
    );

    assert!(temp_dir.path().join("boot.img").exists());
    assert!(!temp_dir.path().join("vendor.img").exists());
}

#[test]
fn partially_decodable_manifest() {
    let cancel_signal = AtomicBool::new(false);

    let mut builder = PayloadBuilder::default();
    let boot = builder.partition("boot");
    builder.op(boot, Type::Replace, &[0x77; BLOCK_SIZE], 0, 1, None);

    // Field 1 with the invalid wire type 7.
    let mut manifest_raw = builder.manifest.encode_to_vec();
    manifest_raw.push(0x0f);

    let mut payload = Payload::open(Cursor::new(builder.build_with_manifest(&manifest_raw)))
        .unwrap();
    assert!(payload.manifest_error().is_some());
    assert!(payload.partition("boot").is_some());

    let mut writer = Cursor::new(Vec::new());
    payload
        .reconstruct("boot", &mut writer, &cancel_signal)
        .unwrap();
    assert_eq!(writer.into_inner(), vec![0x77; BLOCK_SIZE]);
}

#[test]
fn missing_partition() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let mut builder = PayloadBuilder::default();
    builder.partition("boot");

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();
    assert_matches!(
        payload.extract("system", temp_dir.path(), &cancel_signal),
        Err(payload::Error::MissingPartition(n)) if n == "system"
    );
    assert!(!temp_dir.path().join("system.img").exists());
}

#[test]
fn cancel_extraction() {
    let cancel_signal = AtomicBool::new(true);
    let temp_dir = tempfile::tempdir().unwrap();

    let mut builder = PayloadBuilder::default();
    let boot = builder.partition("boot");
    builder.op(boot, Type::Zero, &[], 0, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();
    let err = payload
        .extract_all(temp_dir.path(), &cancel_signal)
        .unwrap_err();

    assert!(firmdump::normalize::is_cancelled(&err));
    assert!(!temp_dir.path().join("boot.img").exists());
}

#[test]
fn operation_output_is_bounded_by_extent() {
    let cancel_signal = AtomicBool::new(false);

    let mut builder = PayloadBuilder::default();
    let system = builder.partition("system");
    builder.op(system, Type::Replace, &[0xbb; BLOCK_SIZE], 1, 1, None);
    builder.op(system, Type::Replace, &[0xdd; BLOCK_SIZE], 3, 1, None);
    builder.op(system, Type::Replace, &[0xaa; 2 * BLOCK_SIZE], 0, 1, None);
    builder.op(system, Type::ReplaceXz, &xz(&[0xcc; 2 * BLOCK_SIZE]), 2, 1, None);

    let mut payload = Payload::open(Cursor::new(builder.build())).unwrap();

    let mut writer = Cursor::new(Vec::new());
    let result = payload
        .reconstruct("system", &mut writer, &cancel_signal)
        .unwrap();

    let warnings = result.warnings();
    assert_eq!(warnings.len(), 2);
    for (warning, index) in warnings.iter().zip([2, 3]) {
        assert_eq!(warning.index, index);
        assert_eq!(
            warning.kind,
            WarningKind::LengthMismatch {
                expected: BLOCK_SIZE as u64,
                actual: 2 * BLOCK_SIZE as u64,
            },
        );
    }

    let mut expected = vec![0xaa; BLOCK_SIZE];
    expected.extend_from_slice(&[0xbb; BLOCK_SIZE]);
    expected.extend_from_slice(&[0xcc; BLOCK_SIZE]);
    expected.extend_from_slice(&[0xdd; BLOCK_SIZE]);
    assert_eq!(writer.into_inner(), expected);
}

#[test]
fn metadata_larger_than_file() {
    let header = |manifest_size: u64, signature_size: u32| {
        let mut data = b"CrAU".to_vec();
        data.extend_from_slice(&2u64.to_be_bytes());
        data.extend_from_slice(&manifest_size.to_be_bytes());
        data.extend_from_slice(&signature_size.to_be_bytes());
        data
    };

    assert_matches!(
        Payload::open(Cursor::new(header(1 << 63, 0))).err(),
        Some(payload::Error::Truncated { expected, actual: 24 }) if expected == (1 << 63) + 24
    );
    assert_matches!(
        Payload::open(Cursor::new(header(0, u32::MAX))).err(),
        Some(payload::Error::Truncated { actual: 24, .. })
    );
}
