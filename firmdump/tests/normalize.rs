// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{Cursor, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use firmdump::{
    format::sparse::{self, Chunk, ChunkBounds, ChunkData, Header, SparseWriter},
    normalize::{self, NormalizeOutcome},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate, install_operation::Type,
    },
    taxonomy::Taxonomy,
};
use prost::Message;

const BLOCK_SIZE: usize = 4096;

fn file_names(dir: &Path) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    names.sort();
    names
}

/// Single uncompressed meta-block brotli stream.
fn brotli_stored(data: &[u8]) -> Vec<u8> {
    let m = data.len() - 1;
    let mut result = vec![
        ((m & 0xf) << 4) as u8,
        ((m >> 4) & 0xff) as u8,
        ((m >> 12) & 0xf) as u8 | 0x10,
    ];
    result.extend_from_slice(data);
    result.push(0x03);
    result
}

/// Sparse image where the blocks in `data_blocks` are filled with `byte` and
/// everything else is a hole.
fn sparse_fragment(num_blocks: u32, data_blocks: (u32, u32), byte: u8) -> Vec<u8> {
    let mut chunks = vec![];
    if data_blocks.0 > 0 {
        chunks.push((0, data_blocks.0, ChunkData::Hole));
    }
    chunks.push((data_blocks.0, data_blocks.1, ChunkData::Data));
    if data_blocks.1 < num_blocks {
        chunks.push((data_blocks.1, num_blocks, ChunkData::Hole));
    }

    let header = Header {
        major_version: sparse::MAJOR_VERSION,
        minor_version: sparse::MINOR_VERSION,
        block_size: BLOCK_SIZE as u32,
        num_blocks,
        num_chunks: chunks.len() as u32,
        crc32: 0,
    };
    let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header).unwrap();

    for (start, end, data) in chunks {
        writer
            .start_chunk(Chunk {
                bounds: ChunkBounds { start, end },
                data,
            })
            .unwrap();

        if data == ChunkData::Data {
            let size = (end - start) as usize * BLOCK_SIZE;
            writer.write_all(&vec![byte; size]).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

fn expected_image(parts: &[(u8, usize)]) -> Vec<u8> {
    parts
        .iter()
        .flat_map(|(byte, blocks)| vec![*byte; blocks * BLOCK_SIZE])
        .collect()
}

#[test]
fn raw_image_is_idempotent() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();
    fs::write(dir.join("system.img"), b"raw system image").unwrap();

    for _ in 0..2 {
        assert_eq!(
            normalize::normalize("system", dir, &cancel_signal).unwrap(),
            NormalizeOutcome::Normalized(dir.join("system.img")),
        );
        assert_eq!(fs::read(dir.join("system.img")).unwrap(), b"raw system image");
        assert_eq!(file_names(dir), ["system.img"]);
    }
}

#[test]
fn brotli_transfer_list() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    let new_data = expected_image(&[(0x42, 1), (0x43, 1)]);
    fs::write(dir.join("vendor.new.dat.br"), brotli_stored(&new_data)).unwrap();
    fs::write(
        dir.join("vendor.transfer.list"),
        "4\n2\n0\n0\nerase 2,0,4\nnew 4,2,3,0,1\nzero 2,3,4\n",
    )
    .unwrap();

    assert_eq!(
        normalize::normalize("vendor", dir, &cancel_signal).unwrap(),
        NormalizeOutcome::Normalized(dir.join("vendor.img")),
    );
    assert_eq!(
        fs::read(dir.join("vendor.img")).unwrap(),
        expected_image(&[(0x43, 1), (0, 1), (0x42, 1), (0, 1)]),
    );
    assert_eq!(file_names(dir), ["vendor.img"]);
}

#[test]
fn merge_sparse_chunks() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    // Numeric ordering, not lexicographic.
    fs::write(dir.join("system.img_sparsechunk.0"), sparse_fragment(12, (0, 1), 0x10)).unwrap();
    fs::write(dir.join("system.img_sparsechunk.2"), sparse_fragment(12, (1, 2), 0x12)).unwrap();
    fs::write(dir.join("system.img_sparsechunk.10"), sparse_fragment(12, (2, 3), 0x1a)).unwrap();

    assert_eq!(
        normalize::normalize("system", dir, &cancel_signal).unwrap(),
        NormalizeOutcome::Normalized(dir.join("system.img")),
    );
    assert_eq!(
        fs::read(dir.join("system.img")).unwrap(),
        expected_image(&[(0x10, 1), (0x12, 1), (0x1a, 1), (0, 9)]),
    );
    assert_eq!(file_names(dir), ["system.img"]);
}

#[test]
fn lz4_image() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(b"ANDROID!boot image").unwrap();
    fs::write(dir.join("boot.img.lz4"), encoder.finish().unwrap()).unwrap();

    assert_eq!(
        normalize::normalize("boot", dir, &cancel_signal).unwrap(),
        NormalizeOutcome::Normalized(dir.join("boot.img")),
    );
    assert_eq!(fs::read(dir.join("boot.img")).unwrap(), b"ANDROID!boot image");
    assert_eq!(file_names(dir), ["boot.img"]);
}

#[test]
fn sparse_and_renamed_candidates() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    fs::write(dir.join("odm.img"), sparse_fragment(2, (0, 1), 0x0d)).unwrap();
    fs::write(dir.join("tz.mbn"), b"trustzone").unwrap();

    assert_eq!(
        normalize::normalize("odm", dir, &cancel_signal).unwrap(),
        NormalizeOutcome::Normalized(dir.join("odm.img")),
    );
    assert_eq!(
        fs::read(dir.join("odm.img")).unwrap(),
        expected_image(&[(0x0d, 1), (0, 1)]),
    );

    assert_eq!(
        normalize::normalize("tz", dir, &cancel_signal).unwrap(),
        NormalizeOutcome::Normalized(dir.join("tz.img")),
    );
    assert_eq!(fs::read(dir.join("tz.img")).unwrap(), b"trustzone");

    assert_eq!(file_names(dir), ["odm.img", "tz.img"]);
}

#[test]
fn normalize_all_and_canonicalize() {
    let cancel_signal = AtomicBool::new(false);
    let taxonomy = Taxonomy::default();
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    fs::write(dir.join("modem.img"), b"modem").unwrap();
    fs::write(dir.join("NON-HLOS.bin"), b"NON-HLOS").unwrap();
    fs::write(dir.join("boot_a.img"), b"boot_a").unwrap();
    fs::write(dir.join("boot_b.img"), b"boot_b").unwrap();
    fs::write(dir.join("dtbo-verified.img"), b"dtbo").unwrap();
    fs::write(dir.join("readme.txt"), b"not a partition").unwrap();

    let results = normalize::normalize_all(&taxonomy, dir, &cancel_signal).unwrap();
    let names = results.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["boot_a", "boot_b", "dtbo-verified", "modem", "NON-HLOS"]);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let present = normalize::canonicalize_names(&taxonomy, dir).unwrap();
    assert_eq!(
        present.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        ["boot", "dtbo", "modem"],
    );

    assert_eq!(fs::read(dir.join("modem.img")).unwrap(), b"modem");
    assert_eq!(fs::read(dir.join("boot.img")).unwrap(), b"boot_a");
    assert_eq!(fs::read(dir.join("dtbo.img")).unwrap(), b"dtbo");
    assert_eq!(
        file_names(dir),
        ["boot.img", "dtbo.img", "modem.img", "readme.txt"],
    );
}

#[test]
fn alias_wins_without_canonical_file() {
    let taxonomy = Taxonomy::default();
    let temp_dir = tempfile::tempdir().unwrap();
    let dir = temp_dir.path();

    fs::write(dir.join("NON-HLOS.img"), b"NON-HLOS").unwrap();

    let present = normalize::canonicalize_names(&taxonomy, dir).unwrap();
    assert!(present.contains("modem"));
    assert_eq!(fs::read(dir.join("modem.img")).unwrap(), b"NON-HLOS");
    assert_eq!(file_names(dir), ["modem.img"]);
}

#[test]
fn stage_inputs_copies_known_partitions() {
    let cancel_signal = AtomicBool::new(false);
    let taxonomy = Taxonomy::default();
    let input = tempfile::tempdir().unwrap();
    let raw = tempfile::tempdir().unwrap();

    fs::write(input.path().join("system.new.dat.br"), b"br").unwrap();
    fs::write(input.path().join("system.transfer.list"), b"list").unwrap();
    fs::write(input.path().join("payload.bin"), b"payload").unwrap();
    fs::write(input.path().join("readme.txt"), b"text").unwrap();
    fs::write(raw.path().join("system.transfer.list"), b"existing").unwrap();

    let count =
        normalize::stage_inputs(&taxonomy, input.path(), raw.path(), &cancel_signal).unwrap();
    assert_eq!(count, 1);
    assert_eq!(
        file_names(raw.path()),
        ["system.new.dat.br", "system.transfer.list"],
    );
    assert_eq!(
        fs::read(raw.path().join("system.transfer.list")).unwrap(),
        b"existing",
    );

    // The input is untouched.
    assert_eq!(file_names(input.path()).len(), 4);
}

#[test]
fn expand_payload_container() {
    let cancel_signal = AtomicBool::new(false);
    let input = tempfile::tempdir().unwrap();
    let raw = tempfile::tempdir().unwrap();

    let manifest = DeltaArchiveManifest {
        partitions: vec![PartitionUpdate {
            partition_name: "system".to_owned(),
            operations: vec![InstallOperation {
                r#type: Type::Zero as i32,
                dst_extents: vec![Extent {
                    start_block: Some(0),
                    num_blocks: Some(2),
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
    .encode_to_vec();

    let mut payload = b"CrAU".to_vec();
    payload.extend_from_slice(&2u64.to_be_bytes());
    payload.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&manifest);

    fs::write(input.path().join("payload.bin"), payload).unwrap();
    // Not a valid super image, so it is skipped.
    fs::write(input.path().join("super.img"), b"garbage").unwrap();
    // Never opened.
    fs::write(input.path().join("super_empty.img"), b"garbage").unwrap();

    let produced =
        normalize::expand_containers(input.path(), raw.path(), &cancel_signal).unwrap();
    assert_eq!(produced, ["system"]);
    assert_eq!(file_names(raw.path()), ["system.img"]);
    assert_eq!(
        fs::read(raw.path().join("system.img")).unwrap(),
        vec![0u8; 2 * BLOCK_SIZE],
    );
}

#[test]
fn cancelled_before_work() {
    let cancel_signal = AtomicBool::new(true);
    let taxonomy = Taxonomy::default();
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(temp_dir.path().join("system.img"), b"system").unwrap();

    let err = normalize::normalize_all(&taxonomy, temp_dir.path(), &cancel_signal).unwrap_err();
    assert!(normalize::is_cancelled(&err));
}
