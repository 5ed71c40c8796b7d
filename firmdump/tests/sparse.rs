// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File, OpenOptions},
    io::{Cursor, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use firmdump::format::sparse::{
    self, Chunk, ChunkBounds, ChunkData, CrcMode, Error, Header, SparseReader, SparseWriter,
};

/// Build a sparse image from chunks. Data chunks are filled with `data_byte`.
fn build_image(block_size: u32, crc32: u32, chunks: &[Chunk], data_byte: u8) -> Vec<u8> {
    let header = Header {
        major_version: sparse::MAJOR_VERSION,
        minor_version: sparse::MINOR_VERSION,
        block_size,
        num_blocks: chunks.last().map_or(0, |c| c.bounds.end),
        num_chunks: chunks.len() as u32,
        crc32,
    };

    let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header).unwrap();

    for chunk in chunks {
        writer.start_chunk(*chunk).unwrap();

        if chunk.data == ChunkData::Data {
            let size = chunk.bounds.len() as usize * block_size as usize;
            writer.write_all(&vec![data_byte; size]).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

fn chunk(start: u32, end: u32, data: ChunkData) -> Chunk {
    Chunk {
        bounds: ChunkBounds { start, end },
        data,
    }
}

#[test]
fn raw_and_fill_chunk_scenarios() {
    let cancel_signal = AtomicBool::new(false);

    for (data, byte) in [(ChunkData::Data, 0xab), (ChunkData::Fill(0xabababab), 0)] {
        let image = build_image(4096, 0, &[chunk(0, 2, data)], byte);

        assert!(sparse::check(Cursor::new(&image)).unwrap());
        // Canonical header sizes.
        assert_eq!(&image[8..12], &[28, 0, 12, 0]);

        let mut output = vec![];
        let header =
            sparse::decode(Cursor::new(&image), &mut output, CrcMode::Validate, &cancel_signal)
                .unwrap();

        assert_eq!(header.num_blocks, 2);
        assert_eq!(output, vec![0xab; 8192]);
    }
}

#[test]
fn decode_with_checksum() {
    let cancel_signal = AtomicBool::new(false);
    let chunks = [
        chunk(0, 1, ChunkData::Data),
        chunk(1, 3, ChunkData::Hole),
        chunk(3, 4, ChunkData::Fill(0x01020304)),
    ];

    let mut expected = vec![0x5a; 64];
    expected.extend_from_slice(&[0u8; 128]);
    expected.extend_from_slice(&[4, 3, 2, 1].repeat(16));

    let image = build_image(64, crc32fast::hash(&expected), &chunks, 0x5a);

    let mut output = vec![];
    sparse::decode(Cursor::new(&image), &mut output, CrcMode::Validate, &cancel_signal).unwrap();
    assert_eq!(output, expected);

    // Corrupt the header checksum.
    let mut corrupt = image.clone();
    corrupt[24] ^= 0xff;

    let mut output = vec![];
    assert_matches!(
        sparse::decode(Cursor::new(&corrupt), &mut output, CrcMode::Validate, &cancel_signal),
        Err(Error::MismatchedCrc32Final { .. })
    );

    let mut output = vec![];
    sparse::decode(Cursor::new(&corrupt), &mut output, CrcMode::Ignore, &cancel_signal).unwrap();
    assert_eq!(output, expected);
}

#[test]
fn encode_then_read_chunks() {
    let cancel_signal = AtomicBool::new(false);

    let mut raw = vec![0xab; 4096];
    raw.extend((0..4096).map(|i| (i % 251) as u8));
    raw.extend_from_slice(&[0u8; 8192]);

    let mut encoded = vec![];
    let header = sparse::encode(Cursor::new(&raw), &mut encoded, 4096, &cancel_signal).unwrap();

    assert_eq!(header.num_blocks, 4);
    assert_eq!(header.num_chunks, 3);
    assert_eq!(header.crc32, crc32fast::hash(&raw));

    let mut reader = SparseReader::new(Cursor::new(&encoded), CrcMode::Validate).unwrap();
    assert_eq!(reader.header(), header);

    let mut chunks = vec![];
    while let Some(c) = reader.next_chunk().unwrap() {
        if c.data == ChunkData::Data {
            std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        }
        chunks.push(c);
    }
    reader.finish().unwrap();

    assert_eq!(
        chunks,
        [
            chunk(0, 1, ChunkData::Fill(0xabababab)),
            chunk(1, 2, ChunkData::Data),
            chunk(2, 4, ChunkData::Fill(0)),
        ],
    );

    let mut decoded = vec![];
    sparse::decode(Cursor::new(&encoded), &mut decoded, CrcMode::Validate, &cancel_signal)
        .unwrap();
    assert_eq!(decoded, raw);
}

#[test]
fn merge_disjoint_images_into_file() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("merged.img");

    // Each fragment covers the whole image, with holes where the other
    // fragment's data lives.
    let first = build_image(
        16,
        0,
        &[chunk(0, 2, ChunkData::Data), chunk(2, 4, ChunkData::Hole)],
        0x11,
    );
    let second = build_image(
        16,
        0,
        &[chunk(0, 2, ChunkData::Hole), chunk(2, 4, ChunkData::Data)],
        0x22,
    );

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();

    for fragment in [&first, &second] {
        std::io::Seek::rewind(&mut file).unwrap();
        sparse::decode_seekable(Cursor::new(fragment), &mut file, CrcMode::Ignore, &cancel_signal)
            .unwrap();
    }
    drop(file);

    let mut expected = vec![0x11; 32];
    expected.extend_from_slice(&[0x22; 32]);
    assert_eq!(fs::read(&path).unwrap(), expected);

    // A trailing hole leaves the size to the caller.
    let path = temp_dir.path().join("trailing.img");
    let mut file = File::create(&path).unwrap();
    sparse::decode_seekable(Cursor::new(&first), &mut file, CrcMode::Ignore, &cancel_signal)
        .unwrap();
    assert_eq!(file.metadata().unwrap().len(), 32);
}

#[test]
fn unknown_chunk_is_skipped() {
    let cancel_signal = AtomicBool::new(false);
    let mut image = build_image(4096, 0, &[chunk(0, 1, ChunkData::Data)], 0xcd);

    // Insert a chunk of type 0xcac5 with a 4-byte payload before the data.
    let mut unknown = vec![0xc5, 0xca, 0, 0];
    unknown.extend_from_slice(&0u32.to_le_bytes());
    unknown.extend_from_slice(&16u32.to_le_bytes());
    unknown.extend_from_slice(b"\xde\xad\xbe\xef");
    image.splice(28..28, unknown);
    image[20..24].copy_from_slice(&2u32.to_le_bytes());

    let mut output = vec![];
    let header =
        sparse::decode(Cursor::new(&image), &mut output, CrcMode::Validate, &cancel_signal)
            .unwrap();

    assert_eq!(header.num_chunks, 2);
    assert_eq!(output, vec![0xcd; 4096]);
}

#[test]
fn not_sparse() {
    assert!(!sparse::check(Cursor::new(b"ANDROID!")).unwrap());
    assert!(!sparse::check(Cursor::new(vec![0u8; 4096])).unwrap());
    assert!(!sparse::check(Cursor::new(b"")).unwrap());
}

#[test]
fn cancel_decoding() {
    let cancel_signal = AtomicBool::new(true);
    let image = build_image(4096, 0, &[chunk(0, 2, ChunkData::Fill(0))], 0);

    let mut output = vec![];
    let err = sparse::decode(Cursor::new(&image), &mut output, CrcMode::Ignore, &cancel_signal)
        .unwrap_err();
    assert!(firmdump::normalize::is_cancelled(&err));
}
