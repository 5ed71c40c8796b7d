// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    format::sparse::{self, Chunk, CrcMode, Header, SparseReader},
    util::NumBytes,
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

struct Metadata {
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = u64::from(self.header.num_blocks) * u64::from(self.header.block_size);

        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("raw_size", &NumBytes(size))
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

fn open_reader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {path:?}"))
}

fn open_writer(path: &Path, truncate: bool) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .with_context(|| format!("Failed to open for writing: {path:?}"))
}

fn display_header(cli: &SparseCli, header: &Header) {
    if !cli.quiet {
        println!("{header:#?}");
    }
}

fn unpack_subcommand(
    sparse_cli: &SparseCli,
    cli: &UnpackCli,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let mut writer = open_writer(&cli.output, !cli.preserve)?;
    let crc_mode = if cli.crc {
        CrcMode::Validate
    } else {
        CrcMode::Ignore
    };

    let header = if cli.preserve {
        let header = sparse::decode_seekable(
            reader,
            BufWriter::new(&mut writer),
            crc_mode,
            cancel_signal,
        )
        .with_context(|| format!("Failed to unpack: {:?} -> {:?}", cli.input, cli.output))?;

        let size = u64::from(header.num_blocks) * u64::from(header.block_size);
        let cur_size = writer
            .metadata()
            .with_context(|| format!("Failed to get file size: {:?}", cli.output))?
            .len();

        if cur_size < size {
            writer
                .set_len(size)
                .with_context(|| format!("Failed to set file size: {:?}", cli.output))?;
        }

        header
    } else {
        sparse::decode(reader, BufWriter::new(&mut writer), crc_mode, cancel_signal)
            .with_context(|| format!("Failed to unpack: {:?} -> {:?}", cli.input, cli.output))?
    };

    display_header(sparse_cli, &header);

    Ok(())
}

fn pack_subcommand(
    sparse_cli: &SparseCli,
    cli: &PackCli,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let writer = open_writer(&cli.output, true)?;

    let header = sparse::encode(reader, BufWriter::new(writer), cli.block_size, cancel_signal)
        .with_context(|| format!("Failed to pack: {:?} -> {:?}", cli.input, cli.output))?;

    display_header(sparse_cli, &header);

    Ok(())
}

fn info_subcommand(sparse_cli: &SparseCli, cli: &InfoCli) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let mut sparse_reader = SparseReader::new_seekable(reader, CrcMode::Ignore)
        .with_context(|| format!("Failed to read sparse file: {:?}", cli.input))?;

    let mut metadata = Metadata {
        header: sparse_reader.header(),
        chunks: vec![],
    };

    while let Some(chunk) = sparse_reader
        .next_chunk()
        .with_context(|| format!("Failed to read chunk: {:?}", cli.input))?
    {
        metadata.chunks.push(chunk);
    }

    if !sparse_cli.quiet {
        println!("{metadata:#?}");
    }

    Ok(())
}

pub fn sparse_main(cli: &SparseCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        SparseCommand::Unpack(c) => unpack_subcommand(cli, c, cancel_signal),
        SparseCommand::Pack(c) => pack_subcommand(cli, c, cancel_signal),
        SparseCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack a sparse image.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Preserve existing data in the output file.
    ///
    /// Don't care chunks are skipped instead of written as zeros. This is
    /// useful when unpacking multiple sparse files into a single output file
    /// because they contain disjoint blocks of data.
    #[arg(long)]
    preserve: bool,

    /// Validate CRC32 checksums.
    #[arg(long)]
    crc: bool,
}

/// Pack a sparse image.
#[derive(Debug, Parser)]
struct PackCli {
    /// Path to output sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to input raw image.
    ///
    /// The size must be a multiple of the block size.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Block size.
    #[arg(short, long, value_name = "BYTES", default_value_t = 4096)]
    block_size: u32,
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SparseCommand {
    Unpack(UnpackCli),
    Pack(PackCli),
    Info(InfoCli),
}

/// Pack, unpack, and inspect sparse images.
#[derive(Debug, Parser)]
pub struct SparseCli {
    #[command(subcommand)]
    command: SparseCommand,

    /// Don't print sparse image metadata.
    #[arg(short, long, global = true)]
    quiet: bool,
}
