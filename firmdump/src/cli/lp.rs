// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::{
    format::{lp::Metadata, sparse},
    normalize,
};

fn read_metadata(path: &Path) -> Result<Metadata> {
    let mut reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {path:?}"))?;

    if sparse::check(&mut reader).with_context(|| format!("Failed to read: {path:?}"))? {
        bail!("Sparse image must be unpacked first with `sparse unpack`: {path:?}");
    }

    Metadata::read(reader).with_context(|| format!("Failed to read LP metadata: {path:?}"))
}

fn write_info(path: &Path, metadata: &Metadata) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(metadata)
        .with_context(|| format!("Failed to serialize LP info: {path:?}"))?;

    fs::write(path, data).with_context(|| format!("Failed to write LP info: {path:?}"))
}

fn display_metadata(cli: &LpCli, metadata: &Metadata) {
    if !cli.quiet {
        println!("{metadata:#?}");
    }
}

fn unpack_subcommand(lp_cli: &LpCli, cli: &UnpackCli, cancel_signal: &AtomicBool) -> Result<()> {
    fs::create_dir_all(&cli.output_images)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_images))?;

    let produced = normalize::expand_super(&cli.input, &cli.output_images, cancel_signal)
        .with_context(|| format!("Failed to unpack LP image: {:?}", cli.input))?;

    if !lp_cli.quiet {
        for name in &produced {
            println!("{name}");
        }
    }

    if let Some(path) = &cli.output_info {
        write_info(path, &read_metadata(&cli.input)?)?;
    }

    Ok(())
}

fn info_subcommand(lp_cli: &LpCli, cli: &InfoCli) -> Result<()> {
    let metadata = read_metadata(&cli.input)?;

    display_metadata(lp_cli, &metadata);

    if let Some(path) = &cli.output_info {
        write_info(path, &metadata)?;
    }

    Ok(())
}

pub fn lp_main(cli: &LpCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        LpCommand::Unpack(c) => unpack_subcommand(cli, c, cancel_signal),
        LpCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack an LP image.
///
/// Each logical partition in metadata slot 0 with data is extracted to
/// `<partition name>.img` in the output images directory. Sparse LP images are
/// unsparsed to a temporary file first. Empty images cannot be unpacked.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input LP image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output images directory.
    #[arg(long, value_name = "DIR", value_parser, default_value = "lp_images")]
    output_images: PathBuf,

    /// Path to output info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,
}

/// Display LP image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input LP image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum LpCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Unpack and inspect LP (super) images.
#[derive(Debug, Parser)]
pub struct LpCli {
    #[command(subcommand)]
    command: LpCommand,

    /// Don't print LP metadata information.
    #[arg(short, long, global = true)]
    quiet: bool,
}
