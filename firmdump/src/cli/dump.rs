// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::{
    config::{self, Config},
    dispatch::{self, Extraction},
    normalize::{self, NormalizeOutcome},
};

/// Where normalized images are staged. A temporary directory is removed when
/// this is dropped.
enum RawDir {
    Kept(PathBuf),
    Temp(TempDir),
}

impl RawDir {
    fn new(cli: &DumpCli) -> Result<Self> {
        if let Some(path) = &cli.raw_dir {
            fs::create_dir_all(path)
                .with_context(|| format!("Failed to create directory: {path:?}"))?;
            Ok(Self::Kept(path.clone()))
        } else if cli.keep_raw {
            let path = cli.output.join("raw_images");
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create directory: {path:?}"))?;
            Ok(Self::Kept(path))
        } else {
            let temp = tempfile::Builder::new()
                .prefix(".raw-")
                .tempdir_in(&cli.output)
                .with_context(|| {
                    format!("Failed to create temporary directory in: {:?}", cli.output)
                })?;
            Ok(Self::Temp(temp))
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Kept(p) => p,
            Self::Temp(t) => t.path(),
        }
    }
}

pub fn dump_main(cli: &DumpCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let taxonomy = config
        .taxonomy()
        .context("Invalid partition table in config")?;

    if !cli.input.is_dir() {
        bail!("Input is not a directory: {:?}", cli.input);
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let raw_dir = RawDir::new(cli)?;
    let raw_path = raw_dir.path().to_owned();

    info!("Staging raw images in: {raw_path:?}");

    let expanded = normalize::expand_containers(&cli.input, &raw_path, cancel_signal)
        .with_context(|| format!("Failed to expand containers in: {:?}", cli.input))?;
    if !expanded.is_empty() {
        info!("Partitions from containers: {expanded:?}");
    }

    let staged = normalize::stage_inputs(&taxonomy, &cli.input, &raw_path, cancel_signal)
        .with_context(|| format!("Failed to copy images from: {:?}", cli.input))?;
    info!("Copied {staged} input files");

    let results = normalize::normalize_all(&taxonomy, &raw_path, cancel_signal)
        .with_context(|| format!("Failed to normalize images in: {raw_path:?}"))?;

    for (name, result) in &results {
        match result {
            Ok(NormalizeOutcome::Normalized(_)) | Ok(NormalizeOutcome::NotPresent) => {}
            Err(e) if normalize::is_cancelled(e) => {
                bail!("Interrupted while normalizing {name}");
            }
            // Already logged. The partition is left out of the output.
            Err(_) => {}
        }
    }

    let present = normalize::canonicalize_names(&taxonomy, &raw_path)
        .with_context(|| format!("Failed to rename images in: {raw_path:?}"))?;
    info!("Partitions present: {present:?}");

    let dispatched =
        dispatch::dispatch_all(&taxonomy, &raw_path, &cli.output, &config.tools, cancel_signal)
            .with_context(|| format!("Failed to extract partitions to: {:?}", cli.output))?;

    let mut extract_failed = 0;

    for d in &dispatched {
        match &d.result {
            Ok(Extraction::Extracted(_)) | Ok(Extraction::CopyOnly) => {}
            Ok(Extraction::Failed(_)) => extract_failed += 1,
            Err(e) => warn!("{}: Image was not copied: {e}", d.name),
        }
    }

    if extract_failed > 0 {
        warn!("{extract_failed} partitions were copied without being extracted");
    }

    match raw_dir {
        RawDir::Kept(path) => info!("Keeping raw images in: {path:?}"),
        RawDir::Temp(temp) => {
            let path = temp.path().to_owned();
            temp.close()
                .with_context(|| format!("Failed to remove temporary directory: {path:?}"))?;
        }
    }

    let count = dispatch::write_file_list(&cli.output, Some(&raw_path))
        .with_context(|| format!("Failed to write file list in: {:?}", cli.output))?;
    info!("Wrote {count} entries to {}", dispatch::FILE_LIST_NAME);

    dispatch::check_required(&dispatched)?;

    Ok(())
}

/// Normalize and extract a directory of firmware images.
///
/// OTA payloads and super images in the input directory are expanded first.
/// Every recognized partition image is then converted to a raw image, renamed
/// to its canonical partition name, and handed to the extractor for its
/// partition type. Each partition is also copied verbatim to
/// `<output>/<name>.img` and every output file is listed in
/// `<output>/all_files.txt`.
///
/// The input directory is never modified. The run fails if no system
/// partition was found.
#[derive(Debug, Parser)]
pub struct DumpCli {
    /// Directory containing the unpacked firmware.
    #[arg(short, long, value_name = "DIR", value_parser)]
    input: PathBuf,

    /// Output directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output: PathBuf,

    /// Directory for staging normalized raw images.
    ///
    /// If not specified, a temporary directory inside the output directory is
    /// used.
    #[arg(long, value_name = "DIR", value_parser)]
    raw_dir: Option<PathBuf>,

    /// Keep the normalized raw images after extraction.
    ///
    /// They are kept in `<output>/raw_images` unless --raw-dir is specified.
    #[arg(long)]
    keep_raw: bool,

    /// Path to config TOML with additional partitions, aliases, and tools.
    #[arg(long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,
}
