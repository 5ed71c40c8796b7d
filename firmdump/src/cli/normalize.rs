// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    config,
    normalize::{self, NormalizeOutcome},
    taxonomy::Taxonomy,
};

pub fn normalize_main(cli: &NormalizeCli, cancel_signal: &AtomicBool) -> Result<()> {
    let taxonomy = match &cli.config {
        Some(path) => config::load_config(path)?
            .taxonomy()
            .with_context(|| format!("Invalid partition table in config: {path:?}"))?,
        None => Taxonomy::default(),
    };

    let results = if cli.partition.is_empty() {
        normalize::normalize_all(&taxonomy, &cli.directory, cancel_signal)
            .with_context(|| format!("Failed to normalize images in: {:?}", cli.directory))?
    } else {
        cli.partition
            .iter()
            .map(|name| {
                let result = normalize::normalize(name, &cli.directory, cancel_signal);
                (name.clone(), result)
            })
            .collect()
    };

    let mut failed = 0;

    for (name, result) in results {
        match result {
            Ok(NormalizeOutcome::Normalized(path)) => info!("{name}: {path:?}"),
            Ok(NormalizeOutcome::NotPresent) => info!("{name}: Not present"),
            Err(e) => {
                warn!("{name}: {e}");
                failed += 1;
            }
        }
    }

    if cli.canonicalize {
        let names = normalize::canonicalize_names(&taxonomy, &cli.directory)
            .with_context(|| format!("Failed to rename images in: {:?}", cli.directory))?;
        info!("Partitions present: {names:?}");
    }

    if failed > 0 {
        bail!("Failed to normalize {failed} partitions");
    }

    Ok(())
}

/// Convert partition images to raw images in place.
///
/// Sparse chunks, brotli compressed transfer lists, LZ4 compressed images, and
/// sparse images are converted to `<name>.img`. Running this again on a
/// normalized directory does nothing.
#[derive(Debug, Parser)]
pub struct NormalizeCli {
    /// Directory containing partition images.
    #[arg(short, long, value_name = "DIR", value_parser)]
    directory: PathBuf,

    /// Partition to normalize.
    ///
    /// This option can be specified multiple times. If it is not specified,
    /// every recognized partition in the directory is normalized.
    #[arg(short, long, value_name = "NAME")]
    partition: Vec<String>,

    /// Also rename slot suffixed and aliased images to their canonical names.
    #[arg(long)]
    canonicalize: bool,

    /// Path to config TOML with additional partitions and aliases.
    #[arg(long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,
}
