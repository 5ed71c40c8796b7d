// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{
    format::payload::{Payload, Reconstruction},
    protobuf::chromeos_update_engine::install_operation::Type,
    util::NumBytes,
};

fn open_payload(path: &Path) -> Result<Payload<BufReader<File>>> {
    let reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {path:?}"))?;

    Payload::open(reader).with_context(|| format!("Failed to read payload: {path:?}"))
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let payload = open_payload(&cli.input)?;
    let manifest = payload.manifest();

    println!("{:#?}", payload.header());
    println!("Data offset: {}", payload.data_offset());
    println!("Block size: {}", manifest.block_size());
    println!("Minor version: {}", manifest.minor_version());
    println!(
        "Metadata signatures: {}",
        payload.metadata_signatures().signatures.len(),
    );

    if let Some(e) = payload.manifest_error() {
        println!("Manifest error: {e}");
    }

    for partition in &manifest.partitions {
        let mut counts = BTreeMap::<String, usize>::new();

        for op in &partition.operations {
            let kind = Type::try_from(op.r#type)
                .map_or_else(|_| format!("Unknown({})", op.r#type), |t| format!("{t:?}"));
            *counts.entry(kind).or_default() += 1;
        }

        let size = partition
            .new_partition_info
            .as_ref()
            .map(|i| i.size())
            .unwrap_or_default();

        println!(
            "- {}: {:?}, {} operations {counts:?}",
            partition.partition_name,
            NumBytes(size),
            partition.operations.len(),
        );
    }

    Ok(())
}

fn extract_subcommand(cli: &ExtractCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut payload = open_payload(&cli.input)?;

    fs::create_dir_all(&cli.directory)
        .with_context(|| format!("Failed to create directory: {:?}", cli.directory))?;

    let results = if cli.partition.is_empty() {
        payload
            .extract_all(&cli.directory, cancel_signal)
            .with_context(|| format!("Failed to extract payload: {:?}", cli.input))?
    } else {
        let mut results = vec![];

        for name in &cli.partition {
            info!("Extracting {name} from payload");

            let result = payload.extract(name, &cli.directory, cancel_signal);
            results.push((name.clone(), result));
        }

        results
    };

    let mut failed = 0;

    for (name, result) in &results {
        match result {
            Ok(Reconstruction::Verified) => {}
            Ok(Reconstruction::Degraded(warnings)) => {
                warn!("{name}: Output is best effort due to {} warnings", warnings.len());
            }
            Err(e) => {
                warn!("{name}: {e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("Failed to extract {failed} of {} partitions", results.len());
    }

    Ok(())
}

pub fn payload_main(cli: &PayloadCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        PayloadCommand::Info(c) => info_subcommand(c),
        PayloadCommand::Extract(c) => extract_subcommand(c, cancel_signal),
    }
}

/// Display payload header and partition summary.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Reconstruct partition images from a full payload.
#[derive(Debug, Parser)]
struct ExtractCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Output directory for `<name>.img` files.
    #[arg(short, long, value_name = "DIR", value_parser)]
    directory: PathBuf,

    /// Partition to extract.
    ///
    /// This option can be specified multiple times. If it is not specified,
    /// every partition is extracted.
    #[arg(short, long, value_name = "NAME")]
    partition: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum PayloadCommand {
    Info(InfoCli),
    Extract(ExtractCli),
}

/// Inspect and extract OTA payloads.
#[derive(Debug, Parser)]
pub struct PayloadCli {
    #[command(subcommand)]
    command: PayloadCommand,
}
