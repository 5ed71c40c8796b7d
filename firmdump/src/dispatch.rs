// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Hands normalized images to the external extractors for their partition
//! type and builds the output tree.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{PLACEHOLDER_IMAGE, PLACEHOLDER_OUTPUT, Tools},
    stream,
    taxonomy::{PartitionType, Taxonomy},
};

/// Name of the output manifest listing every output file.
pub const FILE_LIST_NAME: &str = "all_files.txt";

/// Partition that must be present for a run to be considered successful.
pub const REQUIRED_PARTITION: &str = "system";

const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";

#[derive(Debug, Error)]
pub enum Error {
    #[error("No {REQUIRED_PARTITION} partition was found")]
    MissingSystem,
    #[error("Failed to create directory: {0:?}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("Failed to copy {0:?} to {1:?}")]
    Copy(PathBuf, PathBuf, #[source] io::Error),
    #[error("Failed to list directory: {0:?}")]
    ListDir(PathBuf, #[source] io::Error),
    #[error("Failed to write file list: {0:?}")]
    WriteFileList(PathBuf, #[source] io::Error),
    #[error("Interrupted by cancel signal")]
    Cancelled(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Missing boot image magic: {0:?}")]
    NotBootImage(PathBuf),
    #[error("Failed to read image: {0:?}")]
    ReadImage(PathBuf, #[source] io::Error),
    #[error("Tool command line is empty")]
    EmptyCommand,
    #[error("Failed to run {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program:?} failed with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Failed to prepare output directory: {0:?}")]
    OutputDir(PathBuf, #[source] io::Error),
}

/// Result of running the extractors for a single partition.
#[derive(Debug)]
pub enum Extraction {
    /// Extracted by the named strategy.
    Extracted(&'static str),
    /// Every strategy failed. No extracted tree is left behind.
    Failed(Vec<(&'static str, ToolError)>),
    /// The partition type is only copied.
    CopyOnly,
}

#[derive(Debug)]
pub struct Dispatched {
    pub name: String,
    pub partition_type: PartitionType,
    pub result: Result<Extraction>,
}

/// Replace `{image}` and `{output}` placeholders. Paths are substituted as-is
/// so that non-UTF-8 paths survive.
fn expand_arg(arg: &str, image: &Path, output: &Path) -> OsString {
    let mut result = OsString::new();
    let mut rest = arg;

    loop {
        let next = [(PLACEHOLDER_IMAGE, image), (PLACEHOLDER_OUTPUT, output)]
            .into_iter()
            .filter_map(|(p, v)| rest.find(p).map(|i| (i, p, v)))
            .min_by_key(|(i, _, _)| *i);

        let Some((index, placeholder, value)) = next else {
            result.push(rest);
            break;
        };

        result.push(&rest[..index]);
        result.push(value);
        rest = &rest[index + placeholder.len()..];
    }

    result
}

/// Run an external tool. Its output is only shown if it fails.
pub fn run_tool(
    argv: &[String],
    image: &Path,
    output: &Path,
) -> std::result::Result<(), ToolError> {
    let (program, args) = argv.split_first().ok_or(ToolError::EmptyCommand)?;

    let mut command = Command::new(expand_arg(program, image, output));
    command.args(args.iter().map(|a| expand_arg(a, image, output)));

    debug!("Running: {command:?}");

    let result = command.output().map_err(|e| ToolError::Spawn {
        program: program.clone(),
        source: e,
    })?;

    if result.status.success() {
        Ok(())
    } else {
        let mut stderr = String::from_utf8_lossy(&result.stderr).trim().to_owned();
        if stderr.is_empty() {
            stderr = String::from_utf8_lossy(&result.stdout).trim().to_owned();
        }

        Err(ToolError::Failed {
            program: program.clone(),
            status: result.status,
            stderr,
        })
    }
}

fn reset_dir(path: &Path) -> std::result::Result<(), ToolError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| ToolError::OutputDir(path.to_owned(), e))?;
    }

    fs::create_dir_all(path).map_err(|e| ToolError::OutputDir(path.to_owned(), e))
}

/// Try each strategy in order until one succeeds. Partial output from a failed
/// strategy is removed before the next one runs.
fn run_strategies(
    strategies: &[(&'static str, &[String])],
    image: &Path,
    output: &Path,
) -> Extraction {
    let mut failures = vec![];

    for (name, argv) in strategies {
        let result = reset_dir(output).and_then(|_| run_tool(argv, image, output));

        match result {
            Ok(()) => return Extraction::Extracted(*name),
            Err(e) => {
                debug!("{name} failed for {image:?}: {e}");
                failures.push((*name, e));
            }
        }
    }

    if output.exists() {
        if let Err(e) = fs::remove_dir_all(output) {
            warn!("Failed to remove partial output: {output:?}: {e}");
        }
    }

    Extraction::Failed(failures)
}

fn has_boot_magic(image: &Path) -> io::Result<bool> {
    let mut file = File::open(image)?;
    let mut magic = vec![];
    (&mut file).take(8).read_to_end(&mut magic)?;

    Ok(magic == BOOT_MAGIC || magic == VENDOR_BOOT_MAGIC)
}

/// Extract one partition image according to its type and copy it verbatim to
/// `<out_dir>/<name>.img`.
pub fn dispatch_partition(
    name: &str,
    partition_type: PartitionType,
    image: &Path,
    out_dir: &Path,
    tools: &Tools,
) -> Result<Extraction> {
    let tree = out_dir.join(name);

    let extraction = match partition_type {
        PartitionType::Filesystem => {
            let strategies = [
                ("erofs", tools.erofs.as_slice()),
                ("7z", tools.sevenzip.as_slice()),
            ];

            run_strategies(&strategies, image, &tree)
        }
        PartitionType::BootImage => match has_boot_magic(image) {
            Ok(true) => {
                let strategies = [("boot_image", tools.boot_image.as_slice())];
                run_strategies(&strategies, image, &tree)
            }
            Ok(false) => Extraction::Failed(vec![(
                "boot_image",
                ToolError::NotBootImage(image.to_owned()),
            )]),
            Err(e) => Extraction::Failed(vec![(
                "boot_image",
                ToolError::ReadImage(image.to_owned(), e),
            )]),
        },
        PartitionType::Raw | PartitionType::Logical => Extraction::CopyOnly,
    };

    match &extraction {
        Extraction::Extracted(tool) => info!("{name}: Extracted with {tool}"),
        Extraction::Failed(failures) if partition_type == PartitionType::BootImage => {
            for (_, e) in failures {
                warn!("{name}: Not a valid boot image: {e}");
            }
        }
        Extraction::Failed(failures) => {
            for (tool, e) in failures {
                warn!("{name}: Failed to extract with {tool}: {e}");
            }
        }
        Extraction::CopyOnly => {}
    }

    let copy = out_dir.join(format!("{name}.img"));
    fs::copy(image, &copy).map_err(|e| Error::Copy(image.to_owned(), copy.clone(), e))?;

    Ok(extraction)
}

/// Dispatch every partition in taxonomy order whose `<name>.img` exists in
/// `raw_dir`. Cancellation is only checked between partitions.
pub fn dispatch_all(
    taxonomy: &Taxonomy,
    raw_dir: &Path,
    out_dir: &Path,
    tools: &Tools,
    cancel_signal: &AtomicBool,
) -> Result<Vec<Dispatched>> {
    fs::create_dir_all(out_dir).map_err(|e| Error::CreateDir(out_dir.to_owned(), e))?;

    let mut results = vec![];

    for (name, partition_type) in taxonomy.partitions() {
        let image = raw_dir.join(format!("{name}.img"));
        if !image.is_file() {
            continue;
        }

        stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

        info!("{name}: Dispatching as {partition_type}");

        let result = dispatch_partition(name, partition_type, &image, out_dir, tools);
        if let Err(e) = &result {
            warn!("{name}: Failed to dispatch: {e}");
        }

        results.push(Dispatched {
            name: name.to_owned(),
            partition_type,
            result,
        });
    }

    Ok(results)
}

/// Fail if the required partition never had an image.
pub fn check_required(dispatched: &[Dispatched]) -> Result<()> {
    if dispatched.iter().any(|d| d.name == REQUIRED_PARTITION) {
        Ok(())
    } else {
        Err(Error::MissingSystem)
    }
}

/// Relative paths of every regular file under `dir`, `/`-separated and sorted
/// byte-wise. The `exclude` directory is not descended into.
fn list_tree(dir: &Path, exclude: Option<&Path>) -> Result<Vec<Vec<u8>>> {
    let mut paths = vec![];
    let mut pending = vec![(dir.to_owned(), Vec::new())];

    while let Some((path, prefix)) = pending.pop() {
        for entry in fs::read_dir(&path).map_err(|e| Error::ListDir(path.clone(), e))? {
            let entry = entry.map_err(|e| Error::ListDir(path.clone(), e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| Error::ListDir(entry.path(), e))?;

            let mut relative = prefix.clone();
            if !relative.is_empty() {
                relative.push(b'/');
            }
            relative.extend_from_slice(entry.file_name().as_encoded_bytes());

            if file_type.is_dir() {
                let child = entry.path();
                if exclude != Some(child.as_path()) {
                    pending.push((child, relative));
                }
            } else if file_type.is_file() {
                paths.push(relative);
            }
        }
    }

    paths.sort();

    Ok(paths)
}

/// Write `<out_dir>/all_files.txt`, skipping anything under `exclude`.
/// Returns the number of entries.
pub fn write_file_list(out_dir: &Path, exclude: Option<&Path>) -> Result<usize> {
    let path = out_dir.join(FILE_LIST_NAME);

    let mut data = vec![];
    let mut count = 0;

    for relative in list_tree(out_dir, exclude)? {
        if relative == FILE_LIST_NAME.as_bytes() {
            continue;
        }

        data.extend_from_slice(&relative);
        data.push(b'\n');
        count += 1;
    }

    fs::write(&path, data).map_err(|e| Error::WriteFileList(path.clone(), e))?;

    Ok(count)
}
