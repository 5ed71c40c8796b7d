// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion of the many encodings that firmware partitions are shipped in
//! into plain raw `<name>.img` files.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::{self, File},
    io::{self, BufReader, BufWriter, Seek, Write},
    path::{Path, PathBuf},
    sync::{LazyLock, atomic::AtomicBool},
};

use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    format::{
        compression::{CompressedFormat, CompressedReader},
        lp::{self, Metadata},
        payload::{self, Payload, Reconstruction},
        sparse::{self, CrcMode},
        transfer::{self, TransferList},
    },
    stream::{self, FromReader},
    taxonomy::{self, Taxonomy},
    util,
};

static SPARSECHUNK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.img_sparsechunk\.([0-9]+)$").unwrap());

/// Matches dynamic partition containers. Empty containers are excluded
/// separately since they have no partition data.
static SUPER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^super.*\.img$").unwrap());

const PAYLOAD_NAME: &str = "payload.bin";

/// Suffixes of the intermediate encodings handled by [`normalize`].
const ENCODING_SUFFIXES: &[&str] = &[".new.dat.br", ".new.dat", ".transfer.list", ".img.lz4"];

/// Raw image candidates, in order of preference. `.img` comes first so that an
/// already normalized image is always picked.
const CANDIDATE_SUFFIXES: &[&str] = &[
    ".img",
    "",
    ".bin",
    ".ext4",
    ".image",
    ".img.ext4",
    ".mbn",
    ".raw",
    ".raw.img",
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to list directory: {0:?}")]
    ListDir(PathBuf, #[source] io::Error),
    #[error("Failed to open for reading: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to create temporary file in: {0:?}")]
    CreateTemp(PathBuf, #[source] io::Error),
    #[error("Failed to write: {0:?}")]
    Write(PathBuf, #[source] io::Error),
    #[error("Failed to move temporary file to: {0:?}")]
    Persist(PathBuf, #[source] io::Error),
    #[error("Failed to rename {0:?} to {1:?}")]
    Rename(PathBuf, PathBuf, #[source] io::Error),
    #[error("Failed to remove: {0:?}")]
    Remove(PathBuf, #[source] io::Error),
    #[error("Failed to decode sparse image: {0:?}")]
    Sparse(PathBuf, #[source] sparse::Error),
    #[error("Failed to decompress {format:?} data: {path:?}")]
    Decompress {
        path: PathBuf,
        format: CompressedFormat,
        #[source]
        source: io::Error,
    },
    #[error("Failed to apply transfer list: {0:?}")]
    Transfer(PathBuf, #[source] transfer::Error),
    #[error("Failed to read payload: {0:?}")]
    Payload(PathBuf, #[source] payload::Error),
    #[error("Failed to read super image: {0:?}")]
    Lp(PathBuf, #[source] lp::Error),
    #[error("Interrupted by cancel signal")]
    Cancelled(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// A raw image now exists at this path.
    Normalized(PathBuf),
    /// No recognized input exists for the partition.
    NotPresent,
}

/// Regular files in `dir`, sorted by name. Names that aren't valid UTF-8 can't
/// be partition names and are skipped.
fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = vec![];

    for entry in fs::read_dir(dir).map_err(|e| Error::ListDir(dir.to_owned(), e))? {
        let entry = entry.map_err(|e| Error::ListDir(dir.to_owned(), e))?;

        if !entry.path().is_file() {
            continue;
        }

        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => debug!("Skipping non-UTF-8 file name: {name:?}"),
        }
    }

    names.sort();

    Ok(names)
}

fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| Error::Remove(path.to_owned(), e))
}

/// Write `target` via a temporary file in the same directory. The target is
/// only replaced if `write` succeeds.
fn write_atomic(target: &Path, write: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
    let dir = util::parent_path(target);
    let mut temp =
        NamedTempFile::new_in(dir).map_err(|e| Error::CreateTemp(dir.to_owned(), e))?;

    write(temp.as_file_mut())?;

    temp.persist(target)
        .map_err(|e| Error::Persist(target.to_owned(), e.error))?;

    Ok(())
}

fn is_sparse(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| Error::Open(path.to_owned(), e))?;
    sparse::check(file).map_err(|e| Error::Open(path.to_owned(), e))
}

/// Unsparse `input` into `file`. The output keeps holes for don't-care chunks.
fn unsparse_into(input: &Path, file: &mut File, cancel_signal: &AtomicBool) -> Result<u64> {
    let reader = File::open(input)
        .map(BufReader::new)
        .map_err(|e| Error::Open(input.to_owned(), e))?;

    let header = sparse::decode_seekable(
        reader,
        BufWriter::new(&mut *file),
        CrcMode::Ignore,
        cancel_signal,
    )
    .map_err(|e| Error::Sparse(input.to_owned(), e))?;

    Ok(u64::from(header.num_blocks) * u64::from(header.block_size))
}

fn decompress_file(
    input: &Path,
    output: &Path,
    format: CompressedFormat,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    info!("Decompressing {input:?} as {format:?}");

    let reader = File::open(input)
        .map(BufReader::new)
        .map_err(|e| Error::Open(input.to_owned(), e))?;
    let reader = CompressedReader::with_format(reader, format);

    write_atomic(output, |file| {
        let mut writer = BufWriter::new(file);

        stream::copy(reader, &mut writer, cancel_signal)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Decompress {
                path: input.to_owned(),
                format,
                source: e,
            })
    })
}

/// Merge `<name>.img_sparsechunk.<N>` fragments into `<name>.img`. Each
/// fragment is a sparse image spanning the whole partition where the blocks
/// belonging to other fragments are holes.
fn merge_sparse_chunks(
    name: &str,
    dir: &Path,
    files: &[String],
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let image = dir.join(format!("{name}.img"));
    if image.exists() {
        return Ok(());
    }

    let mut chunks = files
        .iter()
        .filter_map(|f| {
            let captures = SPARSECHUNK_REGEX.captures(f)?;
            if &captures[1] != name {
                return None;
            }

            let index = captures[2].parse::<u64>().ok()?;
            Some((index, dir.join(f)))
        })
        .collect::<Vec<_>>();

    if chunks.is_empty() {
        return Ok(());
    }

    chunks.sort();

    info!("{name}: Merging {} sparse chunks", chunks.len());

    write_atomic(&image, |file| {
        let mut size = 0;

        for (_, path) in &chunks {
            file.rewind().map_err(|e| Error::Write(image.clone(), e))?;
            size = size.max(unsparse_into(path, file, cancel_signal)?);
        }

        file.set_len(size)
            .map_err(|e| Error::Write(image.clone(), e))
    })?;

    for (_, path) in &chunks {
        remove_file(path)?;
    }

    Ok(())
}

/// Produce `<dir>/<name>.img` as a raw image from whichever encoding of the
/// partition exists in `dir`. Stages run in a fixed order and each one is
/// skipped if its inputs are missing. Running this again on a normalized
/// partition does nothing.
pub fn normalize(name: &str, dir: &Path, cancel_signal: &AtomicBool) -> Result<NormalizeOutcome> {
    let files = list_files(dir)?;
    let image = dir.join(format!("{name}.img"));

    merge_sparse_chunks(name, dir, &files, cancel_signal)?;

    let brotli_data = dir.join(format!("{name}.new.dat.br"));
    let new_data = dir.join(format!("{name}.new.dat"));
    let transfer_list = dir.join(format!("{name}.transfer.list"));

    if brotli_data.is_file() {
        decompress_file(&brotli_data, &new_data, CompressedFormat::Brotli, cancel_signal)?;
        remove_file(&brotli_data)?;
    }

    if new_data.is_file() && transfer_list.is_file() {
        info!("{name}: Applying transfer list");

        let list = File::open(&transfer_list)
            .map(BufReader::new)
            .map_err(|e| Error::Open(transfer_list.clone(), e))
            .and_then(|r| {
                TransferList::from_reader(r).map_err(|e| Error::Transfer(transfer_list.clone(), e))
            })?;
        let reader = File::open(&new_data)
            .map(BufReader::new)
            .map_err(|e| Error::Open(new_data.clone(), e))?;

        write_atomic(&image, |file| {
            list.apply(reader, BufWriter::new(file), cancel_signal)
                .map(|_| ())
                .map_err(|e| Error::Transfer(transfer_list.clone(), e))
        })?;

        remove_file(&new_data)?;
        remove_file(&transfer_list)?;
    }

    let lz4_image = dir.join(format!("{name}.img.lz4"));

    if lz4_image.is_file() {
        decompress_file(&lz4_image, &image, CompressedFormat::Lz4, cancel_signal)?;
        remove_file(&lz4_image)?;
    }

    let Some(candidate) = CANDIDATE_SUFFIXES
        .iter()
        .map(|s| dir.join(format!("{name}{s}")))
        .find(|p| p.is_file())
    else {
        debug!("{name}: No image found");
        return Ok(NormalizeOutcome::NotPresent);
    };

    if is_sparse(&candidate)? {
        info!("{name}: Unsparsing {candidate:?}");

        write_atomic(&image, |file| {
            let size = unsparse_into(&candidate, file, cancel_signal)?;
            file.set_len(size)
                .map_err(|e| Error::Write(image.clone(), e))
        })?;

        if candidate != image {
            remove_file(&candidate)?;
        }
    } else if candidate != image {
        debug!("{name}: Renaming {candidate:?} to {image:?}");

        fs::rename(&candidate, &image)
            .map_err(|e| Error::Rename(candidate.clone(), image.clone(), e))?;
    }

    Ok(NormalizeOutcome::Normalized(image))
}

/// Strip the intermediate encoding or image extension from a file name.
pub fn encoded_stem(file_name: &str) -> &str {
    if let Some(captures) = SPARSECHUNK_REGEX.captures(file_name) {
        if let Some(m) = captures.get(1) {
            return m.as_str();
        }
    }

    ENCODING_SUFFIXES
        .iter()
        .find_map(|s| file_name.strip_suffix(s).filter(|n| !n.is_empty()))
        .unwrap_or_else(|| taxonomy::strip_image_extension(file_name))
}

/// Copy every file in `input_dir` that belongs to a partition known to
/// `taxonomy` into `raw_dir`, so that normalization never modifies the input.
/// Files that already exist in `raw_dir` are left alone. Returns the number of
/// files copied.
pub fn stage_inputs(
    taxonomy: &Taxonomy,
    input_dir: &Path,
    raw_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<usize> {
    let mut count = 0;

    for file in list_files(input_dir)? {
        if taxonomy.resolve_name(encoded_stem(&file)).is_none() {
            continue;
        }

        let source = input_dir.join(&file);
        let target = raw_dir.join(&file);
        if target.exists() {
            debug!("Already staged: {target:?}");
            continue;
        }

        stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

        fs::copy(&source, &target).map_err(|e| Error::Write(target.clone(), e))?;
        count += 1;
    }

    Ok(count)
}

/// Normalize every partition in `dir` whose name is known to `taxonomy`,
/// including slot suffixed and aliased names. A failure only affects the
/// partition it occurred in.
pub fn normalize_all(
    taxonomy: &Taxonomy,
    dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Vec<(String, Result<NormalizeOutcome>)>> {
    let order = taxonomy
        .partitions()
        .enumerate()
        .map(|(i, (name, _))| (name, i))
        .collect::<HashMap<_, _>>();

    // Processed in taxonomy order, with ties broken by slot and alias rank.
    let mut stems = BTreeSet::new();

    for file in list_files(dir)? {
        let stem = encoded_stem(&file);
        let Some(resolved) = taxonomy.resolve_name(stem) else {
            continue;
        };
        let index = order
            .get(resolved.canonical.as_str())
            .copied()
            .unwrap_or(usize::MAX);

        stems.insert((index, resolved.rank(), stem.to_owned()));
    }

    let mut results = vec![];

    for (_, _, stem) in stems {
        stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

        let result = normalize(&stem, dir, cancel_signal);
        if let Err(e) = &result {
            warn!("{stem}: Failed to normalize: {e}");
        }

        results.push((stem, result));
    }

    Ok(results)
}

/// Rename slot suffixed and aliased `.img` files in `dir` to their canonical
/// names. When several files map to the same partition, the best ranked one
/// is kept and the rest are deleted. Returns the canonical names present.
pub fn canonicalize_names(taxonomy: &Taxonomy, dir: &Path) -> Result<BTreeSet<String>> {
    let mut groups = BTreeMap::<String, Vec<(u8, String)>>::new();

    for file in list_files(dir)? {
        let Some(stem) = file.strip_suffix(".img") else {
            continue;
        };
        let Some(resolved) = taxonomy.resolve_name(stem) else {
            continue;
        };
        let rank = resolved.rank();

        groups.entry(resolved.canonical).or_default().push((rank, file));
    }

    for (canonical, files) in &mut groups {
        files.sort();

        let target = dir.join(format!("{canonical}.img"));
        let (_, winner) = &files[0];
        let winner_path = dir.join(winner);

        for (_, loser) in &files[1..] {
            warn!("{loser}: {canonical} duplicate, discarding");
            remove_file(&dir.join(loser))?;
        }

        if winner_path != target {
            info!("Renaming {winner} to {canonical}.img");

            fs::rename(&winner_path, &target)
                .map_err(|e| Error::Rename(winner_path.clone(), target.clone(), e))?;
        }
    }

    Ok(groups.into_keys().collect())
}

/// Reconstruct every partition in an OTA payload into `raw_dir`. Returns the
/// names of partitions that were produced.
pub fn expand_payload(
    path: &Path,
    raw_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Vec<String>> {
    let reader = File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Open(path.to_owned(), e))?;
    let mut payload = Payload::open(reader).map_err(|e| Error::Payload(path.to_owned(), e))?;

    let results = payload
        .extract_all(raw_dir, cancel_signal)
        .map_err(|e| Error::Payload(path.to_owned(), e))?;

    Ok(results
        .into_iter()
        .filter_map(|(name, r)| match r {
            Ok(Reconstruction::Verified | Reconstruction::Degraded(_)) => Some(name),
            Err(_) => None,
        })
        .collect())
}

/// Extract every logical partition in a super image into `raw_dir`. Sparse
/// super images are unsparsed into a temporary file first.
pub fn expand_super(
    path: &Path,
    raw_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Vec<String>> {
    let mut temp_file = None;

    let mut reader = if is_sparse(path)? {
        info!("Unsparsing super image: {path:?}");

        let mut temp = NamedTempFile::new_in(raw_dir)
            .map_err(|e| Error::CreateTemp(raw_dir.to_owned(), e))?;
        let size = unsparse_into(path, temp.as_file_mut(), cancel_signal)?;
        temp.as_file()
            .set_len(size)
            .map_err(|e| Error::Write(temp.path().to_owned(), e))?;

        let file = temp
            .reopen()
            .map_err(|e| Error::Open(temp.path().to_owned(), e))?;
        temp_file = Some(temp);

        BufReader::new(file)
    } else {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::Open(path.to_owned(), e))?
    };

    let metadata = Metadata::read(&mut reader).map_err(|e| Error::Lp(path.to_owned(), e))?;
    let results = lp::extract_all(&mut reader, &metadata, raw_dir, cancel_signal)
        .map_err(|e| Error::Lp(path.to_owned(), e))?;

    drop(temp_file);

    Ok(results
        .into_iter()
        .filter_map(|(name, r)| r.ok().map(|_| name))
        .collect())
}

/// Expand the OTA payload and super images found in `input_dir` into
/// `raw_dir`. A container that cannot be read is skipped with a warning.
/// Returns the names of the partitions produced.
pub fn expand_containers(
    input_dir: &Path,
    raw_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Vec<String>> {
    let files = list_files(input_dir)?;
    let mut produced = vec![];

    let payloads = files.iter().filter(|f| *f == PAYLOAD_NAME);
    let supers = files
        .iter()
        .filter(|f| SUPER_REGEX.is_match(f) && !f.contains("_empty"));

    for (file, is_payload) in payloads.map(|f| (f, true)).chain(supers.map(|f| (f, false))) {
        stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

        let path = input_dir.join(file);
        let result = if is_payload {
            expand_payload(&path, raw_dir, cancel_signal)
        } else {
            expand_super(&path, raw_dir, cancel_signal)
        };

        match result {
            Ok(names) => {
                info!("{file}: Expanded {} partitions", names.len());
                produced.extend(names);
            }
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => warn!("{file}: Skipping container: {e}"),
        }
    }

    Ok(produced)
}

/// Whether an error was caused by the cancel signal rather than bad input.
pub fn is_cancelled(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);

    while let Some(e) = source {
        if let Some(e) = e.downcast_ref::<io::Error>() {
            if e.kind() == io::ErrorKind::Interrupted {
                return true;
            }
        }
        source = e.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_stems() {
        assert_eq!(encoded_stem("system.img_sparsechunk.12"), "system");
        assert_eq!(encoded_stem("vendor.new.dat.br"), "vendor");
        assert_eq!(encoded_stem("vendor.new.dat"), "vendor");
        assert_eq!(encoded_stem("vendor.transfer.list"), "vendor");
        assert_eq!(encoded_stem("boot.img.lz4"), "boot");
        assert_eq!(encoded_stem("NON-HLOS.bin"), "NON-HLOS");
        assert_eq!(encoded_stem("odm_a.img"), "odm_a");
        assert_eq!(encoded_stem("system"), "system");
        assert_eq!(encoded_stem(".img"), ".img");
    }

    #[test]
    fn cancelled_errors() {
        let cancelled = Error::Payload(
            PathBuf::from("payload.bin"),
            payload::Error::DataWrite(
                "cancel",
                io::Error::new(io::ErrorKind::Interrupted, "Received cancel signal"),
            ),
        );
        assert!(is_cancelled(&cancelled));

        let corrupt = Error::Lp(PathBuf::from("super.img"), lp::Error::EmptyImage);
        assert!(!is_cancelled(&corrupt));
    }

    #[test]
    fn not_present() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("vendor.new.dat"), b"").unwrap();

        assert_eq!(
            normalize("vendor", temp_dir.path(), &AtomicBool::new(false)).unwrap(),
            NormalizeOutcome::NotPresent,
        );
        assert_eq!(
            normalize("system", temp_dir.path(), &AtomicBool::new(false)).unwrap(),
            NormalizeOutcome::NotPresent,
        );
    }
}
