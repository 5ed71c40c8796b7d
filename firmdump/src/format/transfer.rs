// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block-based OTA transfer lists (`<name>.transfer.list` + `<name>.new.dat`).
//! Only full images can be rebuilt. Commands that reference a source image are
//! rejected.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    ops::Range,
    str::FromStr,
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::stream::{self, FromReader, WriteZerosExt};

pub const BLOCK_SIZE: u64 = 4096;

const MIN_VERSION: u32 = 1;
const MAX_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transfer list is missing the {0} line")]
    MissingLine(&'static str),
    #[error("Line {line}: Invalid {field}: {value:?}")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u32),
    #[error("Line {line}: Invalid range set: {reason}")]
    InvalidRangeSet { line: usize, reason: RangeSetError },
    #[error("Line {line}: Command requires a source image: {command}")]
    SourceRequired { line: usize, command: String },
    #[error("Line {line}: Unknown command: {command}")]
    UnknownCommand { line: usize, command: String },
    #[error("Line {line}: Missing range set for command: {command}")]
    MissingRangeSet { line: usize, command: String },
    #[error("Transfer list is not valid UTF-8")]
    InvalidEncoding(#[source] io::Error),
    #[error("Failed to read new data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RangeSetError {
    #[error("Not a number")]
    NotANumber,
    #[error("Count must be even and non-zero")]
    InvalidCount,
    #[error("Count does not match number of values")]
    CountMismatch,
    #[error("Range is empty or reversed")]
    EmptyRange,
    #[error("Block number overflows byte offset")]
    Overflow,
}

/// A list of half-open block ranges in the order they were declared.
#[derive(Clone, PartialEq, Eq)]
pub struct RangeSet(Vec<Range<u64>>);

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.0).finish()
    }
}

impl FromStr for RangeSet {
    type Err = RangeSetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut values = s
            .split(',')
            .map(|v| v.trim().parse::<u64>().map_err(|_| RangeSetError::NotANumber));

        let count = values.next().ok_or(RangeSetError::NotANumber)??;
        if count == 0 || count % 2 != 0 {
            return Err(RangeSetError::InvalidCount);
        }

        let values = values.collect::<std::result::Result<Vec<_>, _>>()?;
        if values.len() as u64 != count {
            return Err(RangeSetError::CountMismatch);
        }

        let mut ranges = Vec::with_capacity(values.len() / 2);

        for pair in values.chunks_exact(2) {
            if pair[0] >= pair[1] {
                return Err(RangeSetError::EmptyRange);
            } else if pair[1].checked_mul(BLOCK_SIZE).is_none() {
                return Err(RangeSetError::Overflow);
            }

            ranges.push(pair[0]..pair[1]);
        }

        Ok(Self(ranges))
    }
}

impl RangeSet {
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.0
    }

    /// Total number of blocks covered.
    pub fn num_blocks(&self) -> u64 {
        self.0.iter().map(|r| r.end - r.start).sum()
    }

    /// One past the highest block covered.
    pub fn end_block(&self) -> u64 {
        self.0.iter().map(|r| r.end).max().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Write the next blocks of the new data stream.
    New(RangeSet),
    Zero(RangeSet),
    /// Discard. Nothing is written.
    Erase(RangeSet),
}

impl Command {
    pub fn ranges(&self) -> &RangeSet {
        match self {
            Self::New(r) | Self::Zero(r) | Self::Erase(r) => r,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    /// Number of blocks in the new data stream.
    pub total_blocks: u64,
    pub commands: Vec<Command>,
}

fn parse_number<T: FromStr>(line: usize, field: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::InvalidNumber {
        line,
        field,
        value: value.to_owned(),
    })
}

impl FromStr for TransferList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Line numbers are 1-based.
        let mut lines = s.lines().enumerate().map(|(i, l)| (i + 1, l));

        let (n, line) = lines.next().ok_or(Error::MissingLine("version"))?;
        let version: u32 = parse_number(n, "version", line)?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }

        let (n, line) = lines.next().ok_or(Error::MissingLine("total blocks"))?;
        let total_blocks = parse_number(n, "total blocks", line)?;

        if version >= 2 {
            // Stash entries and maximum stashed blocks are only relevant to
            // incremental updates.
            lines.next().ok_or(Error::MissingLine("stash entries"))?;
            lines.next().ok_or(Error::MissingLine("stash blocks"))?;
        }

        let mut commands = vec![];

        for (n, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut pieces = line.split_whitespace();
            let command = pieces.next().unwrap_or_default();

            let mut range_set = || -> Result<RangeSet> {
                let value = pieces.next().ok_or_else(|| Error::MissingRangeSet {
                    line: n,
                    command: command.to_owned(),
                })?;

                value
                    .parse()
                    .map_err(|reason| Error::InvalidRangeSet { line: n, reason })
            };

            let command = match command {
                "new" => Command::New(range_set()?),
                "zero" => Command::Zero(range_set()?),
                "erase" => Command::Erase(range_set()?),
                "move" | "bsdiff" | "imgdiff" | "stash" | "free" => {
                    return Err(Error::SourceRequired {
                        line: n,
                        command: command.to_owned(),
                    });
                }
                c => {
                    return Err(Error::UnknownCommand {
                        line: n,
                        command: c.to_owned(),
                    });
                }
            };

            commands.push(command);
        }

        Ok(Self {
            version,
            total_blocks,
            commands,
        })
    }
}

impl<R: Read> FromReader<R> for TransferList {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(Error::InvalidEncoding)?;

        text.parse()
    }
}

impl TransferList {
    /// Size in bytes of the image produced by [`Self::apply`].
    pub fn image_size(&self) -> u64 {
        self.commands
            .iter()
            .map(|c| c.ranges().end_block())
            .max()
            .unwrap_or(0)
            * BLOCK_SIZE
    }

    /// Rebuild a full image from the new data stream. `writer` should refer to
    /// an empty file. The output is extended to [`Self::image_size`] so that
    /// trailing erased regions exist in the image.
    pub fn apply(
        &self,
        mut new_data: impl Read,
        mut writer: impl Write + Seek,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        debug!(
            "Applying version {} transfer list with {} commands",
            self.version,
            self.commands.len(),
        );

        for command in &self.commands {
            trace!("Command: {command:?}");

            match command {
                Command::New(ranges) => {
                    for range in ranges.ranges() {
                        writer
                            .seek(SeekFrom::Start(range.start * BLOCK_SIZE))
                            .map_err(|e| Error::DataWrite("new_seek", e))?;

                        stream::copy_n(
                            &mut new_data,
                            &mut writer,
                            (range.end - range.start) * BLOCK_SIZE,
                            cancel_signal,
                        )
                        .map_err(|e| Error::DataRead("new", e))?;
                    }
                }
                Command::Zero(ranges) => {
                    for range in ranges.ranges() {
                        stream::check_cancel(cancel_signal)
                            .map_err(|e| Error::DataWrite("zero", e))?;

                        writer
                            .seek(SeekFrom::Start(range.start * BLOCK_SIZE))
                            .map_err(|e| Error::DataWrite("zero_seek", e))?;

                        writer
                            .write_zeros_exact((range.end - range.start) * BLOCK_SIZE)
                            .map_err(|e| Error::DataWrite("zero", e))?;
                    }
                }
                Command::Erase(_) => {}
            }
        }

        let size = self.image_size();
        let cur_size = writer
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataWrite("extend_seek", e))?;

        if cur_size < size {
            writer
                .write_zeros_exact(size - cur_size)
                .map_err(|e| Error::DataWrite("extend", e))?;
        }

        writer.flush().map_err(|e| Error::DataWrite("flush", e))?;

        Ok(size.max(cur_size))
    }
}
