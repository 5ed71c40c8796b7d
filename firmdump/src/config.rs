// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::taxonomy::{self, PartitionType, Taxonomy};

/// Placeholder for the path to the input image in tool command lines.
pub const PLACEHOLDER_IMAGE: &str = "{image}";
/// Placeholder for the path to the output directory in tool command lines.
pub const PLACEHOLDER_OUTPUT: &str = "{output}";

/// External tool command lines. Each one is a full argv with placeholders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tools {
    pub erofs: Vec<String>,
    pub sevenzip: Vec<String>,
    pub boot_image: Vec<String>,
}

impl Default for Tools {
    fn default() -> Self {
        fn argv(args: &[&str]) -> Vec<String> {
            args.iter().map(|a| (*a).to_owned()).collect()
        }

        Self {
            erofs: argv(&["fsck.erofs", "--extract={output}", "{image}"]),
            sevenzip: argv(&["7z", "x", "{image}", "-y", "-o{output}/"]),
            boot_image: argv(&["unpack_bootimg", "--boot_img", "{image}", "--out", "{output}"]),
        }
    }
}

impl Tools {
    fn validate(&self) -> Result<()> {
        for (name, argv) in [
            ("erofs", &self.erofs),
            ("sevenzip", &self.sevenzip),
            ("boot_image", &self.boot_image),
        ] {
            match argv.first() {
                None => bail!("Command line for tool {name:?} is empty"),
                Some(program) if program.contains(PLACEHOLDER_IMAGE) => {
                    bail!("Program for tool {name:?} cannot be the input image");
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Additional or overridden partitions.
    pub partitions: BTreeMap<String, PartitionType>,
    /// Additional aliases mapping to a partition or another alias.
    pub aliases: BTreeMap<String, String>,
    pub tools: Tools,
}

impl Config {
    pub fn taxonomy(&self) -> Result<Taxonomy, taxonomy::Error> {
        Taxonomy::new(&self.partitions, &self.aliases)
    }
}

pub fn parse_config(data: &str) -> Result<Config> {
    let config: Config = toml_edit::de::from_str(data)?;
    config.tools.validate()?;

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config: {path:?}"))?;

    parse_config(&contents).with_context(|| format!("Failed to parse config: {path:?}"))
}
