// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The table of known partitions, how each kind should be extracted, and the
//! alternate names that vendors ship them under.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use phf::phf_map;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    /// A filesystem image to be unpacked with a filesystem extractor.
    Filesystem,
    /// An Android boot image to be unpacked with a boot image tool.
    BootImage,
    /// Opaque firmware blob. Only copied.
    Raw,
    /// Dynamic partition container. Only copied.
    Logical,
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Filesystem => "filesystem",
            Self::BootImage => "boot image",
            Self::Raw => "raw",
            Self::Logical => "logical",
        };

        f.write_str(name)
    }
}

/// Known partitions in processing order.
static PARTITIONS: &[(&str, PartitionType)] = &[
    ("system", PartitionType::Filesystem),
    ("system_ext", PartitionType::Filesystem),
    ("system_other", PartitionType::Filesystem),
    ("systemex", PartitionType::Filesystem),
    ("system_dlkm", PartitionType::Filesystem),
    ("vendor", PartitionType::Filesystem),
    ("vendor_dlkm", PartitionType::Filesystem),
    ("product", PartitionType::Filesystem),
    ("odm", PartitionType::Filesystem),
    ("odm_dlkm", PartitionType::Filesystem),
    ("oem", PartitionType::Filesystem),
    ("cust", PartitionType::Filesystem),
    ("factory", PartitionType::Filesystem),
    ("india", PartitionType::Filesystem),
    ("reserve", PartitionType::Filesystem),
    ("preload_common", PartitionType::Filesystem),
    ("opproduct", PartitionType::Filesystem),
    ("oppo_product", PartitionType::Filesystem),
    ("xrom", PartitionType::Filesystem),
    ("my_bigball", PartitionType::Filesystem),
    ("my_carrier", PartitionType::Filesystem),
    ("my_company", PartitionType::Filesystem),
    ("my_engineering", PartitionType::Filesystem),
    ("my_heytap", PartitionType::Filesystem),
    ("my_manifest", PartitionType::Filesystem),
    ("my_preload", PartitionType::Filesystem),
    ("my_product", PartitionType::Filesystem),
    ("my_region", PartitionType::Filesystem),
    ("my_stock", PartitionType::Filesystem),
    ("my_version", PartitionType::Filesystem),
    ("boot", PartitionType::BootImage),
    ("init_boot", PartitionType::BootImage),
    ("recovery", PartitionType::BootImage),
    ("vendor_boot", PartitionType::BootImage),
    ("vendor_kernel_boot", PartitionType::BootImage),
    ("dtbo", PartitionType::Raw),
    ("modem", PartitionType::Raw),
    ("tz", PartitionType::Raw),
    ("vbmeta", PartitionType::Raw),
    ("vbmeta_system", PartitionType::Raw),
    ("vbmeta_vendor", PartitionType::Raw),
    ("super", PartitionType::Logical),
];

/// Names that vendors have used in place of the canonical partition name.
static ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "boot-verified" => "boot",
    "dtbo-verified" => "dtbo",
    // Qualcomm modem firmware
    "NON-HLOS" => "modem",
};

/// Extensions that raw partition images are shipped with, longest first so
/// that `.img.ext4` is preferred over `.ext4`.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    ".img.ext4",
    ".raw.img",
    ".image",
    ".ext4",
    ".img",
    ".bin",
    ".mbn",
    ".raw",
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition name: {0:?}")]
    InvalidName(String),
    #[error("Alias {alias:?} targets unknown partition {target:?}")]
    AliasUnknownTarget { alias: String, target: String },
    #[error("Alias {0:?} shadows a partition of the same name")]
    AliasShadowsPartition(String),
    #[error("Alias {0:?} resolves to itself")]
    AliasCycle(String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::A => "_a",
            Self::B => "_b",
        }
    }

    fn strip(name: &str) -> Option<(&str, Self)> {
        [Self::A, Self::B]
            .into_iter()
            .find_map(|s| name.strip_suffix(s.suffix()).map(|n| (n, s)))
    }
}

/// The result of mapping a file name or partition name to a known partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedName {
    pub canonical: String,
    pub slot: Option<Slot>,
    pub via_alias: bool,
}

impl ResolvedName {
    /// Rank when multiple files resolve to the same partition. Lower is
    /// preferred: exact, `_a`, `_b`, then the same for aliases. Preferring
    /// `_a` assumes that it is the active slot, which is a heuristic.
    pub fn rank(&self) -> u8 {
        let slot = match self.slot {
            None => 0,
            Some(Slot::A) => 1,
            Some(Slot::B) => 2,
        };

        if self.via_alias { 3 + slot } else { slot }
    }
}

/// Strip a known image extension from a file name. Only one extension is
/// removed.
pub fn strip_image_extension(name: &str) -> &str {
    IMAGE_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext).filter(|n| !n.is_empty()))
        .unwrap_or(name)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.'))
}

/// Immutable partition table. This is built once and then shared by
/// reference.
#[derive(Clone, Debug)]
pub struct Taxonomy {
    partitions: Vec<(String, PartitionType)>,
    types: HashMap<String, PartitionType>,
    /// Flattened so that every alias maps directly to a canonical name.
    aliases: HashMap<String, String>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let partitions = PARTITIONS
            .iter()
            .map(|(n, t)| ((*n).to_owned(), *t))
            .collect::<Vec<_>>();
        let types = partitions.iter().cloned().collect();
        let aliases = ALIASES
            .entries()
            .map(|(a, t)| ((*a).to_owned(), (*t).to_owned()))
            .collect();

        Self {
            partitions,
            types,
            aliases,
        }
    }
}

impl Taxonomy {
    /// Build the table from the builtin entries plus additional partitions
    /// and aliases. Partitions that already exist have their type replaced.
    /// Aliases may chain through other aliases, but must eventually reach a
    /// partition.
    pub fn new(
        extra_partitions: &BTreeMap<String, PartitionType>,
        extra_aliases: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut result = Self::default();

        for (name, partition_type) in extra_partitions {
            if !is_valid_name(name) {
                return Err(Error::InvalidName(name.clone()));
            }

            if let Some(existing) = result.types.get_mut(name) {
                *existing = *partition_type;
                for (n, t) in &mut result.partitions {
                    if n == name {
                        *t = *partition_type;
                    }
                }
            } else {
                result.types.insert(name.clone(), *partition_type);
                result.partitions.push((name.clone(), *partition_type));
            }
        }

        let mut aliases = result.aliases.clone();

        for (alias, target) in extra_aliases {
            if !is_valid_name(alias) {
                return Err(Error::InvalidName(alias.clone()));
            }

            aliases.insert(alias.clone(), target.clone());
        }

        let mut flattened = HashMap::new();

        for alias in aliases.keys() {
            if result.types.contains_key(alias) {
                return Err(Error::AliasShadowsPartition(alias.clone()));
            }

            let mut visited = HashSet::new();
            let mut current = alias;

            while let Some(next) = aliases.get(current) {
                if !visited.insert(current) {
                    return Err(Error::AliasCycle(alias.clone()));
                }
                current = next;
            }

            if !result.types.contains_key(current) {
                return Err(Error::AliasUnknownTarget {
                    alias: alias.clone(),
                    target: current.clone(),
                });
            }

            flattened.insert(alias.clone(), current.clone());
        }

        result.aliases = flattened;

        Ok(result)
    }

    /// Canonical partitions in processing order.
    pub fn partitions(&self) -> impl Iterator<Item = (&str, PartitionType)> {
        self.partitions.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    pub fn classify(&self, canonical: &str) -> Option<PartitionType> {
        self.types.get(canonical).copied()
    }

    fn lookup(&self, name: &str) -> Option<(&str, bool)> {
        if let Some((n, _)) = self.types.get_key_value(name) {
            Some((n.as_str(), false))
        } else {
            self.aliases.get(name).map(|t| (t.as_str(), true))
        }
    }

    /// Map a file name or partition name to its canonical partition. A known
    /// image extension is stripped first. Exact matches take precedence over
    /// slot suffix stripping so that partitions like `my_a` would still
    /// resolve to themselves.
    pub fn resolve_name(&self, raw: &str) -> Option<ResolvedName> {
        let stem = strip_image_extension(raw);

        if let Some((canonical, via_alias)) = self.lookup(stem) {
            return Some(ResolvedName {
                canonical: canonical.to_owned(),
                slot: None,
                via_alias,
            });
        }

        let (base, slot) = Slot::strip(stem)?;
        let (canonical, via_alias) = self.lookup(base)?;

        Some(ResolvedName {
            canonical: canonical.to_owned(),
            slot: Some(slot),
            via_alias,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn resolve_slots_and_aliases() {
        let taxonomy = Taxonomy::default();

        assert_eq!(
            taxonomy.resolve_name("NON-HLOS_a.img"),
            Some(ResolvedName {
                canonical: "modem".to_owned(),
                slot: Some(Slot::A),
                via_alias: true,
            }),
        );
        assert_eq!(
            taxonomy.resolve_name("system_b"),
            Some(ResolvedName {
                canonical: "system".to_owned(),
                slot: Some(Slot::B),
                via_alias: false,
            }),
        );
        assert_eq!(
            taxonomy.resolve_name("system_ext.img").unwrap().canonical,
            "system_ext",
        );
        assert_eq!(taxonomy.resolve_name("boot-verified.img").unwrap().canonical, "boot");
        assert_eq!(taxonomy.resolve_name("vendor.img.ext4").unwrap().canonical, "vendor");
        assert_eq!(taxonomy.resolve_name("system_c"), None);
        assert_eq!(taxonomy.resolve_name("userdata.img"), None);
        assert_eq!(taxonomy.resolve_name(""), None);
    }

    #[test]
    fn resolving_is_stable() {
        let taxonomy = Taxonomy::default();
        let names = taxonomy
            .partitions()
            .map(|(n, _)| n.to_owned())
            .chain(taxonomy.aliases().map(|(a, _)| a.to_owned()))
            .collect::<Vec<_>>();

        for name in names {
            for suffix in ["", "_a", "_b"] {
                let once = taxonomy.resolve_name(&format!("{name}{suffix}")).unwrap();
                let twice = taxonomy.resolve_name(&once.canonical).unwrap();

                assert_eq!(twice.canonical, once.canonical, "{name}{suffix}");
                assert_eq!(twice.slot, None);
                assert!(!twice.via_alias);
            }
        }
    }

    #[test]
    fn classify_builtin() {
        let taxonomy = Taxonomy::default();

        assert_eq!(taxonomy.classify("system"), Some(PartitionType::Filesystem));
        assert_eq!(taxonomy.classify("my_heytap"), Some(PartitionType::Filesystem));
        assert_eq!(taxonomy.classify("vendor_boot"), Some(PartitionType::BootImage));
        assert_eq!(taxonomy.classify("modem"), Some(PartitionType::Raw));
        assert_eq!(taxonomy.classify("super"), Some(PartitionType::Logical));
        assert_eq!(taxonomy.classify("NON-HLOS"), None);
        assert_eq!(taxonomy.partitions().next(), Some(("system", PartitionType::Filesystem)));
    }

    #[test]
    fn rank_prefers_exact_then_slot_a() {
        let taxonomy = Taxonomy::default();
        let mut names = ["NON-HLOS_b", "modem_b", "NON-HLOS", "modem", "NON-HLOS_a", "modem_a"]
            .into_iter()
            .map(|n| (taxonomy.resolve_name(n).unwrap().rank(), n))
            .collect::<Vec<_>>();
        names.sort();

        assert_eq!(
            names.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            ["modem", "modem_a", "modem_b", "NON-HLOS", "NON-HLOS_a", "NON-HLOS_b"],
        );
    }

    #[test]
    fn overlay() {
        let partitions = BTreeMap::from([
            ("mi_ext".to_owned(), PartitionType::Filesystem),
            ("tz".to_owned(), PartitionType::BootImage),
        ]);
        let aliases = BTreeMap::from([
            ("MIEXT".to_owned(), "mi_ext".to_owned()),
            ("modem-old".to_owned(), "NON-HLOS".to_owned()),
        ]);
        let taxonomy = Taxonomy::new(&partitions, &aliases).unwrap();

        assert_eq!(taxonomy.classify("mi_ext"), Some(PartitionType::Filesystem));
        assert_eq!(taxonomy.classify("tz"), Some(PartitionType::BootImage));
        assert_eq!(taxonomy.partitions().last(), Some(("mi_ext", PartitionType::Filesystem)));
        assert_eq!(taxonomy.resolve_name("MIEXT_a.img").unwrap().canonical, "mi_ext");
        assert_eq!(taxonomy.resolve_name("modem-old").unwrap().canonical, "modem");
    }

    #[test]
    fn overlay_validation() {
        let none = BTreeMap::new();

        let aliases = BTreeMap::from([("foo".to_owned(), "nonexistent".to_owned())]);
        assert_matches!(
            Taxonomy::new(&none, &aliases),
            Err(Error::AliasUnknownTarget { alias, target })
                if alias == "foo" && target == "nonexistent"
        );

        let aliases = BTreeMap::from([("system".to_owned(), "vendor".to_owned())]);
        assert_matches!(
            Taxonomy::new(&none, &aliases),
            Err(Error::AliasShadowsPartition(a)) if a == "system"
        );

        let aliases = BTreeMap::from([
            ("foo".to_owned(), "bar".to_owned()),
            ("bar".to_owned(), "foo".to_owned()),
        ]);
        assert_matches!(Taxonomy::new(&none, &aliases), Err(Error::AliasCycle(_)));

        let partitions = BTreeMap::from([("../etc".to_owned(), PartitionType::Raw)]);
        assert_matches!(Taxonomy::new(&partitions, &BTreeMap::new()), Err(Error::InvalidName(_)));
    }
}
