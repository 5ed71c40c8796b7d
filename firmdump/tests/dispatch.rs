// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, sync::atomic::AtomicBool};

use assert_matches::assert_matches;
use firmdump::{
    config::{self, Tools},
    dispatch::{self, Error, Extraction, FILE_LIST_NAME},
    taxonomy::{PartitionType, Taxonomy},
};

fn failing_tools() -> Tools {
    Tools {
        erofs: vec!["false".to_owned()],
        sevenzip: vec!["false".to_owned()],
        boot_image: vec!["false".to_owned()],
    }
}

#[cfg(unix)]
#[test]
fn dispatch_in_taxonomy_order() {
    let cancel_signal = AtomicBool::new(false);
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let config = config::parse_config(
        r#"
        [partitions]
        custom_fw = "raw"
        "#,
    )
    .unwrap();
    let taxonomy = config.taxonomy().unwrap();

    fs::write(raw.path().join("boot.img"), b"ANDROID!kernel").unwrap();
    fs::write(raw.path().join("system.img"), b"not a filesystem").unwrap();
    fs::write(raw.path().join("custom_fw.img"), b"firmware").unwrap();
    fs::write(raw.path().join("unknown.img"), b"ignored").unwrap();

    let tools = failing_tools();
    let dispatched =
        dispatch::dispatch_all(&taxonomy, raw.path(), out.path(), &tools, &cancel_signal).unwrap();

    let summary = dispatched
        .iter()
        .map(|d| (d.name.as_str(), d.partition_type))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        [
            ("system", PartitionType::Filesystem),
            ("boot", PartitionType::BootImage),
            ("custom_fw", PartitionType::Raw),
        ],
    );

    assert_matches!(&dispatched[0].result, Ok(Extraction::Failed(f)) if f.len() == 2);
    assert_matches!(&dispatched[1].result, Ok(Extraction::Failed(f)) if f.len() == 1);
    assert_matches!(&dispatched[2].result, Ok(Extraction::CopyOnly));

    dispatch::check_required(&dispatched).unwrap();

    assert_eq!(dispatch::write_file_list(out.path(), None).unwrap(), 3);
    assert_eq!(
        fs::read_to_string(out.path().join(FILE_LIST_NAME)).unwrap(),
        "boot.img\ncustom_fw.img\nsystem.img\n",
    );
    assert_eq!(fs::read(out.path().join("boot.img")).unwrap(), b"ANDROID!kernel");
}

#[test]
fn missing_system_still_writes_outputs() {
    let cancel_signal = AtomicBool::new(false);
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let taxonomy = Taxonomy::default();

    fs::write(raw.path().join("vbmeta.img"), b"AVB0").unwrap();

    let tools = failing_tools();
    let dispatched =
        dispatch::dispatch_all(&taxonomy, raw.path(), out.path(), &tools, &cancel_signal).unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_matches!(&dispatched[0].result, Ok(Extraction::CopyOnly));

    assert_eq!(dispatch::write_file_list(out.path(), None).unwrap(), 1);
    assert_matches!(dispatch::check_required(&dispatched), Err(Error::MissingSystem));
    assert_eq!(
        fs::read_to_string(out.path().join(FILE_LIST_NAME)).unwrap(),
        "vbmeta.img\n",
    );
}

#[test]
fn cancel_between_partitions() {
    let cancel_signal = AtomicBool::new(true);
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let taxonomy = Taxonomy::default();

    fs::write(raw.path().join("vbmeta.img"), b"AVB0").unwrap();

    let tools = Tools::default();
    assert_matches!(
        dispatch::dispatch_all(&taxonomy, raw.path(), out.path(), &tools, &cancel_signal),
        Err(Error::Cancelled(_))
    );
    assert!(!out.path().join("vbmeta.img").exists());
}
