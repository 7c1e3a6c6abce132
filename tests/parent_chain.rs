mod common;

use std::fs;

use common::*;
use exhume_vmdk::{VmdkError, VMDK};

const CHILD_LINK: &str = "parentCID=fffffffe\nparentFileNameHint=\"base.vmdk\"";

#[test]
fn unallocated_grains_come_from_parent() {
    let dir = tempfile::tempdir().unwrap();
    let base = grain_pattern(16 * SECTOR, 200);
    write_flat(dir.path(), "base", &base, "");

    let child_path = dir.path().join("child.vmdk");
    let image = SparseImage::new(16, 8, 512).pattern_grain(1, 3);
    write_monolithic_sparse(&child_path, &image, CHILD_LINK);

    let mut child = VMDK::open(&child_path).unwrap();
    assert!(child.parent().is_some());
    for address in 0..8usize {
        assert_eq!(
            child.read_sector(address as u64).unwrap(),
            &base[address * SECTOR..(address + 1) * SECTOR]
        );
    }
    assert_eq!(
        child.read_sector(8).unwrap(),
        &grain_pattern(8 * SECTOR, 3)[..SECTOR]
    );

    let info = child.info();
    assert_eq!(info.parent_cid, Some(0xffff_fffe));
    assert_eq!(info.parent.map(|p| p.total_sectors), Some(16));
}

#[test]
fn zeroed_grain_hides_parent() {
    let dir = tempfile::tempdir().unwrap();
    write_flat(dir.path(), "base", &vec![0x77u8; 16 * SECTOR], "");

    let child_path = dir.path().join("child.vmdk");
    let image = SparseImage::new(16, 8, 512).grain(0, Grain::Zeroed);
    write_monolithic_sparse(&child_path, &image, CHILD_LINK);

    let mut child = VMDK::open(&child_path).unwrap();
    assert_eq!(child.read_sector(0).unwrap(), vec![0u8; SECTOR]);
    assert_eq!(child.read_sector(8).unwrap(), vec![0x77u8; SECTOR]);
}

#[test]
fn three_level_chain() {
    let dir = tempfile::tempdir().unwrap();
    write_flat(dir.path(), "base", &vec![0x10u8; 24 * SECTOR], "");

    let middle = SparseImage::new(24, 8, 512).pattern_grain(1, 20);
    write_monolithic_sparse(&dir.path().join("middle.vmdk"), &middle, CHILD_LINK);

    let top = SparseImage::new(24, 8, 512).pattern_grain(2, 30);
    write_monolithic_sparse(
        &dir.path().join("top.vmdk"),
        &top,
        "parentCID=fffffffe\nparentFileNameHint=\"middle.vmdk\"",
    );

    let mut vmdk = VMDK::open(dir.path().join("top.vmdk")).unwrap();
    assert_eq!(vmdk.read_sector(0).unwrap(), vec![0x10u8; SECTOR]);
    assert_eq!(
        vmdk.read_sector(8).unwrap(),
        &grain_pattern(8 * SECTOR, 20)[..SECTOR]
    );
    assert_eq!(
        vmdk.read_sector(16).unwrap(),
        &grain_pattern(8 * SECTOR, 30)[..SECTOR]
    );
}

#[test]
fn parent_shorter_than_child() {
    let dir = tempfile::tempdir().unwrap();
    write_flat(dir.path(), "base", &vec![0x33u8; 8 * SECTOR], "");

    let child_path = dir.path().join("child.vmdk");
    write_monolithic_sparse(&child_path, &SparseImage::new(16, 8, 512), CHILD_LINK);

    let mut child = VMDK::open(&child_path).unwrap();
    assert_eq!(child.read_sector(7).unwrap(), vec![0x33u8; SECTOR]);
    assert!(matches!(
        child.read_sector(8),
        Err(VmdkError::OutOfRange { sector: 8, .. })
    ));
}

#[test]
fn missing_parent() {
    let dir = tempfile::tempdir().unwrap();
    let child_path = dir.path().join("child.vmdk");
    write_monolithic_sparse(&child_path, &SparseImage::new(16, 8, 512), CHILD_LINK);

    match VMDK::open(&child_path) {
        Err(VmdkError::ParentNotFound(path)) => assert!(path.ends_with("base.vmdk")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("child opened without its parent"),
    }
}

#[test]
fn broken_parent() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("base.vmdk"), "garbage").unwrap();
    let child_path = dir.path().join("child.vmdk");
    write_monolithic_sparse(&child_path, &SparseImage::new(16, 8, 512), CHILD_LINK);

    match VMDK::open(&child_path) {
        Err(VmdkError::ParentOpenFailed { path, source }) => {
            assert!(path.ends_with("base.vmdk"));
            assert!(matches!(*source, VmdkError::MalformedDescriptor(_)));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("child opened with a broken parent"),
    }
}

#[test]
fn parent_cycle_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    for (name, parent) in [("a", "b"), ("b", "a")] {
        fs::write(
            dir.path().join(format!("{}.vmdk", name)),
            descriptor_text(
                "custom",
                &format!("parentCID=fffffffe\nparentFileNameHint=\"{}.vmdk\"", parent),
                "RW 16 ZERO",
            ),
        )
        .unwrap();
    }

    match VMDK::open(dir.path().join("a.vmdk")) {
        Err(VmdkError::ParentCycleDetected(path)) => assert!(path.ends_with("a.vmdk")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("cyclic chain opened"),
    }
}

#[test]
fn image_naming_itself_as_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self.vmdk");
    fs::write(
        &path,
        descriptor_text(
            "custom",
            "parentCID=fffffffe\nparentFileNameHint=\"./self.vmdk\"",
            "RW 16 ZERO",
        ),
    )
    .unwrap();
    assert!(matches!(
        VMDK::open(&path),
        Err(VmdkError::ParentCycleDetected(_))
    ));
}
