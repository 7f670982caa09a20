//! Backup, restore and backup deletion round trips.

mod common;

use common::runtime;
use fam_runtime::FamErrorKind;

#[test]
fn backup_restore_round_trip() {
    let fam = runtime(1, "bk_round_trip");
    let region = fam.create_region("vault", 1 << 20, 0o777, None).unwrap();
    let src = fam.allocate("ledger", 64 * 1024, 0o640, &region).unwrap();

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 239) as u8).collect();
    fam.put_blocking(&payload, &src, 0).unwrap();

    let wait = fam.backup(&src, "ledger.snap").unwrap();
    fam.wait_for_backup(wait).unwrap();

    let info = fam.get_backup_info("ledger.snap").unwrap();
    assert_eq!(info.name, "ledger.snap");
    assert_eq!(info.size, 64 * 1024);
    assert_eq!(info.item_name, "ledger");
    assert_eq!(info.mode, 0o640);

    let listing = fam.list_backup("*").unwrap();
    assert!(listing.contains("ledger.snap"));

    // Restore into a fresh item and compare contents.
    let dst = fam.allocate("recovered", 64 * 1024, 0o600, &region).unwrap();
    let wait = fam.restore("ledger.snap", &dst).unwrap();
    fam.wait_for_restore(wait).unwrap();

    let mut out = vec![0u8; payload.len()];
    fam.get_blocking(&mut out, &dst, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn backup_of_interleaved_item_restores_into_different_layout() {
    let fam = runtime(3, "bk_layout");
    let region = fam.create_region("striped", 8 << 20, 0o777, None).unwrap();
    let src = fam.allocate("wide", 200_000, 0o600, &region).unwrap();
    assert_eq!(src.used_memsrv_cnt(), 3);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 233) as u8).collect();
    fam.put_blocking(&payload, &src, 0).unwrap();

    let wait = fam.backup(&src, "wide.snap").unwrap();
    fam.wait_for_backup(wait).unwrap();

    // Destination with a different server fan-out: a non-interleaved region
    // keeps the whole item on one server.
    let attrs = fam_runtime::RegionAttributes {
        interleave_enable: fam_runtime::InterleaveEnable::Disable,
        ..fam_runtime::RegionAttributes::default()
    };
    let narrow_region = fam
        .create_region("narrow", 1 << 20, 0o777, Some(attrs))
        .unwrap();
    let dst = fam.allocate("narrow_copy", 256 * 1024, 0o600, &narrow_region).unwrap();
    assert_eq!(dst.used_memsrv_cnt(), 1);

    let wait = fam.restore("wide.snap", &dst).unwrap();
    fam.wait_for_restore(wait).unwrap();

    let mut out = vec![0u8; payload.len()];
    fam.get_blocking(&mut out, &dst, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn restore_into_too_small_item_is_rejected() {
    let fam = runtime(1, "bk_too_small");
    let region = fam.create_region("tight", 1 << 20, 0o777, None).unwrap();
    let src = fam.allocate("big", 8192, 0o600, &region).unwrap();
    fam.put_blocking(&[5u8; 8192], &src, 0).unwrap();

    let wait = fam.backup(&src, "big.snap").unwrap();
    fam.wait_for_backup(wait).unwrap();

    let small = fam.allocate("small", 4096, 0o600, &region).unwrap();
    let err = fam.restore("big.snap", &small).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::OutOfRange);
}

#[test]
fn duplicate_backup_name_is_rejected() {
    let fam = runtime(1, "bk_dup");
    let region = fam.create_region("dup", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("it", 4096, 0o600, &region).unwrap();
    fam.put_blocking(&[1u8; 4096], &item, 0).unwrap();

    let wait = fam.backup(&item, "snap").unwrap();
    fam.wait_for_backup(wait).unwrap();
    let err = fam.backup(&item, "snap").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::AlreadyExist);
}

#[test]
fn delete_backup_removes_the_catalog_entry() {
    let fam = runtime(2, "bk_delete");
    let region = fam.create_region("gone", 8 << 20, 0o777, None).unwrap();
    let item = fam.allocate("it", 64 * 1024, 0o600, &region).unwrap();
    fam.put_blocking(&[9u8; 64 * 1024], &item, 0).unwrap();

    let wait = fam.backup(&item, "doomed").unwrap();
    fam.wait_for_backup(wait).unwrap();
    assert!(fam.get_backup_info("doomed").is_ok());

    let wait = fam.delete_backup("doomed").unwrap();
    fam.wait_for_delete_backup(wait).unwrap();

    let err = fam.get_backup_info("doomed").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
    let err = fam.delete_backup("doomed").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn invalid_and_missing_backup_names() {
    let fam = runtime(1, "bk_names");
    let region = fam.create_region("n", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("it", 4096, 0o600, &region).unwrap();

    let err = fam.backup(&item, "../escape").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.backup(&item, "").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.restore("nonexistent", &item).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}
