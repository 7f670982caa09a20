//! Region and data-item lifecycle against the direct backend.

mod common;

use common::runtime;
use fam_runtime::{DescStatus, FamErrorKind, RegionAttributes};

#[test]
fn create_destroy_loop() {
    let fam = runtime(1, "lifecycle_loop");

    let regions: Vec<_> = (0..10)
        .map(|i| {
            fam.create_region(&format!("r_{}", i), 1 << 20, 0o777, None)
                .unwrap()
        })
        .collect();

    for region in regions.iter().rev() {
        fam.destroy_region(region).unwrap();
    }

    let err = fam.lookup_region("r_0").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn destroy_is_not_repeatable() {
    let fam = runtime(1, "lifecycle_double");
    let region = fam.create_region("once", 1 << 20, 0o777, None).unwrap();
    fam.destroy_region(&region).unwrap();
    let err = fam.destroy_region(&region).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn allocate_lookup_and_stat() {
    let fam = runtime(2, "lifecycle_lookup");
    let region = fam.create_region("inventory", 8 << 20, 0o777, None).unwrap();
    let item = fam.allocate("prices", 256 * 1024, 0o640, &region).unwrap();
    assert_eq!(item.status(), DescStatus::InitDone);

    let found_region = fam.lookup_region("inventory").unwrap();
    assert_eq!(
        found_region.global_id().pure_region_id(),
        region.global_id().pure_region_id()
    );
    assert_eq!(found_region.size(), 8 << 20);

    let found_item = fam.lookup("prices", "inventory").unwrap();
    assert_eq!(found_item.status(), DescStatus::KeyNotValid);
    assert_eq!(found_item.size(), 256 * 1024);
    assert_eq!(found_item.global_id(), item.global_id());

    let info = fam.stat(&item).unwrap();
    assert_eq!(info.name, "prices");
    assert_eq!(info.size, 256 * 1024);
    assert_eq!(info.perm, 0o640);

    let err = fam.lookup("volumes", "inventory").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn duplicate_names_are_rejected() {
    let fam = runtime(1, "lifecycle_dup");
    let region = fam.create_region("dup", 1 << 20, 0o777, None).unwrap();
    let err = fam.create_region("dup", 1 << 20, 0o777, None).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::AlreadyExist);

    fam.allocate("it", 1024, 0o600, &region).unwrap();
    let err = fam.allocate("it", 1024, 0o600, &region).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::AlreadyExist);
}

#[test]
fn deallocate_frees_the_name_and_the_space() {
    let fam = runtime(1, "lifecycle_dealloc");
    let region = fam.create_region("recycle", 1 << 20, 0o777, None).unwrap();

    // Allocate/deallocate in a loop; space and the name must be reusable.
    for _ in 0..20 {
        let item = fam.allocate("tmp", 256 * 1024, 0o600, &region).unwrap();
        fam.deallocate(&item).unwrap();
        assert_eq!(item.status(), DescStatus::Invalid);
    }
    let err = fam.lookup("tmp", "recycle").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn resize_makes_room_for_more_items() {
    let fam = runtime(2, "lifecycle_resize");
    let region = fam.create_region("expanding", 128 * 1024, 0o777, None).unwrap();

    // Seed an item so the region's registration map is cached.
    fam.allocate("seed", 16 * 1024, 0o600, &region).unwrap();

    fam.resize_region(&region, 16 << 20).unwrap();
    for i in 0..8 {
        let item = fam
            .allocate(&format!("wave_{}", i), 1 << 20, 0o600, &region)
            .unwrap();
        assert_eq!(item.status(), DescStatus::InitDone);
    }
}

#[test]
fn region_attributes_round_trip() {
    let fam = runtime(1, "lifecycle_attrs");
    let attrs = RegionAttributes {
        permission_level: fam_runtime::PermissionLevel::DataItem,
        interleave_enable: fam_runtime::InterleaveEnable::Disable,
        ..RegionAttributes::default()
    };
    let region = fam
        .create_region("item_perm", 1 << 20, 0o777, Some(attrs))
        .unwrap();
    assert_eq!(
        region.permission_level(),
        fam_runtime::PermissionLevel::DataItem
    );

    // Data-item-level permission binds keys straight from allocate.
    let item = fam.allocate("direct_keys", 4096, 0o600, &region).unwrap();
    assert_eq!(item.status(), DescStatus::InitDone);
    assert!(item.keys().is_some());
}

#[test]
fn permission_change_is_visible_through_stat() {
    let fam = runtime(1, "lifecycle_chmod");
    let region = fam.create_region("modes", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("guarded", 4096, 0o600, &region).unwrap();

    fam.change_dataitem_permission(&item, 0o664).unwrap();
    let info = fam.stat(&item).unwrap();
    assert_eq!(info.perm, 0o664);

    fam.change_region_permission(&region, 0o750).unwrap();
    let info = fam.region_info(&region).unwrap();
    assert_eq!(info.perm, 0o750);
}

#[test]
fn fabric_address_exchange() {
    let fam = runtime(3, "lifecycle_addrs");
    assert_eq!(fam.get_num_memory_servers().unwrap(), 3);
    for id in 0..3 {
        let size = fam.get_addr_size(id).unwrap();
        let addr = fam.get_addr(id).unwrap();
        assert_eq!(addr.len() as u64, size);
    }
    let info = fam.get_memserverinfo().unwrap();
    assert_eq!(info.len(), 3);
    assert!(fam.get_memserverinfo_size().unwrap() > 0);

    let err = fam.get_addr(9).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::RpcClientNotFound);
}

#[test]
fn finalize_is_idempotent() {
    let fam = runtime(1, "lifecycle_finalize");
    let region = fam.create_region("f", 1 << 20, 0o777, None).unwrap();
    fam.allocate("it", 4096, 0o600, &region).unwrap();
    fam.finalize().unwrap();
    fam.finalize().unwrap();
}
