//! Network CIS backend exercised against the wire server fronting the
//! direct backend, all in-process.

mod common;

use common::{init_tracing, test_options};
use fam_runtime::{
    Cis, CisInterfaceType, CisServer, DirectCis, Fam, FamConfig, FamErrorKind, FamOptions,
};
use std::sync::Arc;

/// Bring up a direct backend behind the wire server and a runtime that
/// reaches it over the RPC interface.
fn rpc_runtime(servers: u64, tag: &str) -> Fam {
    init_tracing();
    let server_config = FamConfig::resolve(&test_options(servers, tag)).unwrap();
    let cis: Arc<dyn Cis> = Arc::new(DirectCis::new(&server_config).unwrap());
    let addr = CisServer::start(cis, "127.0.0.1:0").unwrap();

    let options = FamOptions {
        cis_interface_type: Some(CisInterfaceType::Rpc),
        cis_server: Some("127.0.0.1".to_string()),
        grpc_port: Some(addr.port()),
        ..test_options(servers, tag)
    };
    Fam::initialize(&options).unwrap()
}

#[test]
fn lifecycle_over_the_wire() {
    let fam = rpc_runtime(1, "rpc_lifecycle");
    assert_eq!(fam.get_num_memory_servers().unwrap(), 1);

    let region = fam.create_region("remote", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("it", 64 * 1024, 0o600, &region).unwrap();
    assert_eq!(item.size(), 64 * 1024);

    let found = fam.lookup("it", "remote").unwrap();
    assert_eq!(found.global_id(), item.global_id());

    let err = fam.lookup_region("missing").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);

    fam.deallocate(&item).unwrap();
    fam.destroy_region(&region).unwrap();
    let err = fam.lookup_region("remote").unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::NotFound);
}

#[test]
fn data_path_over_rpc_metadata() {
    let fam = rpc_runtime(2, "rpc_datapath");
    let region = fam.create_region("remote_data", 8 << 20, 0o777, None).unwrap();
    let item = fam.allocate("payload", 256 * 1024, 0o600, &region).unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 229) as u8).collect();
    fam.put_blocking(&payload, &item, 64).unwrap();
    let mut out = vec![0u8; payload.len()];
    fam.get_blocking(&mut out, &item, 64).unwrap();
    assert_eq!(out, payload);

    fam.put_nonblocking(&payload, &item, 128_000).unwrap();
    fam.quiet().unwrap();
    let mut out = vec![0u8; payload.len()];
    fam.get_blocking(&mut out, &item, 128_000).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn lazy_rehydration_over_the_wire() {
    let fam = rpc_runtime(2, "rpc_rehydrate");
    let region = fam.create_region("lazy", 8 << 20, 0o777, None).unwrap();
    let item = fam.allocate("bound", 64 * 1024, 0o600, &region).unwrap();
    fam.put_blocking(b"written through allocate", &item, 0).unwrap();

    // A looked-up descriptor has no keys until first use.
    let found = fam.lookup("bound", "lazy").unwrap();
    assert!(found.keys().is_none());
    let mut out = vec![0u8; 24];
    fam.get_blocking(&mut out, &found, 0).unwrap();
    assert_eq!(&out, b"written through allocate");
    assert!(found.keys().is_some());
}

#[test]
fn async_copy_waits_for_the_server_response() {
    let fam = rpc_runtime(1, "rpc_copy");
    let region = fam.create_region("cp", 2 << 20, 0o777, None).unwrap();
    let src = fam.allocate("src", 64 * 1024, 0o600, &region).unwrap();
    let dst = fam.allocate("dst", 64 * 1024, 0o600, &region).unwrap();

    fam.put_blocking(b"Test message\0", &src, 0).unwrap();
    let wait = fam.copy(&src, 0, &dst, 0, 13).unwrap();
    fam.wait_for_copy(wait).unwrap();

    let mut out = vec![0u8; 13];
    fam.get_blocking(&mut out, &dst, 0).unwrap();
    assert_eq!(&out, b"Test message\0");
}

#[test]
fn backup_and_restore_over_the_wire() {
    let fam = rpc_runtime(2, "rpc_backup");
    let region = fam.create_region("bk", 8 << 20, 0o777, None).unwrap();
    let src = fam.allocate("state", 32 * 1024, 0o600, &region).unwrap();
    fam.put_blocking(&vec![0x5au8; 32 * 1024], &src, 0).unwrap();

    let wait = fam.backup(&src, "state.snap").unwrap();
    fam.wait_for_backup(wait).unwrap();
    let info = fam.get_backup_info("state.snap").unwrap();
    assert_eq!(info.size, 32 * 1024);

    let dst = fam.allocate("state2", 32 * 1024, 0o600, &region).unwrap();
    let wait = fam.restore("state.snap", &dst).unwrap();
    fam.wait_for_restore(wait).unwrap();
    let mut out = vec![0u8; 32 * 1024];
    fam.get_blocking(&mut out, &dst, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0x5a));

    let wait = fam.delete_backup("state.snap").unwrap();
    fam.wait_for_delete_backup(wait).unwrap();
    assert_eq!(
        fam.get_backup_info("state.snap").unwrap_err().kind(),
        FamErrorKind::NotFound
    );
}

#[test]
fn server_side_errors_propagate_with_their_kind() {
    let fam = rpc_runtime(1, "rpc_errors");
    let region = fam.create_region("errs", 1 << 20, 0o777, None).unwrap();
    fam.allocate("taken", 4096, 0o600, &region).unwrap();

    let err = fam.allocate("taken", 4096, 0o600, &region).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::AlreadyExist);

    let err = fam
        .create_region("errs", 1 << 20, 0o777, None)
        .unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::AlreadyExist);
}

#[test]
fn atomics_on_rpc_backed_items() {
    let fam = rpc_runtime(1, "rpc_atomics");
    let region = fam.create_region("at", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("cell", 4096, 0o600, &region).unwrap();

    fam.atomic_set::<u64>(&item, 0, 41).unwrap();
    assert_eq!(fam.atomic_fetch_add::<u64>(&item, 0, 1).unwrap(), 41);
    assert_eq!(fam.atomic_fetch::<u64>(&item, 0).unwrap(), 42);

    // The 128-bit path acquires the CAS mutex over the wire.
    fam.atomic_set_i128(&item, 16, 1 << 99).unwrap();
    assert_eq!(
        fam.compare_swap_i128(&item, 16, 1 << 99, 3).unwrap(),
        1 << 99
    );
    assert_eq!(fam.atomic_fetch_i128(&item, 16).unwrap(), 3);
}
