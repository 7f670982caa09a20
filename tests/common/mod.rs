//! Shared harness for the integration suites.
#![allow(dead_code)]

use fam_runtime::{Fam, FamOptions, ThreadModel};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fam_runtime=debug")
        .try_init();
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let n = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("fam_it_{}_{}_{}", tag, std::process::id(), n))
}

pub fn test_options(servers: u64, tag: &str) -> FamOptions {
    FamOptions {
        num_memory_servers: Some(servers),
        memory_per_server: Some(64 * 1024 * 1024),
        interleave_size: Some(4096),
        backup_path: Some(scratch_dir(tag)),
        thread_model: Some(ThreadModel::Multiple),
        ..Default::default()
    }
}

pub fn runtime(servers: u64, tag: &str) -> Fam {
    init_tracing();
    Fam::initialize(&test_options(servers, tag)).unwrap()
}

#[allow(dead_code)]
pub fn i32s_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[allow(dead_code)]
pub fn bytes_to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
