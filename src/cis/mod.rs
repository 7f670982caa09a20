//! Client Information Service: the control-plane contract.
//!
//! One capability trait, two interchangeable backends: an in-process direct
//! implementation and a network stub. Everything above this layer holds the
//! capability and is oblivious to which backend is in use. Region ids
//! crossing this boundary are always pure (memory-server bits masked off).

pub mod direct;
pub mod rpc;
pub mod server;
pub(crate) mod wire;

pub use direct::DirectCis;
pub use rpc::RpcCis;
pub use server::CisServer;

use crate::descriptor::{PermissionLevel, RegionAttributes};
use crate::engine::{BackupTag, CopyTag, DeleteBackupTag, RestoreTag};
use crate::error::{FamError, FamResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-server registration info for the currently-known extents of a region.
/// `keys` and `base` are co-indexed by extent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegionMemory {
    pub keys: Vec<u64>,
    pub base: Vec<u64>,
}

/// Monotonically growing cache: memory server id -> registration info.
pub type RegionMemoryMap = HashMap<u64, RegionMemory>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_id: u64,
    pub offset: u64,
    pub name: String,
    pub size: u64,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub attrs: RegionAttributes,
    pub interleave_size: u64,
    pub used_memsrv_cnt: u64,
    pub memserver_ids: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemInfo {
    pub region_id: u64,
    /// Encoded offset of extent 0; the item's global offset.
    pub offset: u64,
    pub name: String,
    pub size: u64,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub used_memsrv_cnt: u64,
    pub memserver_ids: Vec<u64>,
    /// Per-extent encoded offsets, co-indexed with `memserver_ids`.
    pub dataitem_offsets: Vec<u64>,
    pub interleave_size: u64,
    pub permission_level: PermissionLevel,
    /// Whether per-item memory registration succeeded; only meaningful for
    /// data-item-level permission.
    pub item_registration_status: bool,
    pub dataitem_keys: Vec<u64>,
    pub base_addr_list: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemServerInfo {
    pub id: u64,
    pub addr: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub item_name: String,
    pub created_epoch_secs: u64,
}

/// Arguments of the asynchronous cross-item copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CisCopyRequest {
    pub src_region_id: u64,
    pub src_offset: u64,
    pub src_used_memsrv_cnt: u64,
    pub src_copy_start: u64,
    pub src_keys: Vec<u64>,
    pub src_base_addr_list: Vec<u64>,
    pub dst_region_id: u64,
    pub dst_offset: u64,
    pub dst_copy_start: u64,
    pub nbytes: u64,
    pub src_memserver_id: u64,
    pub dst_memserver_id: u64,
    pub uid: u32,
    pub gid: u32,
}

/// Opaque wait object returned by the asynchronous control-plane calls;
/// consumed by the matching `wait_for_*`.
pub struct CisWaitObject {
    pub(crate) inner: WaitObjInner,
}

impl std::fmt::Debug for CisWaitObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CisWaitObject").finish()
    }
}

pub(crate) type RpcResponseReceiver =
    tokio::sync::oneshot::Receiver<Result<wire::CisResponse, FamError>>;

pub(crate) enum WaitObjInner {
    Copy(Arc<CopyTag>),
    Backup(Arc<BackupTag>),
    Restore(Arc<RestoreTag>),
    DeleteBackup(Arc<DeleteBackupTag>),
    Rpc(RpcResponseReceiver),
}

impl CisWaitObject {
    pub(crate) fn new(inner: WaitObjInner) -> Self {
        Self { inner }
    }
}

pub(crate) fn wrong_wait_object() -> FamError {
    FamError::new(
        crate::error::FamErrorKind::InvalidOp,
        "wait object does not match this operation",
    )
}

/// Control-plane operations against the central allocator/locator.
pub trait Cis: Send + Sync {
    fn get_num_memory_servers(&self) -> FamResult<u64>;

    fn create_region(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        attrs: &RegionAttributes,
        uid: u32,
        gid: u32,
    ) -> FamResult<RegionInfo>;

    fn destroy_region(&self, region_id: u64, memserver_id: u64, uid: u32, gid: u32)
        -> FamResult<()>;

    fn resize_region(
        &self,
        region_id: u64,
        nbytes: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn allocate(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo>;

    fn deallocate(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()>;

    fn change_region_permission(
        &self,
        region_id: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn change_dataitem_permission(
        &self,
        region_id: u64,
        offset: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()>;

    fn lookup_region(&self, name: &str, uid: u32, gid: u32) -> FamResult<RegionInfo>;

    fn lookup(&self, item_name: &str, region_name: &str, uid: u32, gid: u32)
        -> FamResult<ItemInfo>;

    fn check_permission_get_region_info(
        &self,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<RegionInfo>;

    fn check_permission_get_item_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo>;

    fn get_stat_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo>;

    /// Registers the region's memory for this client and returns the
    /// per-server registration map, bumping the server-side open count.
    fn open_region_with_registration(
        &self,
        region_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<(Vec<u64>, RegionMemoryMap)>;

    fn open_region_without_registration(&self, region_id: u64) -> FamResult<Vec<u64>>;

    /// Drops the server-side open count taken by `open_region_*`.
    fn close_region(&self, region_id: u64, memserver_ids: &[u64]) -> FamResult<()>;

    /// Refresh call used when a descriptor references an extent beyond what
    /// the cached map covers.
    fn get_region_memory(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<RegionMemoryMap>;

    fn copy(&self, req: &CisCopyRequest) -> FamResult<CisWaitObject>;
    fn wait_for_copy(&self, wait: CisWaitObject) -> FamResult<()>;

    fn backup(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject>;
    fn wait_for_backup(&self, wait: CisWaitObject) -> FamResult<()>;

    fn restore(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject>;
    fn wait_for_restore(&self, wait: CisWaitObject) -> FamResult<()>;

    fn delete_backup(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject>;
    fn wait_for_delete_backup(&self, wait: CisWaitObject) -> FamResult<()>;

    fn list_backup(&self, backup_name: &str, memserver_id: u64, uid: u32, gid: u32)
        -> FamResult<String>;

    fn get_backup_info(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<BackupInfo>;

    /// Server-side mutex for 128-bit compare-and-swap, keyed by
    /// `(memory server, offset)`.
    fn acquire_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()>;
    fn release_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()>;

    fn get_addr_size(&self, memserver_id: u64) -> FamResult<u64>;
    fn get_addr(&self, memserver_id: u64) -> FamResult<Vec<u8>>;

    fn get_memserverinfo_size(&self) -> FamResult<u64>;
    fn get_memserverinfo(&self) -> FamResult<Vec<MemServerInfo>>;
}
