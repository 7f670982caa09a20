//! Allocator client: region and data-item lifecycle.
//!
//! The only component besides the async engine that talks to the CIS. Owns
//! the CIS capability, the client resource manager, and the calling
//! process's identity. Data-item descriptors come back from `allocate` and
//! `lookup` with placement either bound (data-item-level permission) or
//! resolved lazily through the region memory map on first data-path use.

use crate::cis::{
    BackupInfo, Cis, CisCopyRequest, CisWaitObject, ItemInfo, RegionInfo, RegionMemory,
    RegionMemoryMap,
};
use crate::crm::{ClientResourceManager, ResourceEntry, FAM_REGISTER_MEMORY, FAM_RESOURCE_DEFAULT};
use crate::descriptor::{
    decode_offset, DataItemDescriptor, DescStatus, GlobalDescriptor, PermissionLevel,
    RegionAttributes, RegionDescriptor,
};
use crate::error::{FamError, FamResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct AllocatorClient {
    cis: Arc<dyn Cis>,
    crm: ClientResourceManager,
    uid: u32,
    gid: u32,
    resource_release: bool,
    backup_target: AtomicU64,
}

/// Registration map of an opened region: either the CRM-managed resource
/// entry, or a one-shot map when resource release is disabled and every
/// open round-trips to the server.
enum RegionMemoryHandle {
    Managed(Arc<ResourceEntry>),
    Unmanaged(Mutex<RegionMemoryMap>),
}

impl RegionMemoryHandle {
    fn lookup(&self, memserver_id: u64) -> Option<RegionMemory> {
        match self {
            RegionMemoryHandle::Managed(resource) => {
                resource.memory_map.read().get(&memserver_id).cloned()
            }
            RegionMemoryHandle::Unmanaged(map) => map.lock().get(&memserver_id).cloned(),
        }
    }
}

impl AllocatorClient {
    pub fn new(cis: Arc<dyn Cis>, resource_release: bool) -> Self {
        let uid = unsafe { libc::getuid() } as u32;
        let gid = unsafe { libc::getgid() } as u32;
        Self {
            crm: ClientResourceManager::new(Arc::clone(&cis)),
            cis,
            uid,
            gid,
            resource_release,
            backup_target: AtomicU64::new(0),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn get_num_memory_servers(&self) -> FamResult<u64> {
        self.cis.get_num_memory_servers()
    }

    fn open_region_with_registration(&self, region_id: u64) -> FamResult<RegionMemoryHandle> {
        if self.resource_release {
            let resource =
                self.crm
                    .open_resource(region_id, self.uid, self.gid, FAM_REGISTER_MEMORY)?;
            Ok(RegionMemoryHandle::Managed(resource))
        } else {
            let map = self.cis.get_region_memory(region_id, self.uid, self.gid)?;
            Ok(RegionMemoryHandle::Unmanaged(Mutex::new(map)))
        }
    }

    #[cfg_attr(not(feature = "resource-release-item-perm"), allow(dead_code))]
    fn open_region_without_registration(&self, region_id: u64) -> FamResult<()> {
        if self.resource_release {
            self.crm
                .open_resource(region_id, self.uid, self.gid, FAM_RESOURCE_DEFAULT)?;
        }
        Ok(())
    }

    pub fn close_region(&self, region_id: u64) -> FamResult<()> {
        if self.resource_release {
            self.crm.close_resource(region_id)
        } else {
            Ok(())
        }
    }

    pub fn close_all_regions(&self) -> FamResult<()> {
        if self.resource_release {
            self.crm.close_all_resources()
        } else {
            Ok(())
        }
    }

    pub fn create_region(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        attrs: &RegionAttributes,
    ) -> FamResult<RegionDescriptor> {
        let info = self
            .cis
            .create_region(name, nbytes, perm, attrs, self.uid, self.gid)?;
        let region =
            RegionDescriptor::new(GlobalDescriptor::new(info.region_id, info.offset), nbytes);
        region.fill(name, nbytes, perm, self.uid, self.gid, *attrs);
        region.advance_status(DescStatus::InitDone);
        Ok(region)
    }

    pub fn destroy_region(&self, region: &RegionDescriptor) -> FamResult<()> {
        let region_id = region.global_id().pure_region_id();
        region.advance_status(DescStatus::Invalid);
        self.cis
            .destroy_region(region_id, region.memserver_id(), self.uid, self.gid)
    }

    pub fn resize_region(&self, region: &RegionDescriptor, nbytes: u64) -> FamResult<()> {
        let region_id = region.global_id().pure_region_id();
        self.cis
            .resize_region(region_id, nbytes, region.memserver_id(), self.uid, self.gid)
    }

    pub fn allocate(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        region: &RegionDescriptor,
    ) -> FamResult<DataItemDescriptor> {
        let region_id = region.global_id().pure_region_id();
        let permission_level = region.permission_level();
        let info = self.cis.allocate(
            name,
            nbytes,
            perm,
            region_id,
            region.memserver_id(),
            self.uid,
            self.gid,
        )?;

        // The item's global id embeds the server hosting extent 0; it can
        // not be reused as a region descriptor id.
        let global =
            GlobalDescriptor::with_memserver(region_id, info.memserver_ids[0], info.dataitem_offsets[0]);
        let item = DataItemDescriptor::new(global, nbytes);
        item.fill(
            name,
            info.perm,
            self.uid,
            self.gid,
            info.used_memsrv_cnt,
            &info.memserver_ids,
            info.interleave_size,
            permission_level,
        );
        item.advance_status(DescStatus::KeyNotValid);

        if permission_level == PermissionLevel::DataItem {
            #[cfg(feature = "resource-release-item-perm")]
            if self.open_region_without_registration(region_id).is_err() {
                return Ok(item);
            }
            if info.item_registration_status {
                item.bind_placement(&info.dataitem_keys, &info.base_addr_list);
            } else {
                #[cfg(feature = "resource-release-item-perm")]
                let _ = self.close_region(region_id);
            }
        } else {
            match self.resolve_region_level_placement(region_id, &info) {
                Ok((keys, bases)) => item.bind_placement(&keys, &bases),
                Err(err) => {
                    // Descriptor stays usable; keys resolve on first
                    // data-path use.
                    tracing::warn!(error = %err, item = name, "placement resolution deferred");
                }
            }
        }
        Ok(item)
    }

    /// Every successful `open_region_*` is matched by exactly one
    /// `close_region`; a failure after the open backs it out here.
    fn resolve_region_level_placement(
        &self,
        region_id: u64,
        info: &ItemInfo,
    ) -> FamResult<(Vec<u64>, Vec<u64>)> {
        let handle = self.open_region_with_registration(region_id)?;
        match self.resolve_with_handle(region_id, info, &handle) {
            Ok(placement) => Ok(placement),
            Err(err) => {
                let _ = self.close_region(region_id);
                Err(err)
            }
        }
    }

    fn resolve_with_handle(
        &self,
        region_id: u64,
        info: &ItemInfo,
        handle: &RegionMemoryHandle,
    ) -> FamResult<(Vec<u64>, Vec<u64>)> {
        let cnt = info.used_memsrv_cnt as usize;
        let mut keys = vec![0u64; cnt];
        let mut bases = vec![0u64; cnt];
        for i in 0..cnt {
            let server_id = info.memserver_ids[i];
            let (extent_idx, start) = decode_offset(info.dataitem_offsets[i]);
            let mut region_memory = handle.lookup(server_id).ok_or_else(|| {
                FamError::resource("registration info not found for memory server")
            })?;
            if extent_idx >= region_memory.keys.len() {
                // The cached map does not cover this extent yet (the region
                // was resized); refresh and retry once.
                self.refresh_region_memory(region_id, handle)?;
                region_memory = handle.lookup(server_id).ok_or_else(|| {
                    FamError::resource("registration info not found for memory server")
                })?;
                if extent_idx >= region_memory.keys.len() {
                    return Err(FamError::resource(
                        "requested extent not present in region memory map",
                    ));
                }
            }
            bases[i] = region_memory.base[extent_idx] + start;
            keys[i] = region_memory.keys[extent_idx];
        }
        Ok((keys, bases))
    }

    fn refresh_region_memory(
        &self,
        region_id: u64,
        handle: &RegionMemoryHandle,
    ) -> FamResult<()> {
        match handle {
            RegionMemoryHandle::Managed(resource) => {
                // Hold the resource write lock across the fetch so racing
                // refreshers serialize.
                let mut map = resource.memory_map.write();
                *map = self.cis.get_region_memory(region_id, self.uid, self.gid)?;
            }
            RegionMemoryHandle::Unmanaged(map) => {
                *map.lock() = self.cis.get_region_memory(region_id, self.uid, self.gid)?;
            }
        }
        Ok(())
    }

    /// Mark the descriptor invalid and drop the region reference it holds.
    pub fn close(&self, item: &DataItemDescriptor) -> FamResult<()> {
        // Only a fully-bound descriptor holds a region reference.
        let held_reference = item.status() == DescStatus::InitDone;
        item.advance_status(DescStatus::Invalid);
        let region_id = item.global_id().pure_region_id();
        match item.permission_level() {
            Some(PermissionLevel::Region) if held_reference => self.close_region(region_id),
            #[cfg(feature = "resource-release-item-perm")]
            Some(PermissionLevel::DataItem) if held_reference => self.close_region(region_id),
            _ => Ok(()),
        }
    }

    pub fn deallocate(&self, item: &DataItemDescriptor) -> FamResult<()> {
        let region_id = item.global_id().pure_region_id();
        let offset = item.global_id().offset;
        let first_memserver = item.first_memserver_id();
        self.close(item)?;
        self.cis
            .deallocate(region_id, offset, first_memserver, self.uid, self.gid)
    }

    pub fn lookup_region(&self, name: &str) -> FamResult<RegionDescriptor> {
        let info = self.cis.lookup_region(name, self.uid, self.gid)?;
        let region =
            RegionDescriptor::new(GlobalDescriptor::new(info.region_id, info.offset), info.size);
        region.fill(&info.name, info.size, info.perm, info.uid, info.gid, info.attrs);
        region.advance_status(DescStatus::InitDone);
        Ok(region)
    }

    pub fn lookup(&self, item_name: &str, region_name: &str) -> FamResult<DataItemDescriptor> {
        let info = self.cis.lookup(item_name, region_name, self.uid, self.gid)?;
        let global =
            GlobalDescriptor::with_memserver(info.region_id, info.memserver_ids[0], info.offset);
        let item = DataItemDescriptor::new(global, info.size);
        item.fill(
            &info.name,
            info.perm,
            info.uid,
            info.gid,
            info.used_memsrv_cnt,
            &info.memserver_ids,
            info.interleave_size,
            info.permission_level,
        );
        item.advance_status(DescStatus::KeyNotValid);
        Ok(item)
    }

    pub fn check_permission_get_region_info(
        &self,
        region: &RegionDescriptor,
    ) -> FamResult<RegionInfo> {
        let region_id = region.global_id().pure_region_id();
        let info = self.cis.check_permission_get_region_info(
            region_id,
            region.memserver_id(),
            self.uid,
            self.gid,
        )?;
        region.fill(&info.name, info.size, info.perm, info.uid, info.gid, info.attrs);
        region.advance_status(DescStatus::InitDone);
        Ok(info)
    }

    /// Lazy rehydration before data-path use: fetch item info and, for
    /// region-level permission, resolve keys and base addresses through the
    /// region memory map. Moves the descriptor to `InitDone` on success.
    pub fn check_permission_get_info(&self, item: &DataItemDescriptor) -> FamResult<ItemInfo> {
        let region_id = item.global_id().pure_region_id();
        let offset = item.global_id().offset;
        let info = self.cis.check_permission_get_item_info(
            region_id,
            offset,
            item.first_memserver_id(),
            self.uid,
            self.gid,
        )?;

        let (keys, bases) = if info.permission_level == PermissionLevel::DataItem {
            #[cfg(feature = "resource-release-item-perm")]
            self.open_region_without_registration(region_id)?;
            if !info.item_registration_status {
                return Err(FamError::resource(
                    "data item memory registration is not available",
                ));
            }
            (info.dataitem_keys.clone(), info.base_addr_list.clone())
        } else {
            self.resolve_region_level_placement(region_id, &info)?
        };

        item.fill(
            &info.name,
            info.perm,
            info.uid,
            info.gid,
            info.used_memsrv_cnt,
            &info.memserver_ids,
            info.interleave_size,
            info.permission_level,
        );
        item.set_size(info.size);
        item.bind_placement(&keys, &bases);
        Ok(info)
    }

    pub fn get_stat_info(&self, item: &DataItemDescriptor) -> FamResult<ItemInfo> {
        let region_id = item.global_id().pure_region_id();
        let info = self.cis.get_stat_info(
            region_id,
            item.global_id().offset,
            item.first_memserver_id(),
            self.uid,
            self.gid,
        )?;
        item.fill(
            &info.name,
            info.perm,
            info.uid,
            info.gid,
            info.used_memsrv_cnt,
            &info.memserver_ids,
            info.interleave_size,
            info.permission_level,
        );
        item.set_size(info.size);
        item.advance_status(DescStatus::KeyNotValid);
        Ok(info)
    }

    pub fn change_region_permission(
        &self,
        region: &RegionDescriptor,
        perm: u32,
    ) -> FamResult<()> {
        self.cis.change_region_permission(
            region.global_id().pure_region_id(),
            perm,
            region.memserver_id(),
            self.uid,
            self.gid,
        )
    }

    pub fn change_dataitem_permission(
        &self,
        item: &DataItemDescriptor,
        perm: u32,
    ) -> FamResult<()> {
        self.cis.change_dataitem_permission(
            item.global_id().pure_region_id(),
            item.global_id().offset,
            perm,
            item.first_memserver_id(),
            self.uid,
            self.gid,
        )
    }

    pub fn copy(
        &self,
        src: &DataItemDescriptor,
        src_copy_start: u64,
        dst: &DataItemDescriptor,
        dst_copy_start: u64,
        nbytes: u64,
    ) -> FamResult<CisWaitObject> {
        if src_copy_start + nbytes > src.size() {
            return Err(FamError::out_of_range(
                "source offset or size is beyond data item boundary",
            ));
        }
        if dst_copy_start + nbytes > dst.size() {
            return Err(FamError::out_of_range(
                "destination offset or size is beyond data item boundary",
            ));
        }
        let src_keys = src
            .keys()
            .ok_or_else(|| FamError::resource("source descriptor has no bound registration"))?;
        let src_bases = src
            .base_addrs()
            .ok_or_else(|| FamError::resource("source descriptor has no bound registration"))?;
        self.cis.copy(&CisCopyRequest {
            src_region_id: src.global_id().pure_region_id(),
            src_offset: src.global_id().offset,
            src_used_memsrv_cnt: src.used_memsrv_cnt(),
            src_copy_start,
            src_keys: src_keys.to_vec(),
            src_base_addr_list: src_bases.to_vec(),
            dst_region_id: dst.global_id().pure_region_id(),
            dst_offset: dst.global_id().offset,
            dst_copy_start,
            nbytes,
            src_memserver_id: src.first_memserver_id(),
            dst_memserver_id: dst.first_memserver_id(),
            uid: self.uid,
            gid: self.gid,
        })
    }

    pub fn wait_for_copy(&self, wait: CisWaitObject) -> FamResult<()> {
        self.cis.wait_for_copy(wait)
    }

    pub fn backup(&self, src: &DataItemDescriptor, backup_name: &str) -> FamResult<CisWaitObject> {
        self.cis.backup(
            src.global_id().pure_region_id(),
            src.global_id().offset,
            src.first_memserver_id(),
            backup_name,
            self.uid,
            self.gid,
        )
    }

    pub fn wait_for_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        self.cis.wait_for_backup(wait)
    }

    pub fn restore(&self, dst: &DataItemDescriptor, backup_name: &str) -> FamResult<CisWaitObject> {
        self.cis.restore(
            dst.global_id().pure_region_id(),
            dst.global_id().offset,
            dst.first_memserver_id(),
            backup_name,
            self.uid,
            self.gid,
        )
    }

    pub fn wait_for_restore(&self, wait: CisWaitObject) -> FamResult<()> {
        self.cis.wait_for_restore(wait)
    }

    fn backup_memserver(&self) -> FamResult<u64> {
        let servers = self.cis.get_num_memory_servers()?;
        if servers <= 1 {
            Ok(0)
        } else {
            Ok(self.backup_target.fetch_add(1, Ordering::Relaxed) % servers)
        }
    }

    pub fn delete_backup(&self, backup_name: &str) -> FamResult<CisWaitObject> {
        let memserver_id = self.backup_memserver()?;
        self.cis
            .delete_backup(backup_name, memserver_id, self.uid, self.gid)
    }

    pub fn wait_for_delete_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        self.cis.wait_for_delete_backup(wait)
    }

    pub fn list_backup(&self, backup_name: &str) -> FamResult<String> {
        let memserver_id = self.backup_memserver()?;
        self.cis
            .list_backup(backup_name, memserver_id, self.uid, self.gid)
    }

    pub fn get_backup_info(&self, backup_name: &str) -> FamResult<BackupInfo> {
        let memserver_id = self.backup_memserver()?;
        self.cis
            .get_backup_info(backup_name, memserver_id, self.uid, self.gid)
    }

    pub fn acquire_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        self.cis.acquire_cas_lock(offset, memserver_id)
    }

    pub fn release_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        self.cis.release_cas_lock(offset, memserver_id)
    }

    pub fn get_addr_size(&self, memserver_id: u64) -> FamResult<u64> {
        self.cis.get_addr_size(memserver_id)
    }

    pub fn get_addr(&self, memserver_id: u64) -> FamResult<Vec<u8>> {
        self.cis.get_addr(memserver_id)
    }

    pub fn get_memserverinfo_size(&self) -> FamResult<u64> {
        self.cis.get_memserverinfo_size()
    }

    pub fn get_memserverinfo(&self) -> FamResult<Vec<crate::cis::MemServerInfo>> {
        self.cis.get_memserverinfo()
    }

    #[cfg(test)]
    pub(crate) fn crm(&self) -> &ClientResourceManager {
        &self.crm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cis::DirectCis;
    use crate::config::{FamConfig, FamOptions};
    use crate::crm::ResourceStatus;

    fn allocator(servers: u64) -> AllocatorClient {
        let options = FamOptions {
            num_memory_servers: Some(servers),
            memory_per_server: Some(16 * 1024 * 1024),
            interleave_size: Some(4096),
            ..Default::default()
        };
        let config = FamConfig::resolve(&options).unwrap();
        let cis = Arc::new(DirectCis::new(&config).unwrap());
        AllocatorClient::new(cis, true)
    }

    #[test]
    fn allocate_binds_placement_and_takes_a_region_reference() {
        let alloc = allocator(2);
        let region = alloc
            .create_region("data", 4 << 20, 0o777, &RegionAttributes::default())
            .unwrap();
        let item = alloc.allocate("it", 64 * 1024, 0o600, &region).unwrap();
        assert_eq!(item.status(), DescStatus::InitDone);
        let keys = item.keys().unwrap();
        let bases = item.base_addrs().unwrap();
        assert_eq!(keys.len(), bases.len());
        assert_eq!(keys.len() as u64, item.used_memsrv_cnt());

        let region_id = region.global_id().pure_region_id();
        let entry = alloc.crm().find_resource(region_id).unwrap();
        assert_eq!(entry.state(), (ResourceStatus::Active, 1));
    }

    #[test]
    fn refcount_balance_over_allocate_and_lookup() {
        let alloc = allocator(2);
        let region = alloc
            .create_region("balance", 4 << 20, 0o777, &RegionAttributes::default())
            .unwrap();
        let region_id = region.global_id().pure_region_id();

        let items: Vec<_> = (0..3)
            .map(|i| {
                alloc
                    .allocate(&format!("item_{}", i), 32 * 1024, 0o600, &region)
                    .unwrap()
            })
            .collect();

        // Lookups bind lazily; rehydration takes the reference.
        let looked_up = alloc.lookup("item_0", "balance").unwrap();
        assert_eq!(looked_up.status(), DescStatus::KeyNotValid);
        alloc.check_permission_get_info(&looked_up).unwrap();
        assert_eq!(looked_up.status(), DescStatus::InitDone);

        let entry = alloc.crm().find_resource(region_id).unwrap();
        assert_eq!(entry.state(), (ResourceStatus::Active, 4));

        for item in &items {
            alloc.close(item).unwrap();
        }
        alloc.close(&looked_up).unwrap();

        let (status, refcount) = entry.state();
        assert_eq!(status, ResourceStatus::Released);
        assert_eq!(refcount, 0);
    }

    #[test]
    fn close_is_idempotent_on_the_refcount() {
        let alloc = allocator(1);
        let region = alloc
            .create_region("idem", 1 << 20, 0o777, &RegionAttributes::default())
            .unwrap();
        let item = alloc.allocate("it", 1024, 0o600, &region).unwrap();
        alloc.close(&item).unwrap();
        assert_eq!(item.status(), DescStatus::Invalid);
        // A second close must not decrement anything.
        alloc.close(&item).unwrap();
        let entry = alloc
            .crm()
            .find_resource(region.global_id().pure_region_id());
        assert!(entry.is_none() || entry.unwrap().state().0 == ResourceStatus::Released);
    }

    #[test]
    fn descriptor_status_never_regresses() {
        let alloc = allocator(1);
        let region = alloc
            .create_region("mono", 1 << 20, 0o777, &RegionAttributes::default())
            .unwrap();
        let item = alloc.allocate("it", 1024, 0o600, &region).unwrap();
        assert_eq!(item.status(), DescStatus::InitDone);
        // Stat refreshes metadata but must not demote the status.
        alloc.get_stat_info(&item).unwrap();
        assert_eq!(item.status(), DescStatus::InitDone);
        alloc.deallocate(&item).unwrap();
        assert_eq!(item.status(), DescStatus::Invalid);
    }

    #[test]
    fn resize_then_allocate_resolves_through_refreshed_map() {
        let alloc = allocator(2);
        let region = alloc
            .create_region("grow", 64 * 1024, 0o777, &RegionAttributes::default())
            .unwrap();
        // Open once so the CRM caches the single-extent map.
        let warm = alloc.allocate("warm", 8 * 1024, 0o600, &region).unwrap();
        assert_eq!(warm.status(), DescStatus::InitDone);

        // Grow the region; new items may land in the appended extent whose
        // registration the cached map does not cover yet.
        alloc.resize_region(&region, 8 << 20).unwrap();
        for i in 0..16 {
            let item = alloc
                .allocate(&format!("fill_{}", i), 256 * 1024, 0o600, &region)
                .unwrap();
            assert_eq!(item.status(), DescStatus::InitDone, "item fill_{}", i);
        }
    }
}
