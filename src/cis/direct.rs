//! In-process CIS backend.
//!
//! Owns the metadata maps and one in-process memory server per configured
//! server: a registered pool that region extents are carved from, plus the
//! per-server data service the async engine fans out to. POSIX-style
//! owner/group/other permission bits are enforced on every operation using
//! the uid/gid carried on the request.

use crate::cis::{
    wrong_wait_object, BackupInfo, Cis, CisCopyRequest, CisWaitObject, ItemInfo, MemServerInfo,
    RegionInfo, RegionMemory, RegionMemoryMap, WaitObjInner,
};
use crate::config::FamConfig;
use crate::descriptor::{
    decode_offset, encode_offset, InterleaveEnable, PermissionLevel, RegionAttributes,
};
use crate::engine::{
    AsyncQHandler, BackupPart, BackupTag, CopyRoute, CopyTag, DeleteBackupTag, OpInfo, OpPayload,
    RestoreTag,
};
use crate::error::{FamError, FamErrorKind, FamResult};
use crate::memory::RegisteredPool;
use crate::memserver::{
    backup_exists, list_backup_names, load_backup_meta, now_epoch_secs, BackupMeta, MemoryService,
    ShmMemoryService, SrcLayout,
};
use crate::transport::{FabricTransport, FAM_KEY_READ, FAM_KEY_UNINITIALIZED, FAM_KEY_WRITE};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Alignment of data items inside an extent; generous enough for every
/// atomic width.
const ITEM_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

fn perm_allows(mode: u32, owner_uid: u32, owner_gid: u32, uid: u32, gid: u32, want: Access) -> bool {
    let class = if uid == owner_uid {
        (mode >> 6) & 0o7
    } else if gid == owner_gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    match want {
        Access::Read => class & 0o4 != 0,
        Access::Write => class & 0o2 != 0,
    }
}

/// Fabric key granting the requester's effective rights on `mode`.
fn key_for(mode: u32, owner_uid: u32, owner_gid: u32, uid: u32, gid: u32) -> u64 {
    let mut key = 0;
    if perm_allows(mode, owner_uid, owner_gid, uid, gid, Access::Read) {
        key |= FAM_KEY_READ;
    }
    if perm_allows(mode, owner_uid, owner_gid, uid, gid, Access::Write) {
        key |= FAM_KEY_WRITE;
    }
    key
}

/// Exact per-server byte counts of an item interleaved round-robin in
/// `interleave`-sized chunks across `cnt` servers.
fn per_server_sizes(nbytes: u64, interleave: u64, cnt: u64) -> Vec<u64> {
    if cnt <= 1 {
        return vec![nbytes];
    }
    let mut sizes = vec![0u64; cnt as usize];
    let mut chunk = 0u64;
    while chunk * interleave < nbytes {
        let start = chunk * interleave;
        sizes[(chunk % cnt) as usize] += interleave.min(nbytes - start);
        chunk += 1;
    }
    sizes
}

struct Extent {
    pool_offset: u64,
    size: u64,
    base_addr: u64,
    allocator: Mutex<crate::memory::RangeAllocator>,
}

struct ItemMeta {
    name: String,
    size: u64,
    perm: AtomicU32,
    uid: u32,
    gid: u32,
    used_cnt: u64,
    memserver_ids: Vec<u64>,
    offsets: Vec<u64>,
    interleave_size: u64,
}

struct RegionMeta {
    region_id: u64,
    name: String,
    size: AtomicU64,
    perm: AtomicU32,
    uid: u32,
    gid: u32,
    attrs: RegionAttributes,
    interleave_size: u64,
    memserver_ids: Vec<u64>,
    extents: RwLock<HashMap<u64, Vec<Extent>>>,
    items: DashMap<(u64, u64), Arc<ItemMeta>>,
    item_names: DashMap<String, (u64, u64)>,
    open_count: AtomicU64,
    destroyed: AtomicBool,
}

struct ShmMemoryServer {
    id: u64,
    pool: RegisteredPool,
}

struct CasLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl CasLock {
    fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = self.locked.lock();
        while *held {
            self.cv.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        *self.locked.lock() = false;
        self.cv.notify_one();
    }
}

pub struct DirectCis {
    servers: Vec<Arc<ShmMemoryServer>>,
    services: HashMap<u64, Arc<dyn MemoryService>>,
    regions: DashMap<u64, Arc<RegionMeta>>,
    region_names: DashMap<String, u64>,
    next_region_id: AtomicU64,
    next_first_server: AtomicU64,
    engine: AsyncQHandler,
    cas_locks: DashMap<(u64, u64), Arc<CasLock>>,
    backup_dir: PathBuf,
    interleave_size: u64,
}

impl DirectCis {
    pub fn new(config: &FamConfig) -> FamResult<Self> {
        let mut servers = Vec::with_capacity(config.num_memory_servers as usize);
        let mut services: HashMap<u64, Arc<dyn MemoryService>> = HashMap::new();
        for id in 0..config.num_memory_servers {
            let pool = RegisteredPool::new(config.memory_per_server)?;
            let service = Arc::new(ShmMemoryService::new(id, config.backup_path.clone()));
            services.insert(id, service as Arc<dyn MemoryService>);
            servers.push(Arc::new(ShmMemoryServer { id, pool }));
        }
        let transport = Arc::new(FabricTransport::new(config)?);
        let engine = AsyncQHandler::new(1, transport)?;
        tracing::info!(
            servers = servers.len(),
            pool_bytes = config.memory_per_server,
            "direct CIS backend up"
        );
        Ok(Self {
            servers,
            services,
            regions: DashMap::new(),
            region_names: DashMap::new(),
            next_region_id: AtomicU64::new(1),
            next_first_server: AtomicU64::new(0),
            engine,
            cas_locks: DashMap::new(),
            backup_dir: config.backup_path.clone(),
            interleave_size: config.interleave_size,
        })
    }

    fn server(&self, id: u64) -> FamResult<&Arc<ShmMemoryServer>> {
        self.servers.get(id as usize).ok_or_else(|| {
            FamError::new(FamErrorKind::RpcClientNotFound, "no such memory server")
        })
    }

    fn region(&self, region_id: u64) -> FamResult<Arc<RegionMeta>> {
        self.regions
            .get(&region_id)
            .map(|r| r.clone())
            .filter(|r| !r.destroyed.load(Ordering::SeqCst))
            .ok_or_else(|| FamError::not_found("region not found"))
    }

    fn item(&self, region: &RegionMeta, memserver_id: u64, offset: u64) -> FamResult<Arc<ItemMeta>> {
        region
            .items
            .get(&(memserver_id, offset))
            .map(|i| i.clone())
            .ok_or_else(|| FamError::not_found("data item not found"))
    }

    fn services_for(&self, ids: &[u64]) -> FamResult<HashMap<u64, Arc<dyn MemoryService>>> {
        let mut map = HashMap::with_capacity(ids.len());
        for &id in ids {
            let service = self.services.get(&id).cloned().ok_or_else(|| {
                FamError::new(FamErrorKind::RpcClientNotFound, "no such memory server")
            })?;
            map.insert(id, service);
        }
        Ok(map)
    }

    fn item_base_addrs(&self, region: &RegionMeta, item: &ItemMeta) -> FamResult<Vec<u64>> {
        let extents = region.extents.read();
        let mut addrs = Vec::with_capacity(item.used_cnt as usize);
        for i in 0..item.used_cnt as usize {
            let server_id = item.memserver_ids[i];
            let (extent_idx, start) = decode_offset(item.offsets[i]);
            let server_extents = extents
                .get(&server_id)
                .ok_or_else(|| FamError::resource("region has no extents on server"))?;
            let extent = server_extents
                .get(extent_idx)
                .ok_or_else(|| FamError::resource("extent index out of range"))?;
            addrs.push(extent.base_addr + start);
        }
        Ok(addrs)
    }

    fn region_memory_map(&self, region: &RegionMeta, uid: u32, gid: u32) -> RegionMemoryMap {
        let mode = region.perm.load(Ordering::SeqCst);
        let key = key_for(mode, region.uid, region.gid, uid, gid);
        let extents = region.extents.read();
        let mut map = RegionMemoryMap::new();
        for (&server_id, server_extents) in extents.iter() {
            map.insert(
                server_id,
                RegionMemory {
                    keys: vec![key; server_extents.len()],
                    base: server_extents.iter().map(|e| e.base_addr).collect(),
                },
            );
        }
        map
    }

    fn check_region_access(
        &self,
        region: &RegionMeta,
        uid: u32,
        gid: u32,
        want: Access,
    ) -> FamResult<()> {
        let mode = region.perm.load(Ordering::SeqCst);
        if !perm_allows(mode, region.uid, region.gid, uid, gid, want) {
            return Err(FamError::no_perm("insufficient permission on region"));
        }
        Ok(())
    }

    fn check_item_access(&self, item: &ItemMeta, uid: u32, gid: u32, want: Access) -> FamResult<()> {
        let mode = item.perm.load(Ordering::SeqCst);
        if !perm_allows(mode, item.uid, item.gid, uid, gid, want) {
            return Err(FamError::no_perm("insufficient permission on data item"));
        }
        Ok(())
    }

    fn free_region(&self, region: &RegionMeta) {
        if self.regions.remove(&region.region_id).is_none() {
            return;
        }
        let extents = region.extents.read();
        for (&server_id, server_extents) in extents.iter() {
            if let Ok(server) = self.server(server_id) {
                for extent in server_extents {
                    server.pool.deallocate(extent.pool_offset, extent.size);
                }
            }
        }
        tracing::debug!(region = region.region_id, "region storage released");
    }

    fn item_info(
        &self,
        region: &RegionMeta,
        item: &ItemMeta,
        uid: u32,
        gid: u32,
        with_keys: bool,
    ) -> FamResult<ItemInfo> {
        let permission_level = region.attrs.permission_level;
        let cnt = item.used_cnt as usize;
        let (keys, bases, registered) =
            if with_keys && permission_level == PermissionLevel::DataItem {
                let mode = item.perm.load(Ordering::SeqCst);
                let key = key_for(mode, item.uid, item.gid, uid, gid);
                (
                    vec![key; cnt],
                    self.item_base_addrs(region, item)?,
                    true,
                )
            } else {
                (vec![FAM_KEY_UNINITIALIZED; cnt], vec![0; cnt], false)
            };
        Ok(ItemInfo {
            region_id: region.region_id,
            offset: item.offsets[0],
            name: item.name.clone(),
            size: item.size,
            perm: item.perm.load(Ordering::SeqCst),
            uid: item.uid,
            gid: item.gid,
            used_memsrv_cnt: item.used_cnt,
            memserver_ids: item.memserver_ids.clone(),
            dataitem_offsets: item.offsets.clone(),
            interleave_size: item.interleave_size,
            permission_level,
            item_registration_status: registered,
            dataitem_keys: keys,
            base_addr_list: bases,
        })
    }

    fn region_info(&self, region: &RegionMeta) -> RegionInfo {
        RegionInfo {
            region_id: region.region_id,
            offset: 0,
            name: region.name.clone(),
            size: region.size.load(Ordering::SeqCst),
            perm: region.perm.load(Ordering::SeqCst),
            uid: region.uid,
            gid: region.gid,
            attrs: region.attrs,
            interleave_size: region.interleave_size,
            used_memsrv_cnt: region.memserver_ids.len() as u64,
            memserver_ids: region.memserver_ids.clone(),
        }
    }

    fn item_shares(&self, item: &ItemMeta) -> Vec<u64> {
        per_server_sizes(
            item.size,
            if item.interleave_size == 0 {
                item.size.max(1)
            } else {
                item.interleave_size
            },
            item.used_cnt,
        )
    }
}

#[cfg(test)]
impl DirectCis {
    pub(crate) fn region_open_count(&self, region_id: u64) -> Option<u64> {
        self.regions
            .get(&region_id)
            .map(|r| r.open_count.load(Ordering::SeqCst))
    }
}

fn roll_back_carves(extents: &HashMap<u64, Vec<Extent>>, carved: &[(u64, usize, u64, u64)]) {
    for &(server_id, extent_idx, start, share) in carved {
        if let Some(extent) = extents.get(&server_id).and_then(|e| e.get(extent_idx)) {
            extent.allocator.lock().deallocate(start, share);
        }
    }
}

fn validate_backup_name(name: &str) -> FamResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(FamError::invalid("invalid backup name"))
    }
}

impl Cis for DirectCis {
    fn get_num_memory_servers(&self) -> FamResult<u64> {
        Ok(self.servers.len() as u64)
    }

    fn create_region(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        attrs: &RegionAttributes,
        uid: u32,
        gid: u32,
    ) -> FamResult<RegionInfo> {
        if name.is_empty() || nbytes == 0 {
            return Err(FamError::invalid("invalid region name or size"));
        }
        let region_id = self.next_region_id.fetch_add(1, Ordering::SeqCst);
        match self.region_names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(FamError::new(
                    FamErrorKind::AlreadyExist,
                    "region name already exists",
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(region_id);
            }
        }

        let memserver_ids: Vec<u64> = if attrs.interleave_enable == InterleaveEnable::Disable {
            let start = self.next_first_server.fetch_add(1, Ordering::SeqCst);
            vec![start % self.servers.len() as u64]
        } else {
            (0..self.servers.len() as u64).collect()
        };
        let cnt = memserver_ids.len() as u64;
        let per_server = nbytes.div_ceil(cnt).next_multiple_of(self.interleave_size);

        let mut extents = HashMap::new();
        let mut allocated: Vec<(u64, u64)> = Vec::new();
        for &server_id in &memserver_ids {
            let server = self.server(server_id)?;
            let pool_offset = match server.pool.allocate(per_server) {
                Ok(offset) => offset,
                Err(err) => {
                    for &(sid, off) in &allocated {
                        self.server(sid)?.pool.deallocate(off, per_server);
                    }
                    self.region_names.remove(name);
                    return Err(err);
                }
            };
            allocated.push((server_id, pool_offset));
            tracing::debug!(
                server = server_id,
                extent_bytes = per_server,
                pool_used = server.pool.used(),
                pool_size = server.pool.size(),
                "extent carved"
            );
            extents.insert(
                server_id,
                vec![Extent {
                    pool_offset,
                    size: per_server,
                    base_addr: server.pool.addr_at(pool_offset),
                    allocator: Mutex::new(crate::memory::RangeAllocator::new(
                        per_server,
                        ITEM_ALIGNMENT,
                    )),
                }],
            );
        }

        let region = Arc::new(RegionMeta {
            region_id,
            name: name.to_string(),
            size: AtomicU64::new(nbytes),
            perm: AtomicU32::new(perm),
            uid,
            gid,
            attrs: *attrs,
            interleave_size: self.interleave_size,
            memserver_ids,
            extents: RwLock::new(extents),
            items: DashMap::new(),
            item_names: DashMap::new(),
            open_count: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });
        let info = self.region_info(&region);
        self.regions.insert(region_id, region);
        tracing::info!(region = region_id, name, size = nbytes, "region created");
        Ok(info)
    }

    fn destroy_region(
        &self,
        region_id: u64,
        _memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Write)?;
        if region.destroyed.swap(true, Ordering::SeqCst) {
            return Err(FamError::not_found("region not found"));
        }
        self.region_names.remove(&region.name);
        // Delayed free: concurrent holders drain through close_region.
        if region.open_count.load(Ordering::SeqCst) == 0 {
            self.free_region(&region);
        }
        tracing::info!(region = region_id, "region destroyed");
        Ok(())
    }

    fn resize_region(
        &self,
        region_id: u64,
        nbytes: u64,
        _memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Write)?;
        let current = region.size.load(Ordering::SeqCst);
        if nbytes > current {
            let cnt = region.memserver_ids.len() as u64;
            let per_server = (nbytes - current)
                .div_ceil(cnt)
                .next_multiple_of(self.interleave_size);
            let mut extents = region.extents.write();
            for &server_id in &region.memserver_ids {
                let server = self.server(server_id)?;
                let pool_offset = server.pool.allocate(per_server)?;
                extents.entry(server_id).or_default().push(Extent {
                    pool_offset,
                    size: per_server,
                    base_addr: server.pool.addr_at(pool_offset),
                    allocator: Mutex::new(crate::memory::RangeAllocator::new(
                        per_server,
                        ITEM_ALIGNMENT,
                    )),
                });
            }
        }
        region.size.store(nbytes, Ordering::SeqCst);
        Ok(())
    }

    fn allocate(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        region_id: u64,
        _memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        if name.is_empty() || nbytes == 0 {
            return Err(FamError::invalid("invalid data item name or size"));
        }
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Write)?;

        let interleaved = region.attrs.interleave_enable == InterleaveEnable::Enable
            && nbytes > region.interleave_size
            && region.memserver_ids.len() > 1;
        let memserver_ids: Vec<u64> = if interleaved {
            // No point spanning more servers than the item has chunks.
            let chunks = nbytes.div_ceil(region.interleave_size) as usize;
            region.memserver_ids[..region.memserver_ids.len().min(chunks)].to_vec()
        } else {
            let start = self.next_first_server.fetch_add(1, Ordering::SeqCst) as usize;
            vec![region.memserver_ids[start % region.memserver_ids.len()]]
        };
        let cnt = memserver_ids.len() as u64;
        let interleave_size = if cnt > 1 { region.interleave_size } else { 0 };
        let shares = per_server_sizes(
            nbytes,
            if cnt > 1 { region.interleave_size } else { nbytes },
            cnt,
        );

        // Carve each server's share out of one of the region's extents on
        // that server; roll everything back if any server is out of space.
        let extents = region.extents.read();
        let mut offsets = Vec::with_capacity(cnt as usize);
        let mut carved: Vec<(u64, usize, u64, u64)> = Vec::new();
        for (i, &server_id) in memserver_ids.iter().enumerate() {
            let share = shares[i].max(1);
            let server_extents = extents
                .get(&server_id)
                .ok_or_else(|| FamError::resource("region has no extents on server"))?;
            let mut placed = None;
            for (extent_idx, extent) in server_extents.iter().enumerate() {
                if let Some(start) = extent.allocator.lock().allocate(share) {
                    placed = Some((extent_idx, start));
                    break;
                }
            }
            match placed {
                Some((extent_idx, start)) => {
                    offsets.push(encode_offset(extent_idx, start));
                    carved.push((server_id, extent_idx, start, share));
                }
                None => {
                    roll_back_carves(&extents, &carved);
                    return Err(FamError::new(
                        FamErrorKind::Allocator,
                        "region out of space",
                    ));
                }
            }
        }
        drop(extents);

        let item = Arc::new(ItemMeta {
            name: name.to_string(),
            size: nbytes,
            perm: AtomicU32::new(perm),
            uid,
            gid,
            used_cnt: cnt,
            memserver_ids: memserver_ids.clone(),
            offsets: offsets.clone(),
            interleave_size,
        });
        let item_key = (memserver_ids[0], offsets[0]);
        match region.item_names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                roll_back_carves(&region.extents.read(), &carved);
                return Err(FamError::new(
                    FamErrorKind::AlreadyExist,
                    "data item name already exists in region",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(item_key);
            }
        }
        region.items.insert(item_key, item.clone());
        tracing::debug!(region = region_id, item = name, size = nbytes, "item allocated");
        self.item_info(&region, &item, uid, gid, true)
    }

    fn deallocate(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        self.check_item_access(&item, uid, gid, Access::Write)?;

        region.items.remove(&(memserver_id, offset));
        region.item_names.remove(&item.name);
        let shares = self.item_shares(&item);
        let extents = region.extents.read();
        for i in 0..item.used_cnt as usize {
            let (extent_idx, start) = decode_offset(item.offsets[i]);
            if let Some(server_extents) = extents.get(&item.memserver_ids[i]) {
                if let Some(extent) = server_extents.get(extent_idx) {
                    extent.allocator.lock().deallocate(start, shares[i].max(1));
                }
            }
        }
        Ok(())
    }

    fn change_region_permission(
        &self,
        region_id: u64,
        perm: u32,
        _memserver_id: u64,
        uid: u32,
        _gid: u32,
    ) -> FamResult<()> {
        let region = self.region(region_id)?;
        if uid != region.uid {
            return Err(FamError::no_perm("only the owner may change permissions"));
        }
        region.perm.store(perm, Ordering::SeqCst);
        Ok(())
    }

    fn change_dataitem_permission(
        &self,
        region_id: u64,
        offset: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        _gid: u32,
    ) -> FamResult<()> {
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        if uid != item.uid {
            return Err(FamError::no_perm("only the owner may change permissions"));
        }
        item.perm.store(perm, Ordering::SeqCst);
        Ok(())
    }

    fn lookup_region(&self, name: &str, uid: u32, gid: u32) -> FamResult<RegionInfo> {
        let region_id = self
            .region_names
            .get(name)
            .map(|r| *r)
            .ok_or_else(|| FamError::not_found("region not found"))?;
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Read)?;
        Ok(self.region_info(&region))
    }

    fn lookup(
        &self,
        item_name: &str,
        region_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        let region_id = self
            .region_names
            .get(region_name)
            .map(|r| *r)
            .ok_or_else(|| FamError::not_found("region not found"))?;
        let region = self.region(region_id)?;
        let key = region
            .item_names
            .get(item_name)
            .map(|k| *k)
            .ok_or_else(|| FamError::not_found("data item not found"))?;
        let item = self.item(&region, key.0, key.1)?;
        self.check_item_access(&item, uid, gid, Access::Read)?;
        // Keys are resolved lazily on first data-path use.
        self.item_info(&region, &item, uid, gid, false)
    }

    fn check_permission_get_region_info(
        &self,
        region_id: u64,
        _memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<RegionInfo> {
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Read)?;
        Ok(self.region_info(&region))
    }

    fn check_permission_get_item_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        self.check_item_access(&item, uid, gid, Access::Read)?;
        self.item_info(&region, &item, uid, gid, true)
    }

    fn get_stat_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        self.check_item_access(&item, uid, gid, Access::Read)?;
        self.item_info(&region, &item, uid, gid, false)
    }

    fn open_region_with_registration(
        &self,
        region_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<(Vec<u64>, RegionMemoryMap)> {
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Read)?;
        region.open_count.fetch_add(1, Ordering::SeqCst);
        Ok((
            region.memserver_ids.clone(),
            self.region_memory_map(&region, uid, gid),
        ))
    }

    fn open_region_without_registration(&self, region_id: u64) -> FamResult<Vec<u64>> {
        let region = self.region(region_id)?;
        region.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(region.memserver_ids.clone())
    }

    fn close_region(&self, region_id: u64, _memserver_ids: &[u64]) -> FamResult<()> {
        let region = match self.regions.get(&region_id) {
            Some(region) => region.clone(),
            None => return Ok(()),
        };
        let _ = region
            .open_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if region.destroyed.load(Ordering::SeqCst) && region.open_count.load(Ordering::SeqCst) == 0
        {
            self.free_region(&region);
        }
        Ok(())
    }

    fn get_region_memory(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<RegionMemoryMap> {
        let region = self.region(region_id)?;
        self.check_region_access(&region, uid, gid, Access::Read)?;
        Ok(self.region_memory_map(&region, uid, gid))
    }

    fn copy(&self, req: &CisCopyRequest) -> FamResult<CisWaitObject> {
        if req.src_keys.len() != req.src_used_memsrv_cnt as usize
            || req.src_base_addr_list.len() != req.src_used_memsrv_cnt as usize
        {
            return Err(FamError::invalid("malformed copy request"));
        }
        let src_region = self.region(req.src_region_id)?;
        let src_item = self.item(&src_region, req.src_memserver_id, req.src_offset)?;
        let dst_region = self.region(req.dst_region_id)?;
        let dst_item = self.item(&dst_region, req.dst_memserver_id, req.dst_offset)?;
        self.check_item_access(&src_item, req.uid, req.gid, Access::Read)?;
        self.check_item_access(&dst_item, req.uid, req.gid, Access::Write)?;
        if req.dst_copy_start + req.nbytes > dst_item.size {
            return Err(FamError::out_of_range(
                "copy range is beyond destination data item",
            ));
        }

        let dst_addrs = self.item_base_addrs(&dst_region, &dst_item)?;
        let route = if src_item.used_cnt == 1 && dst_item.used_cnt == 1 {
            CopyRoute::Local {
                src_addr: req.src_base_addr_list[0] + req.src_copy_start,
                dst_addr: dst_addrs[0] + req.dst_copy_start,
            }
        } else {
            CopyRoute::FanOut {
                src: SrcLayout {
                    bases: req.src_base_addr_list.clone(),
                    keys: req.src_keys.clone(),
                    used_cnt: req.src_used_memsrv_cnt,
                    interleave: src_item.interleave_size,
                },
                src_copy_start: req.src_copy_start,
                dst_copy_start: req.dst_copy_start,
                dst_addrs,
                dst_server_ids: dst_item.memserver_ids.clone(),
                dst_interleave: dst_item.interleave_size,
                services: self.services_for(&dst_item.memserver_ids)?,
            }
        };
        let tag = CopyTag::new(req.nbytes, route);
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::Copy(Arc::clone(&tag)),
            nbytes: req.nbytes,
            offset: req.src_copy_start,
            upper_bound: req.src_copy_start + req.nbytes,
            key: 0,
            item_size: src_item.size,
        });
        Ok(CisWaitObject::new(WaitObjInner::Copy(tag)))
    }

    fn wait_for_copy(&self, wait: CisWaitObject) -> FamResult<()> {
        match wait.inner {
            WaitObjInner::Copy(tag) => self.engine.wait_for_copy(tag),
            _ => Err(wrong_wait_object()),
        }
    }

    fn backup(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject> {
        validate_backup_name(backup_name)?;
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        self.check_item_access(&item, uid, gid, Access::Read)?;
        if backup_exists(&self.backup_dir, backup_name) {
            return Err(FamError::new(
                FamErrorKind::AlreadyExist,
                "backup already exists",
            ));
        }

        let bases = self.item_base_addrs(&region, &item)?;
        let shares = self.item_shares(&item);
        let parts = item
            .memserver_ids
            .iter()
            .zip(bases.iter().zip(shares.iter()))
            .map(|(&server_id, (&src_addr, &size))| BackupPart {
                server_id,
                src_addr,
                size,
            })
            .collect();
        let tag = Arc::new(BackupTag {
            done: AtomicBool::new(false),
            err: Mutex::new(None),
            backup_name: backup_name.to_string(),
            parts,
            meta: BackupMeta {
                backup_name: backup_name.to_string(),
                item_name: item.name.clone(),
                item_size: item.size,
                used_cnt: item.used_cnt,
                interleave_size: item.interleave_size,
                perm: item.perm.load(Ordering::SeqCst),
                uid: item.uid,
                gid: item.gid,
                created_epoch_secs: now_epoch_secs(),
            },
            services: self.services_for(&item.memserver_ids)?,
        });
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::Backup(Arc::clone(&tag)),
            nbytes: item.size,
            offset: 0,
            upper_bound: item.size,
            key: 0,
            item_size: item.size,
        });
        Ok(CisWaitObject::new(WaitObjInner::Backup(tag)))
    }

    fn wait_for_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        match wait.inner {
            WaitObjInner::Backup(tag) => self.engine.wait_for_backup(tag),
            _ => Err(wrong_wait_object()),
        }
    }

    fn restore(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject> {
        validate_backup_name(backup_name)?;
        let meta = load_backup_meta(&self.backup_dir, backup_name)?;
        let region = self.region(region_id)?;
        let item = self.item(&region, memserver_id, offset)?;
        self.check_item_access(&item, uid, gid, Access::Write)?;
        if meta.item_size > item.size {
            return Err(FamError::out_of_range(
                "backup is larger than the destination data item",
            ));
        }

        let tag = Arc::new(RestoreTag {
            done: AtomicBool::new(false),
            err: Mutex::new(None),
            backup_name: backup_name.to_string(),
            nbytes: meta.item_size,
            dst_server_ids: item.memserver_ids.clone(),
            dst_addrs: self.item_base_addrs(&region, &item)?,
            dst_interleave: item.interleave_size,
            services: self.services_for(&item.memserver_ids)?,
        });
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::Restore(Arc::clone(&tag)),
            nbytes: meta.item_size,
            offset: 0,
            upper_bound: meta.item_size,
            key: 0,
            item_size: item.size,
        });
        Ok(CisWaitObject::new(WaitObjInner::Restore(tag)))
    }

    fn wait_for_restore(&self, wait: CisWaitObject) -> FamResult<()> {
        match wait.inner {
            WaitObjInner::Restore(tag) => self.engine.wait_for_restore(tag),
            _ => Err(wrong_wait_object()),
        }
    }

    fn delete_backup(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        _gid: u32,
    ) -> FamResult<CisWaitObject> {
        validate_backup_name(backup_name)?;
        let meta = load_backup_meta(&self.backup_dir, backup_name)?;
        if uid != meta.uid {
            return Err(FamError::no_perm("only the owner may delete a backup"));
        }
        let service = self
            .services
            .get(&(memserver_id % self.servers.len() as u64))
            .cloned()
            .ok_or_else(|| {
                FamError::new(FamErrorKind::RpcClientNotFound, "no such memory server")
            })?;
        let tag = Arc::new(DeleteBackupTag {
            done: AtomicBool::new(false),
            err: Mutex::new(None),
            backup_name: backup_name.to_string(),
            service,
        });
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::DeleteBackup(Arc::clone(&tag)),
            nbytes: 0,
            offset: 0,
            upper_bound: 0,
            key: 0,
            item_size: 0,
        });
        Ok(CisWaitObject::new(WaitObjInner::DeleteBackup(tag)))
    }

    fn wait_for_delete_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        match wait.inner {
            WaitObjInner::DeleteBackup(tag) => self.engine.wait_for_delete_backup(tag),
            _ => Err(wrong_wait_object()),
        }
    }

    fn list_backup(
        &self,
        backup_name: &str,
        _memserver_id: u64,
        _uid: u32,
        _gid: u32,
    ) -> FamResult<String> {
        if backup_name.is_empty() || backup_name == "*" {
            return Ok(list_backup_names(&self.backup_dir)?.join("\n"));
        }
        let meta = load_backup_meta(&self.backup_dir, backup_name)?;
        serde_json::to_string_pretty(&meta)
            .map_err(|e| FamError::resource(format!("failed to render backup info: {}", e)))
    }

    fn get_backup_info(
        &self,
        backup_name: &str,
        _memserver_id: u64,
        _uid: u32,
        _gid: u32,
    ) -> FamResult<BackupInfo> {
        let meta = load_backup_meta(&self.backup_dir, backup_name)?;
        Ok(BackupInfo {
            name: meta.backup_name,
            size: meta.item_size,
            uid: meta.uid,
            gid: meta.gid,
            mode: meta.perm,
            item_name: meta.item_name,
            created_epoch_secs: meta.created_epoch_secs,
        })
    }

    fn acquire_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        let lock = self
            .cas_locks
            .entry((memserver_id, offset))
            .or_insert_with(|| Arc::new(CasLock::new()))
            .clone();
        lock.acquire();
        Ok(())
    }

    fn release_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        if let Some(lock) = self.cas_locks.get(&(memserver_id, offset)) {
            lock.release();
        }
        Ok(())
    }

    fn get_addr_size(&self, memserver_id: u64) -> FamResult<u64> {
        Ok(self.get_addr(memserver_id)?.len() as u64)
    }

    fn get_addr(&self, memserver_id: u64) -> FamResult<Vec<u8>> {
        let server = self.server(memserver_id)?;
        Ok(format!("shm://memserver/{}", server.id).into_bytes())
    }

    fn get_memserverinfo_size(&self) -> FamResult<u64> {
        bincode::serialized_size(&self.get_memserverinfo()?)
            .map_err(|e| FamError::resource(format!("failed to size memserver info: {}", e)))
    }

    fn get_memserverinfo(&self) -> FamResult<Vec<MemServerInfo>> {
        self.servers
            .iter()
            .map(|s| {
                Ok(MemServerInfo {
                    id: s.id,
                    addr: self.get_addr(s.id)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FamOptions;

    fn test_cis(servers: u64) -> DirectCis {
        let options = FamOptions {
            num_memory_servers: Some(servers),
            memory_per_server: Some(16 * 1024 * 1024),
            interleave_size: Some(4096),
            backup_path: Some(std::env::temp_dir().join(format!(
                "fam_direct_test_{}_{}",
                std::process::id(),
                servers
            ))),
            ..Default::default()
        };
        let config = FamConfig::resolve(&options).unwrap();
        DirectCis::new(&config).unwrap()
    }

    #[test]
    fn per_server_sizes_split_exactly() {
        assert_eq!(per_server_sizes(100, 4096, 1), vec![100]);
        // 10 chunks of 4096 + one 4-byte tail across 3 servers.
        let sizes = per_server_sizes(10 * 4096 + 4, 4096, 3);
        assert_eq!(sizes.iter().sum::<u64>(), 10 * 4096 + 4);
        assert_eq!(sizes.len(), 3);
        // Chunks 0,3,6,9 land on server 0; chunk 10 (4 bytes) on server 1.
        assert_eq!(sizes[0], 4 * 4096);
        assert_eq!(sizes[1], 3 * 4096 + 4);
        assert_eq!(sizes[2], 3 * 4096);
    }

    #[test]
    fn permission_classes_follow_posix_bits() {
        // rw- r-- ---
        let mode = 0o640;
        assert!(perm_allows(mode, 1, 1, 1, 9, Access::Write));
        assert!(perm_allows(mode, 1, 1, 2, 1, Access::Read));
        assert!(!perm_allows(mode, 1, 1, 2, 1, Access::Write));
        assert!(!perm_allows(mode, 1, 1, 2, 9, Access::Read));
    }

    #[test]
    fn region_lifecycle_and_name_index() {
        let cis = test_cis(1);
        let info = cis
            .create_region("scratch", 1 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap();
        assert_eq!(cis.lookup_region("scratch", 1, 1).unwrap().region_id, info.region_id);

        let err = cis
            .create_region("scratch", 1 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::AlreadyExist);

        cis.destroy_region(info.region_id, 0, 1, 1).unwrap();
        let err = cis.lookup_region("scratch", 1, 1).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::NotFound);
    }

    #[test]
    fn allocate_interleaves_across_servers() {
        let cis = test_cis(3);
        let region = cis
            .create_region("spread", 8 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap();
        let item = cis
            .allocate("big", 64 * 1024, 0o600, region.region_id, 0, 1, 1)
            .unwrap();
        assert_eq!(item.used_memsrv_cnt, 3);
        assert_eq!(item.interleave_size, 4096);
        assert_eq!(item.dataitem_offsets.len(), 3);
        assert_eq!(item.base_addr_list.len(), 3);

        let small = cis
            .allocate("small", 128, 0o600, region.region_id, 0, 1, 1)
            .unwrap();
        assert_eq!(small.used_memsrv_cnt, 1);
    }

    #[test]
    fn foreign_uid_is_rejected_by_region_perm() {
        let cis = test_cis(1);
        let region = cis
            .create_region("private", 1 << 20, 0o700, &RegionAttributes::default(), 1, 1)
            .unwrap();
        let err = cis
            .allocate("it", 1024, 0o600, region.region_id, 0, 2, 2)
            .unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::NoPerm);
        let err = cis.lookup_region("private", 2, 2).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::NoPerm);
    }

    #[test]
    fn resize_appends_extents_to_the_memory_map() {
        let cis = test_cis(2);
        let region = cis
            .create_region("grow", 1 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap();
        let before = cis.get_region_memory(region.region_id, 1, 1).unwrap();
        assert!(before.values().all(|m| m.keys.len() == 1));

        cis.resize_region(region.region_id, 4 << 20, 0, 1, 1).unwrap();
        let after = cis.get_region_memory(region.region_id, 1, 1).unwrap();
        assert!(after.values().all(|m| m.keys.len() == 2));
    }

    #[test]
    fn destroyed_region_with_open_holders_drains_on_close() {
        let cis = test_cis(1);
        let region = cis
            .create_region("drain", 1 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap();
        let (ids, _map) = cis
            .open_region_with_registration(region.region_id, 1, 1)
            .unwrap();
        cis.destroy_region(region.region_id, 0, 1, 1).unwrap();
        // Still present internally until the holder closes.
        assert!(cis.regions.contains_key(&region.region_id));
        cis.close_region(region.region_id, &ids).unwrap();
        assert!(!cis.regions.contains_key(&region.region_id));
    }

    #[test]
    fn cas_lock_blocks_second_acquirer() {
        let cis = Arc::new(test_cis(1));
        cis.acquire_cas_lock(64, 0).unwrap();

        let other = Arc::clone(&cis);
        let handle = std::thread::spawn(move || {
            other.acquire_cas_lock(64, 0).unwrap();
            other.release_cas_lock(64, 0).unwrap();
        });
        // Give the second thread a chance to block, then release.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        cis.release_cas_lock(64, 0).unwrap();
        handle.join().unwrap();
    }
}
