//! Client Resource Manager.
//!
//! Tracks per-region registration state for this process. Each referenced
//! region gets one `ResourceEntry` whose status and reference count live in
//! a single packed 64-bit word mutated only by compare-and-swap, so both
//! fields are always observed together. Retired entries are pushed to a
//! lock-free garbage queue instead of being freed: a reader that fetched an
//! entry an instant before it was replaced can still dereference it safely,
//! and the queue drains when the manager is dropped.

use crate::cis::Cis;
use crate::cis::RegionMemoryMap;
use crate::error::{FamError, FamResult};
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const FAM_RESOURCE_DEFAULT: u32 = 0;
/// Register the region's memory on open (region-level permission path).
pub const FAM_REGISTER_MEMORY: u32 = 1 << 0;
/// Initialize the entry without taking a reference (probe/validation path).
pub const FAM_INIT_ONLY: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceStatus {
    Inactive = 0,
    Active = 1,
    Busy = 2,
    Released = 3,
}

const STATUS_SHIFT: u32 = 32;
const REFCOUNT_MASK: u64 = (1u64 << STATUS_SHIFT) - 1;

fn pack(status: ResourceStatus, refcount: u64) -> u64 {
    ((status as u64) << STATUS_SHIFT) | (refcount & REFCOUNT_MASK)
}

fn unpack(word: u64) -> (ResourceStatus, u64) {
    let status = match word >> STATUS_SHIFT {
        0 => ResourceStatus::Inactive,
        1 => ResourceStatus::Active,
        2 => ResourceStatus::Busy,
        _ => ResourceStatus::Released,
    };
    (status, word & REFCOUNT_MASK)
}

/// Per-region client-side state.
#[derive(Debug)]
pub struct ResourceEntry {
    status_refcount: AtomicU64,
    /// Memory servers the region spans.
    pub(crate) memserver_ids: RwLock<Vec<u64>>,
    /// Monotonically growing registration cache; bulk updates take the
    /// write lock.
    pub(crate) memory_map: RwLock<RegionMemoryMap>,
}

impl ResourceEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status_refcount: AtomicU64::new(pack(ResourceStatus::Inactive, 0)),
            memserver_ids: RwLock::new(Vec::new()),
            memory_map: RwLock::new(RegionMemoryMap::new()),
        })
    }

    pub fn state(&self) -> (ResourceStatus, u64) {
        unpack(self.status_refcount.load(Ordering::SeqCst))
    }

    fn load(&self) -> u64 {
        self.status_refcount.load(Ordering::SeqCst)
    }

    fn cas(&self, old: u64, new: u64) -> bool {
        self.status_refcount
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set(&self, status: ResourceStatus, refcount: u64) {
        self.status_refcount
            .store(pack(status, refcount), Ordering::SeqCst);
    }
}

pub struct ClientResourceManager {
    cis: Arc<dyn Cis>,
    table: RwLock<HashMap<u64, Arc<ResourceEntry>>>,
    garbage: SegQueue<Arc<ResourceEntry>>,
}

impl ClientResourceManager {
    pub fn new(cis: Arc<dyn Cis>) -> Self {
        Self {
            cis,
            table: RwLock::new(HashMap::new()),
            garbage: SegQueue::new(),
        }
    }

    /// Fast path: return a live entry under the table read lock. Slow path:
    /// insert a fresh `Inactive` entry, replacing a stale `Released` one
    /// (which is retired to the garbage queue, never freed in place).
    fn find_or_create_resource(&self, region_id: u64) -> Arc<ResourceEntry> {
        {
            let table = self.table.read();
            if let Some(existing) = table.get(&region_id) {
                if existing.state().0 != ResourceStatus::Released {
                    return Arc::clone(existing);
                }
            }
        }

        let fresh = ResourceEntry::new();
        let mut table = self.table.write();
        match table.get(&region_id) {
            None => {
                table.insert(region_id, Arc::clone(&fresh));
                fresh
            }
            Some(existing) => {
                if existing.state().0 == ResourceStatus::Released {
                    self.garbage.push(Arc::clone(existing));
                    table.insert(region_id, Arc::clone(&fresh));
                    fresh
                } else {
                    // A concurrent insert won; discard ours.
                    Arc::clone(existing)
                }
            }
        }
    }

    pub fn find_resource(&self, region_id: u64) -> Option<Arc<ResourceEntry>> {
        self.table.read().get(&region_id).cloned()
    }

    fn open_region_remote(
        &self,
        region_id: u64,
        resource: &ResourceEntry,
        register_memory: bool,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        if register_memory {
            let (memserver_ids, memory_map) =
                self.cis.open_region_with_registration(region_id, uid, gid)?;
            *resource.memserver_ids.write() = memserver_ids;
            *resource.memory_map.write() = memory_map;
        } else {
            let memserver_ids = self.cis.open_region_without_registration(region_id)?;
            *resource.memserver_ids.write() = memserver_ids;
        }
        Ok(())
    }

    /// Drive the open state machine: bump the refcount on `Active`, claim
    /// `Inactive` entries via `Busy` and perform the remote open, retry
    /// through `Busy`, and restart on `Released`.
    pub fn open_resource(
        &self,
        region_id: u64,
        uid: u32,
        gid: u32,
        flags: u32,
    ) -> FamResult<Arc<ResourceEntry>> {
        let mut resource = self.find_or_create_resource(region_id);
        loop {
            let word = resource.load();
            let (status, refcount) = unpack(word);
            match status {
                ResourceStatus::Active => {
                    if resource.cas(word, pack(ResourceStatus::Active, refcount + 1)) {
                        return Ok(resource);
                    }
                }
                ResourceStatus::Inactive => {
                    // Whoever flips Inactive -> Busy owns the remote open.
                    if !resource.cas(word, pack(ResourceStatus::Busy, 0)) {
                        continue;
                    }
                    let register = flags & FAM_REGISTER_MEMORY != 0;
                    match self.open_region_remote(region_id, &resource, register, uid, gid) {
                        Ok(()) => {
                            let refcount = if flags & FAM_INIT_ONLY != 0 { 0 } else { 1 };
                            resource.set(ResourceStatus::Active, refcount);
                            return Ok(resource);
                        }
                        Err(err) => {
                            // Leak-safe: observers of Released re-create.
                            resource.set(ResourceStatus::Released, 0);
                            return Err(err);
                        }
                    }
                }
                ResourceStatus::Busy => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
                ResourceStatus::Released => {
                    resource = self.find_or_create_resource(region_id);
                }
            }
        }
    }

    /// Drop one reference; the reference that reaches zero transitions the
    /// entry through `Busy`, issues the remote close, and retires it.
    pub fn close_resource(&self, region_id: u64) -> FamResult<()> {
        let resource = match self.find_resource(region_id) {
            Some(resource) => resource,
            None => return Ok(()),
        };
        loop {
            let word = resource.load();
            let (status, refcount) = unpack(word);
            match status {
                ResourceStatus::Active => {
                    let remaining = refcount.saturating_sub(1);
                    let new = if remaining == 0 {
                        pack(ResourceStatus::Busy, 0)
                    } else {
                        pack(ResourceStatus::Active, remaining)
                    };
                    if resource.cas(word, new) {
                        if remaining == 0 {
                            return self.retire_resource(region_id, &resource);
                        }
                        return Ok(());
                    }
                }
                ResourceStatus::Busy => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
                _ => return Ok(()),
            }
        }
    }

    fn retire_resource(&self, region_id: u64, resource: &Arc<ResourceEntry>) -> FamResult<()> {
        let memserver_ids = resource.memserver_ids.read().clone();
        let close_result = self.cis.close_region(region_id, &memserver_ids);
        {
            let mut table = self.table.write();
            resource.set(ResourceStatus::Released, 0);
            if let Some(current) = table.get(&region_id) {
                if Arc::ptr_eq(current, resource) {
                    table.remove(&region_id);
                }
            }
        }
        self.garbage.push(Arc::clone(resource));
        close_result
    }

    fn release_resource(&self, resource: &ResourceEntry) -> bool {
        loop {
            let word = resource.load();
            let (status, _) = unpack(word);
            if status != ResourceStatus::Active {
                return false;
            }
            if resource.cas(word, pack(ResourceStatus::Released, 0)) {
                return true;
            }
        }
    }

    /// Shutdown: force-release every `Active` entry and close it remotely.
    pub fn close_all_resources(&self) -> FamResult<()> {
        let mut to_close = Vec::new();
        {
            let mut table = self.table.write();
            // Erasing while iterating would invalidate the iterator; walk a
            // snapshot of the keys instead.
            let region_ids: Vec<u64> = table.keys().copied().collect();
            for region_id in region_ids {
                let resource = match table.get(&region_id) {
                    Some(resource) => Arc::clone(resource),
                    None => continue,
                };
                if self.release_resource(&resource) {
                    table.remove(&region_id);
                    let memserver_ids = resource.memserver_ids.read().clone();
                    self.garbage.push(resource);
                    to_close.push((region_id, memserver_ids));
                }
            }
        }
        let mut first_err: Option<FamError> = None;
        for (region_id, memserver_ids) in to_close {
            if let Err(err) = self.cis.close_region(region_id, &memserver_ids) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn garbage_len(&self) -> usize {
        self.garbage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cis::DirectCis;
    use crate::config::{FamConfig, FamOptions};
    use crate::descriptor::RegionAttributes;

    fn harness() -> (Arc<DirectCis>, ClientResourceManager, u64) {
        let options = FamOptions {
            num_memory_servers: Some(2),
            memory_per_server: Some(16 * 1024 * 1024),
            interleave_size: Some(4096),
            ..Default::default()
        };
        let config = FamConfig::resolve(&options).unwrap();
        let cis = Arc::new(DirectCis::new(&config).unwrap());
        let info = cis
            .create_region("crm", 1 << 20, 0o777, &RegionAttributes::default(), 1, 1)
            .unwrap();
        let crm = ClientResourceManager::new(Arc::clone(&cis) as Arc<dyn Cis>);
        (cis, crm, info.region_id)
    }

    #[test]
    fn word_packing_round_trips() {
        let word = pack(ResourceStatus::Active, 17);
        assert_eq!(unpack(word), (ResourceStatus::Active, 17));
        assert_eq!(
            unpack(pack(ResourceStatus::Released, 0)),
            (ResourceStatus::Released, 0)
        );
    }

    #[test]
    fn open_close_balance_releases_and_closes_once() {
        let (cis, crm, region_id) = harness();

        let r1 = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap();
        let r2 = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(r1.state(), (ResourceStatus::Active, 2));
        // One remote open regardless of local references.
        assert_eq!(cis.region_open_count(region_id), Some(1));

        crm.close_resource(region_id).unwrap();
        assert_eq!(r1.state(), (ResourceStatus::Active, 1));
        crm.close_resource(region_id).unwrap();
        assert_eq!(r1.state(), (ResourceStatus::Released, 0));
        assert_eq!(cis.region_open_count(region_id), Some(0));
        assert!(crm.find_resource(region_id).is_none());
        assert_eq!(crm.garbage_len(), 1);
    }

    #[test]
    fn init_only_takes_no_reference() {
        let (_cis, crm, region_id) = harness();
        let resource = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY | FAM_INIT_ONLY)
            .unwrap();
        assert_eq!(resource.state(), (ResourceStatus::Active, 0));
    }

    #[test]
    fn released_entry_is_replaced_on_reopen() {
        let (_cis, crm, region_id) = harness();
        let first = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap();
        crm.close_resource(region_id).unwrap();
        assert_eq!(first.state().0, ResourceStatus::Released);

        let second = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), (ResourceStatus::Active, 1));
        // The stale entry stays reachable through the garbage queue.
        assert!(crm.garbage_len() >= 1);
    }

    #[test]
    fn failed_open_flips_to_released() {
        let (_cis, crm, _region_id) = harness();
        let missing_region = 0xdead;
        let err = crm
            .open_resource(missing_region, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FamErrorKind::NotFound);
        let entry = crm.find_resource(missing_region).unwrap();
        assert_eq!(entry.state(), (ResourceStatus::Released, 0));
    }

    #[test]
    fn registration_map_is_cached_on_open() {
        let (_cis, crm, region_id) = harness();
        let resource = crm
            .open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
            .unwrap();
        assert_eq!(resource.memserver_ids.read().len(), 2);
        assert_eq!(resource.memory_map.read().len(), 2);
        crm.close_resource(region_id).unwrap();
    }

    #[test]
    fn close_all_force_releases_active_entries() {
        let (cis, crm, region_id) = harness();
        for _ in 0..3 {
            crm.open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
                .unwrap();
        }
        crm.close_all_resources().unwrap();
        assert!(crm.find_resource(region_id).is_none());
        assert_eq!(cis.region_open_count(region_id), Some(0));
    }

    #[test]
    fn concurrent_open_close_storm_settles() {
        let (cis, crm, region_id) = harness();
        let crm = Arc::new(crm);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let crm = Arc::clone(&crm);
                scope.spawn(move || {
                    for _ in 0..200 {
                        crm.open_resource(region_id, 1, 1, FAM_REGISTER_MEMORY)
                            .unwrap();
                        crm.close_resource(region_id).unwrap();
                    }
                });
            }
        });

        // Whatever interleaving happened, the final close balanced the
        // server-side count and left no live reference.
        assert_eq!(cis.region_open_count(region_id), Some(0));
        if let Some(entry) = crm.find_resource(region_id) {
            let (status, refcount) = entry.state();
            assert_eq!(refcount, 0);
            assert_ne!(status, ResourceStatus::Busy);
        }
    }
}
