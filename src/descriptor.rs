//! Descriptors for regions and data items.
//!
//! Descriptors are caller-held value objects: they identify a region or a
//! data item by its global id and cache placement metadata (size,
//! permissions, the list of memory servers, per-extent fabric keys and base
//! addresses). They own no remote resources; lifetime of the underlying
//! region state is tracked by the client resource manager.

use crate::error::{FamError, FamResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Memory-server id is packed into the high bits of a data item's region id;
/// the pure region id is recovered with `REGION_ID_MASK` at the CIS boundary.
pub const MEMSERVER_ID_SHIFT: u32 = 34;
pub const REGION_ID_MASK: u64 = (1u64 << MEMSERVER_ID_SHIFT) - 1;

/// Data-item offsets encode `(extent_index, start_in_extent)`.
pub const EXTENT_IDX_SHIFT: u32 = 48;
pub const EXTENT_START_MASK: u64 = (1u64 << EXTENT_IDX_SHIFT) - 1;

/// Small-vector type for the per-extent arrays; most items touch at most a
/// handful of memory servers.
pub type ExtentVec = SmallVec<[u64; 4]>;

#[inline]
pub fn encode_offset(extent_idx: usize, start: u64) -> u64 {
    ((extent_idx as u64) << EXTENT_IDX_SHIFT) | (start & EXTENT_START_MASK)
}

#[inline]
pub fn decode_offset(offset: u64) -> (usize, u64) {
    (
        (offset >> EXTENT_IDX_SHIFT) as usize,
        offset & EXTENT_START_MASK,
    )
}

/// Global identifier of a region or data item.
///
/// For data items the `region_id` field also carries the id of the memory
/// server hosting extent 0 in its high bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalDescriptor {
    pub region_id: u64,
    pub offset: u64,
}

impl GlobalDescriptor {
    pub fn new(region_id: u64, offset: u64) -> Self {
        Self { region_id, offset }
    }

    pub fn with_memserver(region_id: u64, first_memserver_id: u64, offset: u64) -> Self {
        Self {
            region_id: (region_id & REGION_ID_MASK) | (first_memserver_id << MEMSERVER_ID_SHIFT),
            offset,
        }
    }

    /// The region id with the embedded memory-server bits masked off.
    pub fn pure_region_id(&self) -> u64 {
        self.region_id & REGION_ID_MASK
    }

    pub fn first_memserver_id(&self) -> u64 {
        self.region_id >> MEMSERVER_ID_SHIFT
    }
}

/// Descriptor lifecycle. Transitions are strictly monotonic; a descriptor
/// never moves backwards and `Invalid` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DescStatus {
    Uninit = 0,
    KeyNotValid = 1,
    InitDone = 2,
    Invalid = 3,
}

impl DescStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DescStatus::Uninit,
            1 => DescStatus::KeyNotValid,
            2 => DescStatus::InitDone,
            _ => DescStatus::Invalid,
        }
    }
}

/// Monotonic status word. `advance` uses `fetch_max` so racing transitions
/// can only move the status forward.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: DescStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> DescStatus {
        DescStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self, to: DescStatus) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyLevel {
    None,
    Raid1,
    Raid5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Volatile,
    Persistent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterleaveEnable {
    Enable,
    Disable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Region,
    DataItem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    Default,
}

/// Attributes a region is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAttributes {
    pub redundancy_level: RedundancyLevel,
    pub memory_type: MemoryType,
    pub interleave_enable: InterleaveEnable,
    pub permission_level: PermissionLevel,
    pub allocation_policy: AllocationPolicy,
}

impl Default for RegionAttributes {
    fn default() -> Self {
        Self {
            redundancy_level: RedundancyLevel::None,
            memory_type: MemoryType::Volatile,
            interleave_enable: InterleaveEnable::Enable,
            permission_level: PermissionLevel::Region,
            allocation_policy: AllocationPolicy::Default,
        }
    }
}

#[derive(Debug)]
struct RegionDescInner {
    name: String,
    size: u64,
    perm: u32,
    uid: u32,
    gid: u32,
    attrs: RegionAttributes,
}

/// Caller-held handle to a region. Cheap to clone; all clones observe the
/// same status and cached metadata.
#[derive(Clone, Debug)]
pub struct RegionDescriptor {
    state: Arc<RegionDescState>,
}

#[derive(Debug)]
struct RegionDescState {
    global: GlobalDescriptor,
    status: StatusCell,
    inner: RwLock<RegionDescInner>,
}

impl RegionDescriptor {
    pub(crate) fn new(global: GlobalDescriptor, size: u64) -> Self {
        Self {
            state: Arc::new(RegionDescState {
                global,
                status: StatusCell::new(DescStatus::Uninit),
                inner: RwLock::new(RegionDescInner {
                    name: String::new(),
                    size,
                    perm: 0,
                    uid: 0,
                    gid: 0,
                    attrs: RegionAttributes::default(),
                }),
            }),
        }
    }

    pub fn global_id(&self) -> GlobalDescriptor {
        self.state.global
    }

    pub fn status(&self) -> DescStatus {
        self.state.status.load()
    }

    pub fn name(&self) -> String {
        self.state.inner.read().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.state.inner.read().size
    }

    pub fn perm(&self) -> u32 {
        self.state.inner.read().perm
    }

    pub fn owner(&self) -> (u32, u32) {
        let inner = self.state.inner.read();
        (inner.uid, inner.gid)
    }

    pub fn attributes(&self) -> RegionAttributes {
        self.state.inner.read().attrs
    }

    pub fn permission_level(&self) -> PermissionLevel {
        self.state.inner.read().attrs.permission_level
    }

    /// Memory server targeted for control-plane calls on this region.
    pub fn memserver_id(&self) -> u64 {
        self.state.global.first_memserver_id()
    }

    pub(crate) fn advance_status(&self, to: DescStatus) {
        self.state.status.advance(to);
    }

    pub(crate) fn fill(
        &self,
        name: &str,
        size: u64,
        perm: u32,
        uid: u32,
        gid: u32,
        attrs: RegionAttributes,
    ) {
        let mut inner = self.state.inner.write();
        inner.name = name.to_string();
        inner.size = size;
        inner.perm = perm;
        inner.uid = uid;
        inner.gid = gid;
        inner.attrs = attrs;
    }
}

#[derive(Debug, Default)]
struct ItemDescInner {
    name: String,
    size: u64,
    perm: u32,
    uid: u32,
    gid: u32,
    used_memsrv_cnt: u64,
    memserver_ids: ExtentVec,
    interleave_size: u64,
    permission_level: Option<PermissionLevel>,
    keys: ExtentVec,
    base_addrs: ExtentVec,
}

/// Caller-held handle to a data item.
///
/// The key and base-address arrays are co-sized and co-indexed with the
/// memory-server list once the descriptor reaches `InitDone`.
#[derive(Clone, Debug)]
pub struct DataItemDescriptor {
    state: Arc<ItemDescState>,
}

#[derive(Debug)]
struct ItemDescState {
    global: GlobalDescriptor,
    status: StatusCell,
    inner: RwLock<ItemDescInner>,
}

/// One contiguous piece of an interleaved I/O request: `len` bytes at
/// fabric address `addr` on memory server `memserver_ids[server_index]`,
/// covering local buffer bytes `[local_offset, local_offset + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IoSegment {
    pub server_index: usize,
    pub addr: u64,
    pub key: u64,
    pub offset: u64,
    pub local_offset: u64,
    pub len: u64,
}

impl DataItemDescriptor {
    pub(crate) fn new(global: GlobalDescriptor, size: u64) -> Self {
        Self {
            state: Arc::new(ItemDescState {
                global,
                status: StatusCell::new(DescStatus::Uninit),
                inner: RwLock::new(ItemDescInner {
                    size,
                    ..ItemDescInner::default()
                }),
            }),
        }
    }

    pub fn global_id(&self) -> GlobalDescriptor {
        self.state.global
    }

    pub fn status(&self) -> DescStatus {
        self.state.status.load()
    }

    pub fn name(&self) -> String {
        self.state.inner.read().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.state.inner.read().size
    }

    pub fn perm(&self) -> u32 {
        self.state.inner.read().perm
    }

    pub fn owner(&self) -> (u32, u32) {
        let inner = self.state.inner.read();
        (inner.uid, inner.gid)
    }

    pub fn used_memsrv_cnt(&self) -> u64 {
        self.state.inner.read().used_memsrv_cnt
    }

    pub fn memserver_ids(&self) -> ExtentVec {
        self.state.inner.read().memserver_ids.clone()
    }

    pub fn interleave_size(&self) -> u64 {
        self.state.inner.read().interleave_size
    }

    pub fn permission_level(&self) -> Option<PermissionLevel> {
        self.state.inner.read().permission_level
    }

    /// Bound fabric keys, or `None` until the descriptor reaches `InitDone`.
    pub fn keys(&self) -> Option<ExtentVec> {
        let inner = self.state.inner.read();
        if inner.keys.is_empty() {
            None
        } else {
            Some(inner.keys.clone())
        }
    }

    pub fn base_addrs(&self) -> Option<ExtentVec> {
        let inner = self.state.inner.read();
        if inner.base_addrs.is_empty() {
            None
        } else {
            Some(inner.base_addrs.clone())
        }
    }

    pub fn first_memserver_id(&self) -> u64 {
        self.state.global.first_memserver_id()
    }

    pub(crate) fn advance_status(&self, to: DescStatus) {
        self.state.status.advance(to);
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.state.inner.write().size = size;
    }

    pub(crate) fn fill(
        &self,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
        used_memsrv_cnt: u64,
        memserver_ids: &[u64],
        interleave_size: u64,
        permission_level: PermissionLevel,
    ) {
        let mut inner = self.state.inner.write();
        inner.name = name.to_string();
        inner.perm = perm;
        inner.uid = uid;
        inner.gid = gid;
        inner.used_memsrv_cnt = used_memsrv_cnt;
        inner.memserver_ids = ExtentVec::from_slice(memserver_ids);
        inner.interleave_size = interleave_size;
        inner.permission_level = Some(permission_level);
    }

    /// Bind the per-extent keys and base addresses and move to `InitDone`.
    pub(crate) fn bind_placement(&self, keys: &[u64], base_addrs: &[u64]) {
        debug_assert_eq!(keys.len(), base_addrs.len());
        {
            let mut inner = self.state.inner.write();
            inner.keys = ExtentVec::from_slice(keys);
            inner.base_addrs = ExtentVec::from_slice(base_addrs);
        }
        self.state.status.advance(DescStatus::InitDone);
    }

    /// Decompose `(offset, nbytes)` into contiguous per-server segments
    /// following the item's interleave layout. Offsets past the item size
    /// are not rejected here; the data path validates bounds per segment.
    pub(crate) fn plan_io(&self, offset: u64, nbytes: u64) -> FamResult<Vec<IoSegment>> {
        let inner = self.state.inner.read();
        if inner.keys.is_empty() || inner.base_addrs.is_empty() {
            return Err(FamError::resource(
                "data item descriptor has no bound registration",
            ));
        }
        let cnt = inner.used_memsrv_cnt.max(1);
        if cnt == 1 || inner.interleave_size == 0 {
            return Ok(vec![IoSegment {
                server_index: 0,
                addr: inner.base_addrs[0].wrapping_add(offset),
                key: inner.keys[0],
                offset,
                local_offset: 0,
                len: nbytes,
            }]);
        }

        let il = inner.interleave_size;
        let mut segments = Vec::new();
        let mut off = offset;
        let mut local = 0u64;
        let mut remaining = nbytes;
        while remaining > 0 {
            let block = off / il;
            let within = off % il;
            let server_index = (block % cnt) as usize;
            let block_on_server = block / cnt;
            let len = remaining.min(il - within);
            segments.push(IoSegment {
                server_index,
                addr: inner.base_addrs[server_index]
                    .wrapping_add(block_on_server * il)
                    .wrapping_add(within),
                key: inner.keys[server_index],
                offset: off,
                local_offset: local,
                len,
            });
            off += len;
            local += len;
            remaining -= len;
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_encoding_round_trips() {
        let off = encode_offset(3, 0x1234);
        assert_eq!(decode_offset(off), (3, 0x1234));
        let off = encode_offset(0, 0);
        assert_eq!(decode_offset(off), (0, 0));
    }

    #[test]
    fn region_id_masks_memserver_bits() {
        let global = GlobalDescriptor::with_memserver(42, 7, 0);
        assert_eq!(global.pure_region_id(), 42);
        assert_eq!(global.first_memserver_id(), 7);
    }

    #[test]
    fn status_is_monotonic() {
        let cell = StatusCell::new(DescStatus::Uninit);
        cell.advance(DescStatus::InitDone);
        assert_eq!(cell.load(), DescStatus::InitDone);
        // A racing transition to an earlier state must not go backwards.
        cell.advance(DescStatus::KeyNotValid);
        assert_eq!(cell.load(), DescStatus::InitDone);
        cell.advance(DescStatus::Invalid);
        assert_eq!(cell.load(), DescStatus::Invalid);
    }

    #[test]
    fn plan_io_single_server_is_one_segment() {
        let desc = DataItemDescriptor::new(GlobalDescriptor::new(1, 0), 4096);
        desc.fill("it", 0o600, 0, 0, 1, &[0], 0, PermissionLevel::Region);
        desc.bind_placement(&[3], &[0x1000]);
        let segs = desc.plan_io(128, 256).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].addr, 0x1000 + 128);
        assert_eq!(segs[0].len, 256);
    }

    #[test]
    fn plan_io_splits_across_interleaved_servers() {
        let desc = DataItemDescriptor::new(GlobalDescriptor::new(1, 0), 1 << 20);
        desc.fill("it", 0o600, 0, 0, 2, &[0, 1], 128, PermissionLevel::Region);
        desc.bind_placement(&[3, 3], &[0x10000, 0x20000]);

        // 300 bytes starting at 100: 28 bytes on server 0 (chunk 0), 128 on
        // server 1 (chunk 1), 128 back on server 0 (chunk 2, second local
        // block), 16 on server 1.
        let segs = desc.plan_io(100, 300).unwrap();
        assert_eq!(segs.len(), 4);
        assert_eq!(
            (segs[0].server_index, segs[0].addr, segs[0].len),
            (0, 0x10000 + 100, 28)
        );
        assert_eq!(
            (segs[1].server_index, segs[1].addr, segs[1].len),
            (1, 0x20000, 128)
        );
        assert_eq!(
            (segs[2].server_index, segs[2].addr, segs[2].len),
            (0, 0x10000 + 128, 128)
        );
        assert_eq!(
            (segs[3].server_index, segs[3].addr, segs[3].len),
            (1, 0x20000 + 128, 16)
        );
        assert_eq!(segs.iter().map(|s| s.len).sum::<u64>(), 300);
    }
}
