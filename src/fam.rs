//! Public runtime facade.
//!
//! `Fam::initialize` resolves configuration, selects the CIS backend and
//! fabric model, and wires up the allocator client, resource manager, async
//! engine and transport. All lifecycle and data-path entry points live
//! here; `FamContext` is an isolated sub-runtime for scoped concurrency.

use crate::allocator::AllocatorClient;
use crate::cis::{
    BackupInfo, Cis, CisWaitObject, DirectCis, ItemInfo, MemServerInfo, RegionInfo, RpcCis,
};
use crate::config::{CisInterfaceType, FamConfig, FamOptions, ThreadModel};
use crate::context::OpsContext;
use crate::descriptor::{DataItemDescriptor, RegionAttributes, RegionDescriptor};
use crate::error::{FamError, FamResult};
use crate::ops::FamOps;
use crate::pe::PeInfo;
use crate::transport::{AtomicArith, AtomicBitwise, AtomicCas, AtomicScalar, FabricTransport};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wait object for a non-blocking copy/backup/restore/delete-backup; feed
/// it to the matching `wait_for_*`.
pub type FamWaitObject = CisWaitObject;

pub struct Fam {
    inner: Arc<FamInner>,
}

struct FamInner {
    config: FamConfig,
    allocator: Arc<AllocatorClient>,
    ops: FamOps,
    api_lock: Option<ReentrantMutex<()>>,
    pe: PeInfo,
    finalized: AtomicBool,
}

impl FamInner {
    fn guard(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.api_lock.as_ref().map(|lock| lock.lock())
    }
}

impl Drop for FamInner {
    fn drop(&mut self) {
        if !self.finalized.load(Ordering::SeqCst) {
            self.ops.finalize();
        }
    }
}

impl Fam {
    /// Bring the runtime up. Explicit options win over the config file,
    /// which wins over defaults.
    pub fn initialize(options: &FamOptions) -> FamResult<Fam> {
        let config = FamConfig::resolve(options)?;
        let pe = crate::pe::initialize(config.runtime)?;
        let transport = Arc::new(FabricTransport::new(&config)?);
        let cis: Arc<dyn Cis> = match config.cis_interface_type {
            CisInterfaceType::Direct => Arc::new(DirectCis::new(&config)?),
            CisInterfaceType::Rpc => {
                let uid = unsafe { libc::getuid() } as u32;
                let gid = unsafe { libc::getgid() } as u32;
                Arc::new(RpcCis::connect(
                    &config.cis_server,
                    config.grpc_port,
                    uid,
                    gid,
                )?)
            }
        };
        let allocator = Arc::new(AllocatorClient::new(cis, config.resource_release));
        let ops = FamOps::new(Arc::clone(&allocator), transport, &config)?;
        let api_lock = match config.thread_model {
            ThreadModel::Serialize => Some(ReentrantMutex::new(())),
            ThreadModel::Multiple => None,
        };
        tracing::info!(
            pe = pe.pe_id,
            pes = pe.num_pes,
            model = ?config.openfam_model,
            cis = ?config.cis_interface_type,
            "FAM runtime initialized"
        );
        Ok(Fam {
            inner: Arc::new(FamInner {
                config,
                allocator,
                ops,
                api_lock,
                pe,
                finalized: AtomicBool::new(false),
            }),
        })
    }

    /// Quiesce outstanding operations, close every referenced region, and
    /// stop the engine. Idempotent; also implied by drop (without the
    /// remote closes).
    pub fn finalize(&self) -> FamResult<()> {
        let _guard = self.inner.guard();
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ops.quiet()?;
        self.inner.allocator.close_all_regions()?;
        self.inner.ops.finalize();
        Ok(())
    }

    pub fn pe_id(&self) -> u64 {
        self.inner.pe.pe_id
    }

    pub fn num_pes(&self) -> u64 {
        self.inner.pe.num_pes
    }

    /// Global barrier across the job's PEs.
    pub fn barrier_all(&self) {
        crate::pe::barrier(&self.inner.pe);
    }

    pub fn get_num_memory_servers(&self) -> FamResult<u64> {
        self.inner.allocator.get_num_memory_servers()
    }

    fn default_attributes(&self) -> RegionAttributes {
        RegionAttributes {
            memory_type: self.inner.config.default_memory_type,
            ..RegionAttributes::default()
        }
    }

    // ---- region and data-item lifecycle ----

    pub fn create_region(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        attrs: Option<RegionAttributes>,
    ) -> FamResult<RegionDescriptor> {
        let _guard = self.inner.guard();
        let attrs = attrs.unwrap_or_else(|| self.default_attributes());
        self.inner.allocator.create_region(name, nbytes, perm, &attrs)
    }

    pub fn destroy_region(&self, region: &RegionDescriptor) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.destroy_region(region)
    }

    pub fn resize_region(&self, region: &RegionDescriptor, nbytes: u64) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.resize_region(region, nbytes)
    }

    pub fn allocate(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        region: &RegionDescriptor,
    ) -> FamResult<DataItemDescriptor> {
        let _guard = self.inner.guard();
        self.inner.allocator.allocate(name, nbytes, perm, region)
    }

    pub fn deallocate(&self, item: &DataItemDescriptor) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.deallocate(item)
    }

    /// Invalidate the descriptor and drop its region reference.
    pub fn close(&self, item: &DataItemDescriptor) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.close(item)
    }

    pub fn lookup_region(&self, name: &str) -> FamResult<RegionDescriptor> {
        let _guard = self.inner.guard();
        self.inner.allocator.lookup_region(name)
    }

    /// Empty `region_name` falls back to the configured default region.
    pub fn lookup(&self, item_name: &str, region_name: &str) -> FamResult<DataItemDescriptor> {
        let _guard = self.inner.guard();
        let region_name = if region_name.is_empty() {
            self.inner.config.default_region_name.as_str()
        } else {
            region_name
        };
        self.inner.allocator.lookup(item_name, region_name)
    }

    pub fn change_region_permission(
        &self,
        region: &RegionDescriptor,
        perm: u32,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.change_region_permission(region, perm)
    }

    pub fn change_dataitem_permission(
        &self,
        item: &DataItemDescriptor,
        perm: u32,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.allocator.change_dataitem_permission(item, perm)
    }

    pub fn stat(&self, item: &DataItemDescriptor) -> FamResult<ItemInfo> {
        let _guard = self.inner.guard();
        self.inner.allocator.get_stat_info(item)
    }

    pub fn region_info(&self, region: &RegionDescriptor) -> FamResult<RegionInfo> {
        let _guard = self.inner.guard();
        self.inner.allocator.check_permission_get_region_info(region)
    }

    // ---- blocking data path ----

    pub fn put_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.put_blocking(local, item, offset)
    }

    pub fn get_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.get_blocking(local, item, offset)
    }

    pub fn gather_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.gather_stride_blocking(
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn scatter_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.scatter_stride_blocking(
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn gather_indexed_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner
            .ops
            .gather_index_blocking(local, item, element_index, element_size)
    }

    pub fn scatter_indexed_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner
            .ops
            .scatter_index_blocking(local, item, element_index, element_size)
    }

    // ---- non-blocking data path ----

    pub fn put_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner.ops.put_nonblocking(&ctx, local, item, offset)
    }

    /// # Safety
    ///
    /// `local` must stay valid and untouched until the next `quiet`
    /// returns; the engine writes into it from a consumer thread.
    pub unsafe fn get_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner.ops.get_nonblocking(&ctx, local, item, offset)
    }

    pub fn scatter_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner.ops.scatter_stride_nonblocking(
            &ctx,
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    /// # Safety
    ///
    /// Same contract as [`Fam::get_nonblocking`].
    pub unsafe fn gather_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner.ops.gather_stride_nonblocking(
            &ctx,
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn scatter_indexed_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner
            .ops
            .scatter_index_nonblocking(&ctx, local, item, element_index, element_size)
    }

    /// # Safety
    ///
    /// Same contract as [`Fam::get_nonblocking`].
    pub unsafe fn gather_indexed_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        let ctx = self.inner.ops.data_ctx(item);
        self.inner
            .ops
            .gather_index_nonblocking(&ctx, local, item, element_index, element_size)
    }

    // ---- copy / backup / restore ----

    pub fn copy(
        &self,
        src: &DataItemDescriptor,
        src_offset: u64,
        dst: &DataItemDescriptor,
        dst_offset: u64,
        nbytes: u64,
    ) -> FamResult<FamWaitObject> {
        let _guard = self.inner.guard();
        self.inner.ops.copy(src, src_offset, dst, dst_offset, nbytes)
    }

    pub fn wait_for_copy(&self, wait: FamWaitObject) -> FamResult<()> {
        self.inner.allocator.wait_for_copy(wait)
    }

    pub fn backup(&self, src: &DataItemDescriptor, backup_name: &str) -> FamResult<FamWaitObject> {
        let _guard = self.inner.guard();
        self.inner.ops.backup(src, backup_name)
    }

    pub fn wait_for_backup(&self, wait: FamWaitObject) -> FamResult<()> {
        self.inner.allocator.wait_for_backup(wait)
    }

    pub fn restore(&self, backup_name: &str, dst: &DataItemDescriptor) -> FamResult<FamWaitObject> {
        let _guard = self.inner.guard();
        self.inner.ops.restore(backup_name, dst)
    }

    pub fn wait_for_restore(&self, wait: FamWaitObject) -> FamResult<()> {
        self.inner.allocator.wait_for_restore(wait)
    }

    pub fn delete_backup(&self, backup_name: &str) -> FamResult<FamWaitObject> {
        let _guard = self.inner.guard();
        self.inner.allocator.delete_backup(backup_name)
    }

    pub fn wait_for_delete_backup(&self, wait: FamWaitObject) -> FamResult<()> {
        self.inner.allocator.wait_for_delete_backup(wait)
    }

    pub fn list_backup(&self, backup_name: &str) -> FamResult<String> {
        let _guard = self.inner.guard();
        self.inner.allocator.list_backup(backup_name)
    }

    pub fn get_backup_info(&self, backup_name: &str) -> FamResult<BackupInfo> {
        let _guard = self.inner.guard();
        self.inner.allocator.get_backup_info(backup_name)
    }

    // ---- quiet / fence / progress ----

    /// Block until every operation this runtime submitted has completed,
    /// surfacing the first parked error. Contexts opened with
    /// `context_open` quiesce independently.
    pub fn quiet(&self) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.quiet()
    }

    /// Ordering boundary weaker than `quiet`: operations issued before the
    /// fence complete before operations issued after it.
    pub fn fence(&self) -> FamResult<()> {
        self.inner.ops.fence();
        Ok(())
    }

    /// Outstanding (submitted but not completed) operation count.
    pub fn progress(&self) -> u64 {
        self.inner.ops.progress()
    }

    // ---- contexts ----

    pub fn context_open(&self) -> FamResult<FamContext> {
        let _guard = self.inner.guard();
        Ok(FamContext {
            ctx: self.inner.ops.open_context(),
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn context_close(&self, context: FamContext) -> FamResult<()> {
        let _guard = self.inner.guard();
        context.quiet()?;
        self.inner.ops.close_context(&context.ctx);
        Ok(())
    }

    // ---- atomics ----

    pub fn atomic_set<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_set(item, offset, value)
    }

    pub fn atomic_fetch<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch(item, offset)
    }

    pub fn swap<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.swap(item, offset, value)
    }

    pub fn compare_swap<T: AtomicCas>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: T,
        desired: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.compare_swap(item, offset, expected, desired)
    }

    pub fn atomic_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_add(item, offset, value)
    }

    pub fn atomic_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_subtract(item, offset, value)
    }

    pub fn atomic_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_min(item, offset, value)
    }

    pub fn atomic_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_max(item, offset, value)
    }

    pub fn atomic_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_and(item, offset, value)
    }

    pub fn atomic_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_or(item, offset, value)
    }

    pub fn atomic_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_xor(item, offset, value)
    }

    pub fn atomic_fetch_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_add(item, offset, value)
    }

    pub fn atomic_fetch_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_subtract(item, offset, value)
    }

    pub fn atomic_fetch_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_min(item, offset, value)
    }

    pub fn atomic_fetch_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_max(item, offset, value)
    }

    pub fn atomic_fetch_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_and(item, offset, value)
    }

    pub fn atomic_fetch_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_or(item, offset, value)
    }

    pub fn atomic_fetch_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_xor(item, offset, value)
    }

    pub fn atomic_set_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: i128,
    ) -> FamResult<()> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_set_i128(item, offset, value)
    }

    pub fn atomic_fetch_i128(&self, item: &DataItemDescriptor, offset: u64) -> FamResult<i128> {
        let _guard = self.inner.guard();
        self.inner.ops.atomic_fetch_i128(item, offset)
    }

    pub fn compare_swap_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: i128,
        desired: i128,
    ) -> FamResult<i128> {
        let _guard = self.inner.guard();
        self.inner.ops.compare_swap_i128(item, offset, expected, desired)
    }

    // ---- fabric address exchange ----

    pub fn get_addr_size(&self, memserver_id: u64) -> FamResult<u64> {
        self.inner.allocator.get_addr_size(memserver_id)
    }

    pub fn get_addr(&self, memserver_id: u64) -> FamResult<Vec<u8>> {
        self.inner.allocator.get_addr(memserver_id)
    }

    pub fn get_memserverinfo_size(&self) -> FamResult<u64> {
        self.inner.allocator.get_memserverinfo_size()
    }

    pub fn get_memserverinfo(&self) -> FamResult<Vec<MemServerInfo>> {
        self.inner.allocator.get_memserverinfo()
    }
}

fn context_noperm() -> FamError {
    FamError::no_perm("operation not permitted on a fam_context")
}

/// Independent sub-runtime carved from the main runtime. Shares the
/// allocator client and resource manager, but owns a dedicated transport
/// context id so its outstanding operations, `quiet` and `fence` are
/// isolated from the parent's. Lifecycle-mutating calls fail with `NOPERM`.
pub struct FamContext {
    ctx: Arc<OpsContext>,
    inner: Arc<FamInner>,
}

impl FamContext {
    pub fn put_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        self.inner.ops.put_blocking(local, item, offset)
    }

    pub fn get_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        self.inner.ops.get_blocking(local, item, offset)
    }

    pub fn gather_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        self.inner.ops.gather_stride_blocking(
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn scatter_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        self.inner.ops.scatter_stride_blocking(
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn gather_indexed_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        self.inner
            .ops
            .gather_index_blocking(local, item, element_index, element_size)
    }

    pub fn scatter_indexed_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        self.inner
            .ops
            .scatter_index_blocking(local, item, element_index, element_size)
    }

    pub fn put_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        self.inner.ops.put_nonblocking(&self.ctx, local, item, offset)
    }

    /// # Safety
    ///
    /// `local` must stay valid and untouched until a `quiet` on this
    /// context returns.
    pub unsafe fn get_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        self.inner.ops.get_nonblocking(&self.ctx, local, item, offset)
    }

    pub fn scatter_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        self.inner.ops.scatter_stride_nonblocking(
            &self.ctx,
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    /// # Safety
    ///
    /// Same contract as [`FamContext::get_nonblocking`].
    pub unsafe fn gather_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        self.inner.ops.gather_stride_nonblocking(
            &self.ctx,
            local,
            item,
            n_elements,
            first_element,
            stride,
            element_size,
        )
    }

    pub fn scatter_indexed_nonblocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        self.inner
            .ops
            .scatter_index_nonblocking(&self.ctx, local, item, element_index, element_size)
    }

    /// # Safety
    ///
    /// Same contract as [`FamContext::get_nonblocking`].
    pub unsafe fn gather_indexed_nonblocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        self.inner
            .ops
            .gather_index_nonblocking(&self.ctx, local, item, element_index, element_size)
    }

    /// Wait for this context's outstanding operations only.
    pub fn quiet(&self) -> FamResult<()> {
        self.inner.ops.quiet_ctx(&self.ctx)
    }

    pub fn fence(&self) -> FamResult<()> {
        self.inner.ops.fence();
        Ok(())
    }

    pub fn progress(&self) -> u64 {
        self.ctx.progress()
    }

    pub fn atomic_set<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_set(item, offset, value)
    }

    pub fn atomic_fetch<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch(item, offset)
    }

    pub fn swap<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.swap(item, offset, value)
    }

    pub fn compare_swap<T: AtomicCas>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: T,
        desired: T,
    ) -> FamResult<T> {
        self.inner.ops.compare_swap(item, offset, expected, desired)
    }

    pub fn atomic_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_add(item, offset, value)
    }

    pub fn atomic_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_subtract(item, offset, value)
    }

    pub fn atomic_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_min(item, offset, value)
    }

    pub fn atomic_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_max(item, offset, value)
    }

    pub fn atomic_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_and(item, offset, value)
    }

    pub fn atomic_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_or(item, offset, value)
    }

    pub fn atomic_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.inner.ops.atomic_xor(item, offset, value)
    }

    pub fn atomic_fetch_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_add(item, offset, value)
    }

    pub fn atomic_fetch_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_subtract(item, offset, value)
    }

    pub fn atomic_fetch_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_min(item, offset, value)
    }

    pub fn atomic_fetch_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_max(item, offset, value)
    }

    pub fn atomic_fetch_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_and(item, offset, value)
    }

    pub fn atomic_fetch_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_or(item, offset, value)
    }

    pub fn atomic_fetch_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.inner.ops.atomic_fetch_xor(item, offset, value)
    }

    pub fn atomic_set_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: i128,
    ) -> FamResult<()> {
        self.inner.ops.atomic_set_i128(item, offset, value)
    }

    pub fn atomic_fetch_i128(&self, item: &DataItemDescriptor, offset: u64) -> FamResult<i128> {
        self.inner.ops.atomic_fetch_i128(item, offset)
    }

    pub fn compare_swap_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: i128,
        desired: i128,
    ) -> FamResult<i128> {
        self.inner.ops.compare_swap_i128(item, offset, expected, desired)
    }

    // Lifecycle mutations are reserved for the parent runtime.

    pub fn create_region(
        &self,
        _name: &str,
        _nbytes: u64,
        _perm: u32,
        _attrs: Option<RegionAttributes>,
    ) -> FamResult<RegionDescriptor> {
        Err(context_noperm())
    }

    pub fn destroy_region(&self, _region: &RegionDescriptor) -> FamResult<()> {
        Err(context_noperm())
    }

    pub fn allocate(
        &self,
        _name: &str,
        _nbytes: u64,
        _perm: u32,
        _region: &RegionDescriptor,
    ) -> FamResult<DataItemDescriptor> {
        Err(context_noperm())
    }

    pub fn deallocate(&self, _item: &DataItemDescriptor) -> FamResult<()> {
        Err(context_noperm())
    }

    pub fn context_open(&self) -> FamResult<FamContext> {
        Err(context_noperm())
    }
}
