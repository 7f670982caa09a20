//! Data-path operations.
//!
//! Blocking and non-blocking puts/gets, strided and indexed scatter/gather,
//! cross-item copies, and the atomic surface. Every entry point shares the
//! same preamble: reject degenerate arguments, rehydrate the descriptor if
//! its keys are not bound yet, then check bounds. Non-blocking operations
//! run through the async engine against a per-context accounting arena;
//! atomics complete synchronously on the transport.

use crate::allocator::AllocatorClient;
use crate::cis::CisWaitObject;
use crate::config::{ContextModel, FamConfig};
use crate::context::OpsContext;
use crate::descriptor::{DataItemDescriptor, DescStatus, IoSegment};
use crate::engine::{AsyncQHandler, OpInfo, OpPayload, SendPtr};
use crate::error::{FamError, FamResult};
use crate::transport::{
    key_allows_read, key_allows_write, AtomicArith, AtomicBitwise, AtomicCas, AtomicScalar,
    FabricTransport,
};
use dashmap::DashMap;
use std::sync::Arc;

pub(crate) struct FamOps {
    allocator: Arc<AllocatorClient>,
    engine: AsyncQHandler,
    transport: Arc<FabricTransport>,
    default_ctx: Arc<OpsContext>,
    region_contexts: DashMap<u64, Arc<OpsContext>>,
    context_model: ContextModel,
}

impl FamOps {
    pub(crate) fn new(
        allocator: Arc<AllocatorClient>,
        transport: Arc<FabricTransport>,
        config: &FamConfig,
    ) -> FamResult<Self> {
        let engine = AsyncQHandler::new(config.num_consumer, Arc::clone(&transport))?;
        Ok(Self {
            allocator,
            engine,
            transport,
            default_ctx: Arc::new(OpsContext::new(0)),
            region_contexts: DashMap::new(),
            context_model: config.context_model,
        })
    }

    pub(crate) fn default_ctx(&self) -> Arc<OpsContext> {
        Arc::clone(&self.default_ctx)
    }

    /// Context the data path charges operations on `item` to.
    pub(crate) fn data_ctx(&self, item: &DataItemDescriptor) -> Arc<OpsContext> {
        match self.context_model {
            ContextModel::Default => self.default_ctx(),
            ContextModel::Region => {
                let region_id = item.global_id().pure_region_id();
                self.region_contexts
                    .entry(region_id)
                    .or_insert_with(|| Arc::new(OpsContext::new(self.transport.open_context())))
                    .clone()
            }
        }
    }

    pub(crate) fn open_context(&self) -> Arc<OpsContext> {
        Arc::new(OpsContext::new(self.transport.open_context()))
    }

    pub(crate) fn close_context(&self, ctx: &OpsContext) {
        self.transport.close_context(ctx.context_id());
    }

    pub(crate) fn finalize(&self) {
        self.engine.shutdown();
    }

    /// Fails invalid descriptors and rehydrates ones whose keys are not yet
    /// bound.
    pub(crate) fn validate_item(&self, item: &DataItemDescriptor) -> FamResult<()> {
        if item.status() == DescStatus::Invalid {
            return Err(FamError::invalid("descriptor is no longer valid"));
        }
        if item.keys().is_none() {
            self.allocator.check_permission_get_info(item)?;
        }
        Ok(())
    }

    fn check_bounds(item: &DataItemDescriptor, offset: u64, nbytes: u64) -> FamResult<()> {
        let size = item.size();
        if offset >= size || offset + nbytes > size {
            return Err(FamError::out_of_range("access is out of bounds"));
        }
        Ok(())
    }

    // ---- blocking put/get ----

    pub(crate) fn put_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        if local.is_empty() {
            return Err(FamError::invalid("zero-byte request"));
        }
        self.validate_item(item)?;
        Self::check_bounds(item, offset, local.len() as u64)?;
        for seg in item.plan_io(offset, local.len() as u64)? {
            if !key_allows_write(seg.key) {
                return Err(FamError::no_perm("not permitted to write into data item"));
            }
            let chunk = &local[seg.local_offset as usize..(seg.local_offset + seg.len) as usize];
            self.transport.write(chunk, seg.addr);
            self.transport.persist(seg.addr, seg.len);
        }
        Ok(())
    }

    pub(crate) fn get_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        if local.is_empty() {
            return Err(FamError::invalid("zero-byte request"));
        }
        self.validate_item(item)?;
        Self::check_bounds(item, offset, local.len() as u64)?;
        for seg in item.plan_io(offset, local.len() as u64)? {
            if !key_allows_read(seg.key) {
                return Err(FamError::no_perm("not permitted to read from data item"));
            }
            self.transport.invalidate(seg.addr, seg.len);
            let chunk =
                &mut local[seg.local_offset as usize..(seg.local_offset + seg.len) as usize];
            self.transport.read(seg.addr, chunk);
        }
        Ok(())
    }

    // ---- non-blocking put/get ----

    fn queue_write(
        &self,
        ctx: &Arc<OpsContext>,
        item_size: u64,
        seg: &IoSegment,
        data: Vec<u8>,
    ) {
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::Write {
                src: data,
                dst_addr: seg.addr,
                ctx: Arc::clone(ctx),
            },
            nbytes: seg.len,
            offset: seg.offset,
            upper_bound: seg.offset + seg.len,
            key: seg.key,
            item_size,
        });
    }

    fn queue_read(&self, ctx: &Arc<OpsContext>, item_size: u64, seg: &IoSegment, dst: *mut u8) {
        self.engine.initiate_operation(OpInfo {
            payload: OpPayload::Read {
                src_addr: seg.addr,
                dst: SendPtr(dst),
                ctx: Arc::clone(ctx),
            },
            nbytes: seg.len,
            offset: seg.offset,
            upper_bound: seg.offset + seg.len,
            key: seg.key,
            item_size,
        });
    }

    /// Bounds are validated by the engine; a violation parks an error that
    /// the next `quiet` surfaces.
    pub(crate) fn put_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &[u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        if local.is_empty() {
            return Err(FamError::invalid("zero-byte request"));
        }
        self.validate_item(item)?;
        let item_size = item.size();
        for seg in item.plan_io(offset, local.len() as u64)? {
            let chunk =
                local[seg.local_offset as usize..(seg.local_offset + seg.len) as usize].to_vec();
            self.queue_write(ctx, item_size, &seg, chunk);
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `local` must stay valid and untouched until a `quiet` on `ctx`
    /// returns; the engine writes into it from a consumer thread.
    pub(crate) unsafe fn get_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &mut [u8],
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<()> {
        if local.is_empty() {
            return Err(FamError::invalid("zero-byte request"));
        }
        self.validate_item(item)?;
        let item_size = item.size();
        let base = local.as_mut_ptr();
        for seg in item.plan_io(offset, local.len() as u64)? {
            self.queue_read(ctx, item_size, &seg, base.add(seg.local_offset as usize));
        }
        Ok(())
    }

    // ---- strided and indexed scatter/gather ----

    fn strided_offsets(
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> impl Iterator<Item = u64> {
        (0..n_elements).map(move |i| first_element * element_size + i * stride * element_size)
    }

    fn check_sg_args(local_len: usize, n_elements: u64, element_size: u64) -> FamResult<()> {
        if n_elements == 0 || element_size == 0 {
            return Err(FamError::invalid("zero-length scatter/gather request"));
        }
        if (local_len as u64) < n_elements * element_size {
            return Err(FamError::invalid("local buffer too small"));
        }
        Ok(())
    }

    pub(crate) fn gather_stride_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), n_elements, element_size)?;
        self.validate_item(item)?;
        let last = first_element * element_size + (n_elements - 1) * stride * element_size;
        Self::check_bounds(item, last, element_size)?;
        for (i, off) in
            Self::strided_offsets(n_elements, first_element, stride, element_size).enumerate()
        {
            let dst = &mut local[i * element_size as usize..(i + 1) * element_size as usize];
            self.get_blocking(dst, item, off)?;
        }
        Ok(())
    }

    pub(crate) fn scatter_stride_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), n_elements, element_size)?;
        self.validate_item(item)?;
        let last = first_element * element_size + (n_elements - 1) * stride * element_size;
        Self::check_bounds(item, last, element_size)?;
        for (i, off) in
            Self::strided_offsets(n_elements, first_element, stride, element_size).enumerate()
        {
            let src = &local[i * element_size as usize..(i + 1) * element_size as usize];
            self.put_blocking(src, item, off)?;
        }
        Ok(())
    }

    pub(crate) fn gather_index_blocking(
        &self,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), element_index.len() as u64, element_size)?;
        self.validate_item(item)?;
        for (i, &index) in element_index.iter().enumerate() {
            let off = index * element_size;
            Self::check_bounds(item, off, element_size)?;
            let dst = &mut local[i * element_size as usize..(i + 1) * element_size as usize];
            self.get_blocking(dst, item, off)?;
        }
        Ok(())
    }

    pub(crate) fn scatter_index_blocking(
        &self,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), element_index.len() as u64, element_size)?;
        self.validate_item(item)?;
        for (i, &index) in element_index.iter().enumerate() {
            let off = index * element_size;
            Self::check_bounds(item, off, element_size)?;
            let src = &local[i * element_size as usize..(i + 1) * element_size as usize];
            self.put_blocking(src, item, off)?;
        }
        Ok(())
    }

    pub(crate) fn scatter_stride_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &[u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), n_elements, element_size)?;
        self.validate_item(item)?;
        let item_size = item.size();
        for (i, off) in
            Self::strided_offsets(n_elements, first_element, stride, element_size).enumerate()
        {
            let src = &local[i * element_size as usize..(i + 1) * element_size as usize];
            for seg in item.plan_io(off, element_size)? {
                let chunk = src[seg.local_offset as usize..(seg.local_offset + seg.len) as usize]
                    .to_vec();
                self.queue_write(ctx, item_size, &seg, chunk);
            }
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as [`FamOps::get_nonblocking`].
    pub(crate) unsafe fn gather_stride_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &mut [u8],
        item: &DataItemDescriptor,
        n_elements: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), n_elements, element_size)?;
        self.validate_item(item)?;
        let item_size = item.size();
        let base = local.as_mut_ptr();
        for (i, off) in
            Self::strided_offsets(n_elements, first_element, stride, element_size).enumerate()
        {
            for seg in item.plan_io(off, element_size)? {
                let dst = base.add(i * element_size as usize + seg.local_offset as usize);
                self.queue_read(ctx, item_size, &seg, dst);
            }
        }
        Ok(())
    }

    pub(crate) fn scatter_index_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &[u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), element_index.len() as u64, element_size)?;
        self.validate_item(item)?;
        let item_size = item.size();
        for (i, &index) in element_index.iter().enumerate() {
            let off = index * element_size;
            let src = &local[i * element_size as usize..(i + 1) * element_size as usize];
            for seg in item.plan_io(off, element_size)? {
                let chunk = src[seg.local_offset as usize..(seg.local_offset + seg.len) as usize]
                    .to_vec();
                self.queue_write(ctx, item_size, &seg, chunk);
            }
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as [`FamOps::get_nonblocking`].
    pub(crate) unsafe fn gather_index_nonblocking(
        &self,
        ctx: &Arc<OpsContext>,
        local: &mut [u8],
        item: &DataItemDescriptor,
        element_index: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        Self::check_sg_args(local.len(), element_index.len() as u64, element_size)?;
        self.validate_item(item)?;
        let item_size = item.size();
        let base = local.as_mut_ptr();
        for (i, &index) in element_index.iter().enumerate() {
            let off = index * element_size;
            for seg in item.plan_io(off, element_size)? {
                let dst = base.add(i * element_size as usize + seg.local_offset as usize);
                self.queue_read(ctx, item_size, &seg, dst);
            }
        }
        Ok(())
    }

    // ---- copy / backup / restore ----

    pub(crate) fn copy(
        &self,
        src: &DataItemDescriptor,
        src_offset: u64,
        dst: &DataItemDescriptor,
        dst_offset: u64,
        nbytes: u64,
    ) -> FamResult<CisWaitObject> {
        if nbytes == 0 {
            return Err(FamError::invalid("zero-byte copy"));
        }
        self.validate_item(src)?;
        self.validate_item(dst)?;
        self.allocator.copy(src, src_offset, dst, dst_offset, nbytes)
    }

    pub(crate) fn backup(
        &self,
        src: &DataItemDescriptor,
        backup_name: &str,
    ) -> FamResult<CisWaitObject> {
        self.validate_item(src)?;
        self.allocator.backup(src, backup_name)
    }

    pub(crate) fn restore(
        &self,
        backup_name: &str,
        dst: &DataItemDescriptor,
    ) -> FamResult<CisWaitObject> {
        self.validate_item(dst)?;
        self.allocator.restore(dst, backup_name)
    }

    // ---- quiet / fence / progress ----

    pub(crate) fn quiet_ctx(&self, ctx: &OpsContext) -> FamResult<()> {
        ctx.quiet()
    }

    /// Quiet the default context and every region context; explicitly
    /// opened contexts are isolated and quiesce through their own handle.
    pub(crate) fn quiet(&self) -> FamResult<()> {
        self.default_ctx.quiet()?;
        for entry in self.region_contexts.iter() {
            entry.value().quiet()?;
        }
        Ok(())
    }

    pub(crate) fn fence(&self) {
        self.transport.fence();
    }

    pub(crate) fn progress(&self) -> u64 {
        let mut outstanding = self.default_ctx.progress();
        for entry in self.region_contexts.iter() {
            outstanding += entry.value().progress();
        }
        outstanding
    }

    // ---- atomics ----

    fn atomic_slot(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        size: u64,
    ) -> FamResult<IoSegment> {
        self.validate_item(item)?;
        if offset % size != 0 {
            return Err(FamError::invalid("misaligned offset"));
        }
        Self::check_bounds(item, offset, size)?;
        let mut segments = item.plan_io(offset, size)?;
        // Configuration floors interleave_size at the widest atomic scalar,
        // so an aligned access plans to one segment; anything else must not
        // reach the raw atomic ops.
        if segments.len() != 1 {
            return Err(FamError::invalid(
                "atomic access straddles an interleave boundary",
            ));
        }
        Ok(segments.remove(0))
    }

    fn want_read(seg: &IoSegment) -> FamResult<()> {
        if !key_allows_read(seg.key) {
            return Err(FamError::no_perm("not permitted to read from data item"));
        }
        Ok(())
    }

    fn want_write(seg: &IoSegment) -> FamResult<()> {
        if !key_allows_write(seg.key) {
            return Err(FamError::no_perm("not permitted to write into data item"));
        }
        Ok(())
    }

    pub(crate) fn atomic_set<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        let seg = self.atomic_slot(item, offset, T::SIZE)?;
        Self::want_write(&seg)?;
        unsafe { T::atomic_store(seg.addr, value) };
        self.transport.persist(seg.addr, T::SIZE);
        Ok(())
    }

    pub(crate) fn atomic_fetch<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<T> {
        let seg = self.atomic_slot(item, offset, T::SIZE)?;
        Self::want_read(&seg)?;
        self.transport.invalidate(seg.addr, T::SIZE);
        Ok(unsafe { T::atomic_load(seg.addr) })
    }

    pub(crate) fn swap<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        let seg = self.atomic_slot(item, offset, T::SIZE)?;
        Self::want_read(&seg)?;
        Self::want_write(&seg)?;
        let old = unsafe { T::atomic_swap(seg.addr, value) };
        self.transport.persist(seg.addr, T::SIZE);
        Ok(old)
    }

    pub(crate) fn compare_swap<T: AtomicCas>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: T,
        desired: T,
    ) -> FamResult<T> {
        let seg = self.atomic_slot(item, offset, T::SIZE)?;
        Self::want_read(&seg)?;
        Self::want_write(&seg)?;
        let old = unsafe { T::atomic_compare_swap(seg.addr, expected, desired) };
        self.transport.persist(seg.addr, T::SIZE);
        Ok(old)
    }

    fn atomic_rmw<T: AtomicScalar>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        fetching: bool,
        op: impl FnOnce(u64) -> T,
    ) -> FamResult<T> {
        let seg = self.atomic_slot(item, offset, T::SIZE)?;
        if fetching {
            Self::want_read(&seg)?;
        }
        Self::want_write(&seg)?;
        let old = op(seg.addr);
        self.transport.persist(seg.addr, T::SIZE);
        Ok(old)
    }

    pub(crate) fn atomic_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_add(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_sub(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_min(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_max(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_and(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_or(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<()> {
        self.atomic_rmw(item, offset, false, |addr| unsafe {
            T::atomic_xor(addr, value)
        })
        .map(|_| ())
    }

    pub(crate) fn atomic_fetch_add<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_add(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_subtract<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_sub(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_min<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_min(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_max<T: AtomicArith>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_max(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_and<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_and(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_or<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_or(addr, value)
        })
    }

    pub(crate) fn atomic_fetch_xor<T: AtomicBitwise>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: T,
    ) -> FamResult<T> {
        self.atomic_rmw(item, offset, true, |addr| unsafe {
            T::atomic_xor(addr, value)
        })
    }

    // ---- 128-bit atomics, routed through the server-side CAS mutex ----

    fn with_cas_lock<R>(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        seg: &IoSegment,
        f: impl FnOnce() -> R,
    ) -> FamResult<R> {
        let memserver_id = item.memserver_ids()[seg.server_index];
        self.allocator.acquire_cas_lock(offset, memserver_id)?;
        let result = f();
        self.allocator.release_cas_lock(offset, memserver_id)?;
        Ok(result)
    }

    pub(crate) fn atomic_set_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        value: i128,
    ) -> FamResult<()> {
        let seg = self.atomic_slot(item, offset, 16)?;
        Self::want_write(&seg)?;
        self.with_cas_lock(item, offset, &seg, || {
            unsafe { (seg.addr as *mut i128).write_volatile(value) };
            self.transport.persist(seg.addr, 16);
        })
    }

    pub(crate) fn atomic_fetch_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
    ) -> FamResult<i128> {
        let seg = self.atomic_slot(item, offset, 16)?;
        Self::want_read(&seg)?;
        self.with_cas_lock(item, offset, &seg, || {
            self.transport.invalidate(seg.addr, 16);
            unsafe { (seg.addr as *const i128).read_volatile() }
        })
    }

    /// 128-bit compare-and-swap is not supported natively by the fabric;
    /// the server-side mutex makes the read-modify-write atomic.
    pub(crate) fn compare_swap_i128(
        &self,
        item: &DataItemDescriptor,
        offset: u64,
        expected: i128,
        desired: i128,
    ) -> FamResult<i128> {
        let seg = self.atomic_slot(item, offset, 16)?;
        Self::want_read(&seg)?;
        Self::want_write(&seg)?;
        self.with_cas_lock(item, offset, &seg, || {
            let current = unsafe { (seg.addr as *const i128).read_volatile() };
            if current == expected {
                unsafe { (seg.addr as *mut i128).write_volatile(desired) };
                self.transport.persist(seg.addr, 16);
            }
            current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cis::DirectCis;
    use crate::config::FamOptions;
    use crate::descriptor::RegionAttributes;
    use crate::error::FamErrorKind;

    fn ops() -> (FamOps, DataItemDescriptor) {
        let options = FamOptions {
            num_memory_servers: Some(1),
            memory_per_server: Some(16 * 1024 * 1024),
            interleave_size: Some(4096),
            ..Default::default()
        };
        let config = FamConfig::resolve(&options).unwrap();
        let cis = Arc::new(DirectCis::new(&config).unwrap());
        let allocator = Arc::new(AllocatorClient::new(cis, true));
        let transport = Arc::new(FabricTransport::new(&config).unwrap());
        let ops = FamOps::new(Arc::clone(&allocator), transport, &config).unwrap();
        let region = allocator
            .create_region("ops", 1 << 20, 0o777, &RegionAttributes::default())
            .unwrap();
        let item = allocator.allocate("it", 64 * 1024, 0o600, &region).unwrap();
        (ops, item)
    }

    #[test]
    fn blocking_round_trip() {
        let (ops, item) = ops();
        ops.put_blocking(b"over the fabric", &item, 128).unwrap();
        let mut out = vec![0u8; 15];
        ops.get_blocking(&mut out, &item, 128).unwrap();
        assert_eq!(&out, b"over the fabric");
    }

    #[test]
    fn blocking_rejects_out_of_bounds() {
        let (ops, item) = ops();
        let err = ops.put_blocking(b"x", &item, 64 * 1024).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::OutOfRange);
        let mut out = vec![0u8; 32];
        let err = ops.get_blocking(&mut out, &item, 64 * 1024 - 16).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::OutOfRange);
    }

    #[test]
    fn misaligned_atomic_is_invalid() {
        let (ops, item) = ops();
        let err = ops.atomic_set::<u64>(&item, 4, 1).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::Invalid);
        let err = ops.atomic_fetch::<u32>(&item, 2).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::Invalid);
    }

    #[test]
    fn atomic_out_of_bounds_is_rejected() {
        let (ops, item) = ops();
        let err = ops.atomic_set::<u64>(&item, 64 * 1024, 1).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::OutOfRange);
    }

    #[test]
    fn i128_ops_round_trip_under_the_cas_mutex() {
        let (ops, item) = ops();
        let big = (1i128 << 100) | 0xdead_beef;
        ops.atomic_set_i128(&item, 0, big).unwrap();
        assert_eq!(ops.atomic_fetch_i128(&item, 0).unwrap(), big);

        let old = ops.compare_swap_i128(&item, 0, big, 7).unwrap();
        assert_eq!(old, big);
        assert_eq!(ops.atomic_fetch_i128(&item, 0).unwrap(), 7);

        // Mismatched expected value leaves the cell untouched.
        let old = ops.compare_swap_i128(&item, 0, big, 99).unwrap();
        assert_eq!(old, 7);
        assert_eq!(ops.atomic_fetch_i128(&item, 0).unwrap(), 7);
    }
}
