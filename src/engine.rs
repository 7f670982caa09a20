//! Asynchronous operation engine.
//!
//! A multi-producer/multi-consumer queue serviced by a configurable pool of
//! consumer threads. Non-blocking puts and gets are validated and executed
//! here; cross-server copies, backups, restores and backup deletions are
//! fanned out to the per-server memory services and report completion
//! through their tags. Failed read/write operations are parked on the
//! owning context's completion queue and surface at the next `quiet`.

use crate::context::OpsContext;
use crate::error::{FamError, FamErrorKind, FamResult};
use crate::memserver::{
    BackupMeta, MemoryService, SrcLayout, SubBackupRequest, SubCopyRequest, SubRestoreRequest,
};
use crate::transport::{key_allows_read, key_allows_write, FabricTransport};
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Raw destination pointer carried across the queue for non-blocking reads.
/// The caller guarantees the buffer stays valid until the next `quiet`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendPtr(pub(crate) *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

pub(crate) enum OpPayload {
    Write {
        src: Vec<u8>,
        dst_addr: u64,
        ctx: Arc<OpsContext>,
    },
    Read {
        src_addr: u64,
        dst: SendPtr,
        ctx: Arc<OpsContext>,
    },
    Copy(Arc<CopyTag>),
    Backup(Arc<BackupTag>),
    Restore(Arc<RestoreTag>),
    DeleteBackup(Arc<DeleteBackupTag>),
}

pub(crate) struct OpInfo {
    pub payload: OpPayload,
    pub nbytes: u64,
    pub offset: u64,
    pub upper_bound: u64,
    pub key: u64,
    pub item_size: u64,
}

pub(crate) enum CopyRoute {
    /// Both items live on a single server; plain copy.
    Local { src_addr: u64, dst_addr: u64 },
    /// Destination spans servers; one sub-copy per destination server.
    FanOut {
        src: SrcLayout,
        src_copy_start: u64,
        dst_copy_start: u64,
        /// Per destination server, the base address of its share of the
        /// destination item.
        dst_addrs: Vec<u64>,
        dst_server_ids: Vec<u64>,
        dst_interleave: u64,
        services: HashMap<u64, Arc<dyn MemoryService>>,
    },
}

/// Tags own clones of every array they reference; nothing borrowed crosses
/// the async boundary.
pub(crate) struct CopyTag {
    pub(crate) done: AtomicBool,
    pub(crate) err: Mutex<Option<FamError>>,
    pub(crate) nbytes: u64,
    pub(crate) route: CopyRoute,
}

impl CopyTag {
    pub(crate) fn new(nbytes: u64, route: CopyRoute) -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            err: Mutex::new(None),
            nbytes,
            route,
        })
    }
}

pub(crate) struct BackupPart {
    pub server_id: u64,
    pub src_addr: u64,
    pub size: u64,
}

pub(crate) struct BackupTag {
    pub(crate) done: AtomicBool,
    pub(crate) err: Mutex<Option<FamError>>,
    pub(crate) backup_name: String,
    pub(crate) parts: Vec<BackupPart>,
    pub(crate) meta: BackupMeta,
    pub(crate) services: HashMap<u64, Arc<dyn MemoryService>>,
}

pub(crate) struct RestoreTag {
    pub(crate) done: AtomicBool,
    pub(crate) err: Mutex<Option<FamError>>,
    pub(crate) backup_name: String,
    pub(crate) nbytes: u64,
    pub(crate) dst_server_ids: Vec<u64>,
    pub(crate) dst_addrs: Vec<u64>,
    pub(crate) dst_interleave: u64,
    pub(crate) services: HashMap<u64, Arc<dyn MemoryService>>,
}

pub(crate) struct DeleteBackupTag {
    pub(crate) done: AtomicBool,
    pub(crate) err: Mutex<Option<FamError>>,
    pub(crate) backup_name: String,
    pub(crate) service: Arc<dyn MemoryService>,
}

struct Gate {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn complete(&self, done: &AtomicBool) {
        let _guard = self.lock.lock();
        done.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    fn wait(&self, done: &AtomicBool) {
        let mut guard = self.lock.lock();
        while !done.load(Ordering::SeqCst) {
            self.cv.wait(&mut guard);
        }
    }
}

pub(crate) struct AsyncQHandler {
    shared: Arc<EngineShared>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineShared {
    queue: SegQueue<OpInfo>,
    queue_lock: Mutex<()>,
    queue_cv: Condvar,
    run: AtomicBool,
    transport: Arc<FabricTransport>,
    copy_gate: Gate,
    backup_gate: Gate,
    restore_gate: Gate,
    delete_gate: Gate,
}

impl AsyncQHandler {
    pub(crate) fn new(num_consumer: u64, transport: Arc<FabricTransport>) -> FamResult<Self> {
        let shared = Arc::new(EngineShared {
            queue: SegQueue::new(),
            queue_lock: Mutex::new(()),
            queue_cv: Condvar::new(),
            run: AtomicBool::new(true),
            transport,
            copy_gate: Gate::new(),
            backup_gate: Gate::new(),
            restore_gate: Gate::new(),
            delete_gate: Gate::new(),
        });
        let mut consumers = Vec::with_capacity(num_consumer as usize);
        for i in 0..num_consumer {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("fam-async-{}", i))
                .spawn(move || shared.consumer_loop())
                .map_err(|e| {
                    FamError::resource(format!("failed to spawn consumer thread: {}", e))
                })?;
            consumers.push(handle);
        }
        Ok(Self {
            shared,
            consumers: Mutex::new(consumers),
        })
    }

    /// Push an operation and signal a consumer. Never blocks.
    pub(crate) fn initiate_operation(&self, op: OpInfo) {
        match &op.payload {
            OpPayload::Write { ctx, .. } => ctx.inc_write_submitted(),
            OpPayload::Read { ctx, .. } => ctx.inc_read_submitted(),
            _ => {}
        }
        self.shared.queue.push(op);
        let _guard = self.shared.queue_lock.lock();
        self.shared.queue_cv.notify_one();
    }

    pub(crate) fn wait_for_copy(&self, tag: Arc<CopyTag>) -> FamResult<()> {
        self.shared.copy_gate.wait(&tag.done);
        match tag.err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_for_backup(&self, tag: Arc<BackupTag>) -> FamResult<()> {
        self.shared.backup_gate.wait(&tag.done);
        match tag.err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_for_restore(&self, tag: Arc<RestoreTag>) -> FamResult<()> {
        self.shared.restore_gate.wait(&tag.done);
        match tag.err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_for_delete_backup(&self, tag: Arc<DeleteBackupTag>) -> FamResult<()> {
        self.shared.delete_gate.wait(&tag.done);
        match tag.err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn shutdown(&self) {
        if !self.shared.run.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.shared.queue_lock.lock();
            self.shared.queue_cv.notify_all();
        }
        for handle in self.consumers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncQHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    fn consumer_loop(&self) {
        loop {
            while let Some(op) = self.queue.pop() {
                self.decode_and_execute(op);
            }
            let mut guard = self.queue_lock.lock();
            if !self.run.load(Ordering::SeqCst) {
                break;
            }
            if self.queue.is_empty() {
                self.queue_cv.wait(&mut guard);
            }
        }
        // Drain anything that raced with shutdown.
        while let Some(op) = self.queue.pop() {
            self.decode_and_execute(op);
        }
    }

    fn decode_and_execute(&self, op: OpInfo) {
        let bounds = op_bounds(&op);
        match op.payload {
            OpPayload::Write { src, dst_addr, ctx } => {
                self.write_handler(src, dst_addr, ctx, &bounds)
            }
            OpPayload::Read { src_addr, dst, ctx } => {
                self.read_handler(src_addr, dst, ctx, &bounds)
            }
            OpPayload::Copy(tag) => self.copy_handler(tag),
            OpPayload::Backup(tag) => self.backup_handler(tag),
            OpPayload::Restore(tag) => self.restore_handler(tag),
            OpPayload::DeleteBackup(tag) => self.delete_backup_handler(tag),
        }
    }

    fn write_handler(&self, src: Vec<u8>, dst_addr: u64, ctx: Arc<OpsContext>, b: &OpBounds) {
        let error = if b.offset > b.item_size || b.upper_bound > b.item_size {
            Some(FamError::out_of_range("offset or data size is out of bound"))
        } else if !key_allows_write(b.key) {
            Some(FamError::no_perm("not permitted to write into data item"))
        } else {
            self.transport.write(&src, dst_addr);
            self.transport.persist(dst_addr, b.nbytes);
            None
        };
        if error.is_some() {
            tracing::warn!(offset = b.offset, nbytes = b.nbytes, "write op failed");
        }
        ctx.complete_write(error);
    }

    fn read_handler(&self, src_addr: u64, dst: SendPtr, ctx: Arc<OpsContext>, b: &OpBounds) {
        let error = if b.offset > b.item_size || b.upper_bound > b.item_size {
            Some(FamError::out_of_range("offset or data size is out of bound"))
        } else if !key_allows_read(b.key) {
            Some(FamError::no_perm("not permitted to read from data item"))
        } else {
            self.transport.invalidate(src_addr, b.nbytes);
            let out = unsafe { std::slice::from_raw_parts_mut(dst.0, b.nbytes as usize) };
            self.transport.read(src_addr, out);
            None
        };
        if error.is_some() {
            tracing::warn!(offset = b.offset, nbytes = b.nbytes, "read op failed");
        }
        ctx.complete_read(error);
    }

    fn copy_handler(&self, tag: Arc<CopyTag>) {
        if let Err(err) = self.run_copy(&tag) {
            *tag.err.lock() = Some(err);
        }
        self.copy_gate.complete(&tag.done);
    }

    fn run_copy(&self, tag: &CopyTag) -> FamResult<()> {
        match &tag.route {
            CopyRoute::Local { src_addr, dst_addr } => {
                // Ranges may belong to the same item; memmove semantics.
                unsafe {
                    std::ptr::copy(
                        *src_addr as *const u8,
                        *dst_addr as *mut u8,
                        tag.nbytes as usize,
                    );
                }
                self.transport.persist(*dst_addr, tag.nbytes);
                Ok(())
            }
            CopyRoute::FanOut {
                src,
                src_copy_start,
                dst_copy_start,
                dst_addrs,
                dst_server_ids,
                dst_interleave,
                services,
            } => {
                let cnt = dst_addrs.len() as u64;
                let il = if *dst_interleave == 0 {
                    tag.nbytes.max(1)
                } else {
                    *dst_interleave
                };
                let src_copy_end = src_copy_start + tag.nbytes;
                let start_idx = if cnt == 1 { 0 } else { (dst_copy_start / il) % cnt };
                let fam_ptr = if cnt == 1 {
                    *dst_copy_start
                } else {
                    ((dst_copy_start / il) - start_idx) / cnt * il
                };
                let displacement = if cnt == 1 { 0 } else { dst_copy_start % il };

                let mut subs = Vec::with_capacity(cnt as usize);
                let mut cursor = *src_copy_start;
                for i in 0..cnt {
                    let index = ((i + start_idx) % cnt) as usize;
                    let service = services
                        .get(&dst_server_ids[index])
                        .ok_or_else(|| {
                            FamError::new(
                                FamErrorKind::RpcClientNotFound,
                                "memory service not found for destination server",
                            )
                        })?
                        .clone();
                    let additional = if index as u64 == start_idx {
                        displacement
                    } else {
                        0
                    };
                    subs.push((
                        service,
                        SubCopyRequest {
                            src: src.clone(),
                            src_copy_start: cursor,
                            src_copy_end,
                            dst_addr: dst_addrs[index] + fam_ptr + additional,
                            first_chunk_len: il - additional,
                            dst_used_cnt: cnt,
                            dst_interleave: il,
                        },
                    ));
                    cursor += il - additional;
                }
                join_first_error(&subs, |(service, req)| service.copy(req))
            }
        }
    }

    fn backup_handler(&self, tag: Arc<BackupTag>) {
        let result = (|| {
            let services = tag
                .parts
                .iter()
                .map(|part| lookup_service(&tag.services, part.server_id))
                .collect::<FamResult<Vec<_>>>()?;
            let subs: Vec<_> = tag
                .parts
                .iter()
                .zip(services)
                .enumerate()
                .map(|(i, (part, service))| {
                    (
                        service,
                        SubBackupRequest {
                            backup_name: tag.backup_name.clone(),
                            part_index: i,
                            src_addr: part.src_addr,
                            size: part.size,
                            // Exactly one sub-backup writes the catalog entry.
                            write_metadata: i == 0,
                            meta: tag.meta.clone(),
                        },
                    )
                })
                .collect();
            join_first_error(&subs, |(service, req)| service.backup(req))
        })();
        if let Err(err) = result {
            *tag.err.lock() = Some(err);
        }
        self.backup_gate.complete(&tag.done);
    }

    fn restore_handler(&self, tag: Arc<RestoreTag>) {
        let result = (|| {
            let cnt = tag.dst_addrs.len() as u64;
            let subs: Vec<_> = tag
                .dst_server_ids
                .iter()
                .enumerate()
                .map(|(i, &server_id)| {
                    lookup_service(&tag.services, server_id).map(|service| {
                        (
                            service,
                            SubRestoreRequest {
                                backup_name: tag.backup_name.clone(),
                                dst_addr: tag.dst_addrs[i],
                                server_index: i as u64,
                                dst_used_cnt: cnt,
                                dst_interleave: tag.dst_interleave,
                                nbytes: tag.nbytes,
                            },
                        )
                    })
                })
                .collect::<FamResult<Vec<_>>>()?;
            join_first_error(&subs, |(service, req)| service.restore(req))
        })();
        if let Err(err) = result {
            *tag.err.lock() = Some(err);
        }
        self.restore_gate.complete(&tag.done);
    }

    fn delete_backup_handler(&self, tag: Arc<DeleteBackupTag>) {
        if let Err(err) = tag.service.delete_backup(&tag.backup_name) {
            *tag.err.lock() = Some(err);
        }
        self.delete_gate.complete(&tag.done);
    }
}

struct OpBounds {
    nbytes: u64,
    offset: u64,
    upper_bound: u64,
    key: u64,
    item_size: u64,
}

fn op_bounds(op: &OpInfo) -> OpBounds {
    OpBounds {
        nbytes: op.nbytes,
        offset: op.offset,
        upper_bound: op.upper_bound,
        key: op.key,
        item_size: op.item_size,
    }
}

fn lookup_service(
    services: &HashMap<u64, Arc<dyn MemoryService>>,
    server_id: u64,
) -> FamResult<Arc<dyn MemoryService>> {
    services.get(&server_id).cloned().ok_or_else(|| {
        FamError::new(
            FamErrorKind::RpcClientNotFound,
            "memory service not found for server",
        )
    })
}

/// Run one sub-operation per entry concurrently; the first failure wins.
fn join_first_error<T: Sync>(
    subs: &[T],
    f: impl Fn(&T) -> FamResult<()> + Sync,
) -> FamResult<()> {
    let f = &f;
    let mut first_err = None;
    std::thread::scope(|scope| {
        let handles: Vec<_> = subs
            .iter()
            .map(|sub| scope.spawn(move || f(sub)))
            .collect();
        for handle in handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(FamError::new(FamErrorKind::Unknown, "sub-op panicked")));
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    });
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
