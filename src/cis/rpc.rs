//! Network CIS backend.
//!
//! A thin stub over a TCP connection to the central allocator: requests are
//! length-delimited bincode frames, a background reader task routes
//! responses back to callers through a request-id-keyed pending map. The
//! asynchronous `copy`/`backup`/`restore` family returns a wait object
//! backed by the pending response; `wait_for_*` blocks until it arrives and
//! propagates any server-reported error. A session hello/goodbye brackets
//! the connection.

use crate::cis::wire::{read_frame, write_frame, CisRequest, CisResponse, RequestFrame, ResponseFrame};
use crate::cis::{
    wrong_wait_object, BackupInfo, Cis, CisCopyRequest, CisWaitObject, ItemInfo, MemServerInfo,
    RegionInfo, RegionMemoryMap, RpcResponseReceiver, WaitObjInner,
};
use crate::descriptor::RegionAttributes;
use crate::error::{FamError, FamResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<CisResponse, FamError>>>>;

pub struct RpcCis {
    runtime: tokio::runtime::Runtime,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_request_id: AtomicU64,
}

impl RpcCis {
    pub fn connect(server: &str, port: u16, uid: u32, gid: u32) -> FamResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| FamError::rpc(format!("failed to build RPC runtime: {}", e)))?;
        let addr = format!("{}:{}", server, port);
        let stream = runtime
            .block_on(TcpStream::connect(&addr))
            .map_err(|e| FamError::rpc(format!("failed to connect to CIS at {}: {}", addr, e)))?;
        let (reader, writer) = stream.into_split();

        let pending: PendingMap = Arc::new(DashMap::new());
        runtime.spawn(response_reader(reader, Arc::clone(&pending)));

        let cis = Self {
            runtime,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_request_id: AtomicU64::new(1),
        };
        cis.call(CisRequest::SessionOpen { uid, gid })?;
        tracing::info!(%addr, "CIS session established");
        Ok(cis)
    }

    fn register(&self) -> (u64, RpcResponseReceiver) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Send a request without waiting for the response; the receiver becomes
    /// the wait object of the asynchronous control-plane calls.
    fn submit(&self, body: CisRequest) -> FamResult<RpcResponseReceiver> {
        let (id, rx) = self.register();
        let result = self.runtime.block_on(async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &RequestFrame { id, body }).await
        });
        if let Err(err) = result {
            self.pending.remove(&id);
            return Err(err);
        }
        Ok(rx)
    }

    fn call(&self, body: CisRequest) -> FamResult<CisResponse> {
        let rx = self.submit(body)?;
        self.wait(rx)
    }

    fn wait(&self, rx: RpcResponseReceiver) -> FamResult<CisResponse> {
        self.runtime
            .block_on(rx)
            .unwrap_or_else(|_| Err(FamError::rpc("CIS connection closed")))
    }

    fn wait_done(&self, wait: CisWaitObject) -> FamResult<()> {
        match wait.inner {
            WaitObjInner::Rpc(rx) => self.wait(rx).and_then(expect_done),
            _ => Err(wrong_wait_object()),
        }
    }
}

async fn response_reader(mut reader: OwnedReadHalf, pending: PendingMap) {
    loop {
        match read_frame::<ResponseFrame, _>(&mut reader).await {
            Ok(Some(frame)) => {
                if let Some((_, tx)) = pending.remove(&frame.id) {
                    let _ = tx.send(frame.body);
                } else {
                    tracing::warn!(id = frame.id, "response for unknown request");
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "CIS connection failed");
                break;
            }
        }
    }
    // Fail everything still in flight so callers unblock.
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(FamError::rpc("CIS connection closed")));
        }
    }
}

impl Drop for RpcCis {
    fn drop(&mut self) {
        // Best-effort session teardown; the server also cleans up on EOF.
        let (id, _rx) = self.register();
        let _ = self.runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_millis(200), async {
                let mut writer = self.writer.lock().await;
                write_frame(
                    &mut *writer,
                    &RequestFrame {
                        id,
                        body: CisRequest::SessionClose,
                    },
                )
                .await
            })
            .await
        });
    }
}

fn unexpected() -> FamError {
    FamError::rpc("unexpected CIS response variant")
}

fn expect_done(resp: CisResponse) -> FamResult<()> {
    match resp {
        CisResponse::Done => Ok(()),
        _ => Err(unexpected()),
    }
}

fn expect_count(resp: CisResponse) -> FamResult<u64> {
    match resp {
        CisResponse::Count(n) => Ok(n),
        _ => Err(unexpected()),
    }
}

fn expect_region(resp: CisResponse) -> FamResult<RegionInfo> {
    match resp {
        CisResponse::Region(info) => Ok(info),
        _ => Err(unexpected()),
    }
}

fn expect_item(resp: CisResponse) -> FamResult<ItemInfo> {
    match resp {
        CisResponse::Item(info) => Ok(info),
        _ => Err(unexpected()),
    }
}

impl Cis for RpcCis {
    fn get_num_memory_servers(&self) -> FamResult<u64> {
        self.call(CisRequest::GetNumMemoryServers)
            .and_then(expect_count)
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
        self.call(CisRequest::CreateRegion {
            name: name.to_string(),
            nbytes,
            perm,
            attrs: *attrs,
            uid,
            gid,
        })
        .and_then(expect_region)
    }

    fn destroy_region(
        &self,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        self.call(CisRequest::DestroyRegion {
            region_id,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_done)
    }

    fn resize_region(
        &self,
        region_id: u64,
        nbytes: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        self.call(CisRequest::ResizeRegion {
            region_id,
            nbytes,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_done)
    }

    fn allocate(
        &self,
        name: &str,
        nbytes: u64,
        perm: u32,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        self.call(CisRequest::Allocate {
            name: name.to_string(),
            nbytes,
            perm,
            region_id,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_item)
    }

    fn deallocate(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        self.call(CisRequest::Deallocate {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_done)
    }

    fn change_region_permission(
        &self,
        region_id: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        self.call(CisRequest::ChangeRegionPermission {
            region_id,
            perm,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_done)
    }

    fn change_dataitem_permission(
        &self,
        region_id: u64,
        offset: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        self.call(CisRequest::ChangeDataitemPermission {
            region_id,
            offset,
            perm,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_done)
    }

    fn lookup_region(&self, name: &str, uid: u32, gid: u32) -> FamResult<RegionInfo> {
        self.call(CisRequest::LookupRegion {
            name: name.to_string(),
            uid,
            gid,
        })
        .and_then(expect_region)
    }

    fn lookup(
        &self,
        item_name: &str,
        region_name: &str,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        self.call(CisRequest::Lookup {
            item_name: item_name.to_string(),
            region_name: region_name.to_string(),
            uid,
            gid,
        })
        .and_then(expect_item)
    }

    fn check_permission_get_region_info(
        &self,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<RegionInfo> {
        self.call(CisRequest::CheckRegionInfo {
            region_id,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_region)
    }

    fn check_permission_get_item_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        self.call(CisRequest::CheckItemInfo {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_item)
    }

    fn get_stat_info(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<ItemInfo> {
        self.call(CisRequest::StatInfo {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        })
        .and_then(expect_item)
    }

    fn open_region_with_registration(
        &self,
        region_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<(Vec<u64>, RegionMemoryMap)> {
        match self.call(CisRequest::OpenRegionWithRegistration { region_id, uid, gid })? {
            CisResponse::RegionOpen {
                memserver_ids,
                memory_map,
            } => Ok((memserver_ids, memory_map)),
            _ => Err(unexpected()),
        }
    }

    fn open_region_without_registration(&self, region_id: u64) -> FamResult<Vec<u64>> {
        match self.call(CisRequest::OpenRegionWithoutRegistration { region_id })? {
            CisResponse::MemserverIds(ids) => Ok(ids),
            _ => Err(unexpected()),
        }
    }

    fn close_region(&self, region_id: u64, memserver_ids: &[u64]) -> FamResult<()> {
        self.call(CisRequest::CloseRegion {
            region_id,
            memserver_ids: memserver_ids.to_vec(),
        })
        .and_then(expect_done)
    }

    fn get_region_memory(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<RegionMemoryMap> {
        match self.call(CisRequest::GetRegionMemory { region_id, uid, gid })? {
            CisResponse::MemoryMap(map) => Ok(map),
            _ => Err(unexpected()),
        }
    }

    fn copy(&self, req: &CisCopyRequest) -> FamResult<CisWaitObject> {
        let rx = self.submit(CisRequest::Copy(req.clone()))?;
        Ok(CisWaitObject::new(WaitObjInner::Rpc(rx)))
    }

    fn wait_for_copy(&self, wait: CisWaitObject) -> FamResult<()> {
        self.wait_done(wait)
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
        let rx = self.submit(CisRequest::Backup {
            region_id,
            offset,
            memserver_id,
            backup_name: backup_name.to_string(),
            uid,
            gid,
        })?;
        Ok(CisWaitObject::new(WaitObjInner::Rpc(rx)))
    }

    fn wait_for_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        self.wait_done(wait)
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
        let rx = self.submit(CisRequest::Restore {
            region_id,
            offset,
            memserver_id,
            backup_name: backup_name.to_string(),
            uid,
            gid,
        })?;
        Ok(CisWaitObject::new(WaitObjInner::Rpc(rx)))
    }

    fn wait_for_restore(&self, wait: CisWaitObject) -> FamResult<()> {
        self.wait_done(wait)
    }

    fn delete_backup(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<CisWaitObject> {
        let rx = self.submit(CisRequest::DeleteBackup {
            backup_name: backup_name.to_string(),
            memserver_id,
            uid,
            gid,
        })?;
        Ok(CisWaitObject::new(WaitObjInner::Rpc(rx)))
    }

    fn wait_for_delete_backup(&self, wait: CisWaitObject) -> FamResult<()> {
        self.wait_done(wait)
    }

    fn list_backup(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<String> {
        match self.call(CisRequest::ListBackup {
            backup_name: backup_name.to_string(),
            memserver_id,
            uid,
            gid,
        })? {
            CisResponse::Text(text) => Ok(text),
            _ => Err(unexpected()),
        }
    }

    fn get_backup_info(
        &self,
        backup_name: &str,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<BackupInfo> {
        match self.call(CisRequest::GetBackupInfo {
            backup_name: backup_name.to_string(),
            memserver_id,
            uid,
            gid,
        })? {
            CisResponse::Backup(info) => Ok(info),
            _ => Err(unexpected()),
        }
    }

    fn acquire_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        self.call(CisRequest::AcquireCasLock {
            offset,
            memserver_id,
        })
        .and_then(expect_done)
    }

    fn release_cas_lock(&self, offset: u64, memserver_id: u64) -> FamResult<()> {
        self.call(CisRequest::ReleaseCasLock {
            offset,
            memserver_id,
        })
        .and_then(expect_done)
    }

    fn get_addr_size(&self, memserver_id: u64) -> FamResult<u64> {
        self.call(CisRequest::GetAddrSize { memserver_id })
            .and_then(expect_count)
    }

    fn get_addr(&self, memserver_id: u64) -> FamResult<Vec<u8>> {
        match self.call(CisRequest::GetAddr { memserver_id })? {
            CisResponse::Bytes(addr) => Ok(addr),
            _ => Err(unexpected()),
        }
    }

    fn get_memserverinfo_size(&self) -> FamResult<u64> {
        bincode::serialized_size(&self.get_memserverinfo()?)
            .map_err(|e| FamError::rpc(format!("failed to size memserver info: {}", e)))
    }

    fn get_memserverinfo(&self) -> FamResult<Vec<MemServerInfo>> {
        match self.call(CisRequest::GetMemserverInfo)? {
            CisResponse::MemserverInfo(info) => Ok(info),
            _ => Err(unexpected()),
        }
    }
}
