//! Wire adapter serving any CIS implementation over TCP.
//!
//! Each connection is one client session; each request is dispatched on the
//! blocking pool so long-running operations (async copy waits, CAS lock
//! acquisition) do not stall the connection, and responses may complete out
//! of order. The integration suite runs the network backend against the
//! direct backend through this adapter.

use crate::cis::wire::{read_frame, write_frame, CisRequest, CisResponse, RequestFrame, ResponseFrame};
use crate::cis::Cis;
use crate::error::{FamError, FamResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub struct CisServer;

impl CisServer {
    /// Bind `bind_addr` and serve on a background thread with its own
    /// runtime. Returns the bound address (use port 0 for an ephemeral one).
    pub fn start(cis: Arc<dyn Cis>, bind_addr: &str) -> FamResult<SocketAddr> {
        let listener = std::net::TcpListener::bind(bind_addr)
            .map_err(|e| FamError::rpc(format!("failed to bind {}: {}", bind_addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| FamError::rpc(format!("failed to configure listener: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| FamError::rpc(format!("failed to read bound address: {}", e)))?;

        std::thread::Builder::new()
            .name("fam-cis-server".to_string())
            .spawn(move || serve_thread(cis, listener))
            .map_err(|e| FamError::rpc(format!("failed to spawn server thread: {}", e)))?;
        tracing::info!(%addr, "CIS wire server listening");
        Ok(addr)
    }
}

fn serve_thread(cis: Arc<dyn Cis>, listener: std::net::TcpListener) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to build server runtime");
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "failed to adopt listener");
                return;
            }
        };
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "client session connected");
                    tokio::spawn(handle_connection(Arc::clone(&cis), stream));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    });
}

async fn handle_connection(cis: Arc<dyn Cis>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    loop {
        let frame: RequestFrame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "malformed request frame");
                break;
            }
        };
        if matches!(frame.body, CisRequest::SessionClose) {
            break;
        }
        let cis = Arc::clone(&cis);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let id = frame.id;
            let body = tokio::task::spawn_blocking(move || dispatch(&*cis, frame.body))
                .await
                .unwrap_or_else(|_| Err(FamError::rpc("request handler panicked")));
            let mut writer = writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &ResponseFrame { id, body }).await {
                tracing::warn!(error = %err, "failed to write response");
            }
        });
    }
    tracing::debug!("client session closed");
}

fn dispatch(cis: &dyn Cis, req: CisRequest) -> Result<CisResponse, FamError> {
    match req {
        CisRequest::SessionOpen { uid, gid } => {
            tracing::debug!(uid, gid, "session open");
            Ok(CisResponse::Done)
        }
        CisRequest::SessionClose => Ok(CisResponse::Done),
        CisRequest::GetNumMemoryServers => {
            cis.get_num_memory_servers().map(CisResponse::Count)
        }
        CisRequest::CreateRegion {
            name,
            nbytes,
            perm,
            attrs,
            uid,
            gid,
        } => cis
            .create_region(&name, nbytes, perm, &attrs, uid, gid)
            .map(CisResponse::Region),
        CisRequest::DestroyRegion {
            region_id,
            memserver_id,
            uid,
            gid,
        } => cis
            .destroy_region(region_id, memserver_id, uid, gid)
            .map(|_| CisResponse::Done),
        CisRequest::ResizeRegion {
            region_id,
            nbytes,
            memserver_id,
            uid,
            gid,
        } => cis
            .resize_region(region_id, nbytes, memserver_id, uid, gid)
            .map(|_| CisResponse::Done),
        CisRequest::Allocate {
            name,
            nbytes,
            perm,
            region_id,
            memserver_id,
            uid,
            gid,
        } => cis
            .allocate(&name, nbytes, perm, region_id, memserver_id, uid, gid)
            .map(CisResponse::Item),
        CisRequest::Deallocate {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        } => cis
            .deallocate(region_id, offset, memserver_id, uid, gid)
            .map(|_| CisResponse::Done),
        CisRequest::ChangeRegionPermission {
            region_id,
            perm,
            memserver_id,
            uid,
            gid,
        } => cis
            .change_region_permission(region_id, perm, memserver_id, uid, gid)
            .map(|_| CisResponse::Done),
        CisRequest::ChangeDataitemPermission {
            region_id,
            offset,
            perm,
            memserver_id,
            uid,
            gid,
        } => cis
            .change_dataitem_permission(region_id, offset, perm, memserver_id, uid, gid)
            .map(|_| CisResponse::Done),
        CisRequest::LookupRegion { name, uid, gid } => {
            cis.lookup_region(&name, uid, gid).map(CisResponse::Region)
        }
        CisRequest::Lookup {
            item_name,
            region_name,
            uid,
            gid,
        } => cis
            .lookup(&item_name, &region_name, uid, gid)
            .map(CisResponse::Item),
        CisRequest::CheckRegionInfo {
            region_id,
            memserver_id,
            uid,
            gid,
        } => cis
            .check_permission_get_region_info(region_id, memserver_id, uid, gid)
            .map(CisResponse::Region),
        CisRequest::CheckItemInfo {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        } => cis
            .check_permission_get_item_info(region_id, offset, memserver_id, uid, gid)
            .map(CisResponse::Item),
        CisRequest::StatInfo {
            region_id,
            offset,
            memserver_id,
            uid,
            gid,
        } => cis
            .get_stat_info(region_id, offset, memserver_id, uid, gid)
            .map(CisResponse::Item),
        CisRequest::OpenRegionWithRegistration { region_id, uid, gid } => cis
            .open_region_with_registration(region_id, uid, gid)
            .map(|(memserver_ids, memory_map)| CisResponse::RegionOpen {
                memserver_ids,
                memory_map,
            }),
        CisRequest::OpenRegionWithoutRegistration { region_id } => cis
            .open_region_without_registration(region_id)
            .map(CisResponse::MemserverIds),
        CisRequest::CloseRegion {
            region_id,
            memserver_ids,
        } => cis
            .close_region(region_id, &memserver_ids)
            .map(|_| CisResponse::Done),
        CisRequest::GetRegionMemory { region_id, uid, gid } => cis
            .get_region_memory(region_id, uid, gid)
            .map(CisResponse::MemoryMap),
        CisRequest::Copy(copy_req) => {
            let wait = cis.copy(&copy_req)?;
            cis.wait_for_copy(wait).map(|_| CisResponse::Done)
        }
        CisRequest::Backup {
            region_id,
            offset,
            memserver_id,
            backup_name,
            uid,
            gid,
        } => {
            let wait = cis.backup(region_id, offset, memserver_id, &backup_name, uid, gid)?;
            cis.wait_for_backup(wait).map(|_| CisResponse::Done)
        }
        CisRequest::Restore {
            region_id,
            offset,
            memserver_id,
            backup_name,
            uid,
            gid,
        } => {
            let wait = cis.restore(region_id, offset, memserver_id, &backup_name, uid, gid)?;
            cis.wait_for_restore(wait).map(|_| CisResponse::Done)
        }
        CisRequest::DeleteBackup {
            backup_name,
            memserver_id,
            uid,
            gid,
        } => {
            let wait = cis.delete_backup(&backup_name, memserver_id, uid, gid)?;
            cis.wait_for_delete_backup(wait).map(|_| CisResponse::Done)
        }
        CisRequest::ListBackup {
            backup_name,
            memserver_id,
            uid,
            gid,
        } => cis
            .list_backup(&backup_name, memserver_id, uid, gid)
            .map(CisResponse::Text),
        CisRequest::GetBackupInfo {
            backup_name,
            memserver_id,
            uid,
            gid,
        } => cis
            .get_backup_info(&backup_name, memserver_id, uid, gid)
            .map(CisResponse::Backup),
        CisRequest::AcquireCasLock {
            offset,
            memserver_id,
        } => cis
            .acquire_cas_lock(offset, memserver_id)
            .map(|_| CisResponse::Done),
        CisRequest::ReleaseCasLock {
            offset,
            memserver_id,
        } => cis
            .release_cas_lock(offset, memserver_id)
            .map(|_| CisResponse::Done),
        CisRequest::GetAddrSize { memserver_id } => {
            cis.get_addr_size(memserver_id).map(CisResponse::Count)
        }
        CisRequest::GetAddr { memserver_id } => cis.get_addr(memserver_id).map(CisResponse::Bytes),
        CisRequest::GetMemserverInfo => cis.get_memserverinfo().map(CisResponse::MemserverInfo),
    }
}
