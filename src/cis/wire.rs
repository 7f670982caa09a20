//! Wire format shared by the network CIS backend and its server adapter.
//!
//! Frames are a big-endian `u32` length prefix followed by a bincode-encoded
//! message. Requests and responses carry a client-chosen id so responses may
//! arrive out of order; the async `copy`/`backup` family relies on that.

use crate::cis::{BackupInfo, CisCopyRequest, ItemInfo, MemServerInfo, RegionInfo, RegionMemoryMap};
use crate::descriptor::RegionAttributes;
use crate::error::{FamError, FamResult};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestFrame {
    pub id: u64,
    pub body: CisRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResponseFrame {
    pub id: u64,
    pub body: Result<CisResponse, FamError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum CisRequest {
    SessionOpen {
        uid: u32,
        gid: u32,
    },
    SessionClose,
    GetNumMemoryServers,
    CreateRegion {
        name: String,
        nbytes: u64,
        perm: u32,
        attrs: RegionAttributes,
        uid: u32,
        gid: u32,
    },
    DestroyRegion {
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    ResizeRegion {
        region_id: u64,
        nbytes: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    Allocate {
        name: String,
        nbytes: u64,
        perm: u32,
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    Deallocate {
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    ChangeRegionPermission {
        region_id: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    ChangeDataitemPermission {
        region_id: u64,
        offset: u64,
        perm: u32,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    LookupRegion {
        name: String,
        uid: u32,
        gid: u32,
    },
    Lookup {
        item_name: String,
        region_name: String,
        uid: u32,
        gid: u32,
    },
    CheckRegionInfo {
        region_id: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    CheckItemInfo {
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    StatInfo {
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    OpenRegionWithRegistration {
        region_id: u64,
        uid: u32,
        gid: u32,
    },
    OpenRegionWithoutRegistration {
        region_id: u64,
    },
    CloseRegion {
        region_id: u64,
        memserver_ids: Vec<u64>,
    },
    GetRegionMemory {
        region_id: u64,
        uid: u32,
        gid: u32,
    },
    Copy(CisCopyRequest),
    Backup {
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: String,
        uid: u32,
        gid: u32,
    },
    Restore {
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        backup_name: String,
        uid: u32,
        gid: u32,
    },
    DeleteBackup {
        backup_name: String,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    ListBackup {
        backup_name: String,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    GetBackupInfo {
        backup_name: String,
        memserver_id: u64,
        uid: u32,
        gid: u32,
    },
    AcquireCasLock {
        offset: u64,
        memserver_id: u64,
    },
    ReleaseCasLock {
        offset: u64,
        memserver_id: u64,
    },
    GetAddrSize {
        memserver_id: u64,
    },
    GetAddr {
        memserver_id: u64,
    },
    GetMemserverInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum CisResponse {
    Done,
    Count(u64),
    Region(RegionInfo),
    Item(ItemInfo),
    RegionOpen {
        memserver_ids: Vec<u64>,
        memory_map: RegionMemoryMap,
    },
    MemserverIds(Vec<u64>),
    MemoryMap(RegionMemoryMap),
    Bytes(Vec<u8>),
    Text(String),
    Backup(BackupInfo),
    MemserverInfo(Vec<MemServerInfo>),
}

pub(crate) async fn write_frame<T, W>(writer: &mut W, message: &T) -> FamResult<()>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let body = bincode::serialize(message)
        .map_err(|e| FamError::rpc(format!("failed to encode frame: {}", e)))?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(FamError::rpc("frame exceeds maximum size"));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| FamError::rpc(format!("failed to write frame: {}", e)))
}

/// Returns `Ok(None)` on clean EOF at a frame boundary.
pub(crate) async fn read_frame<T, R>(reader: &mut R) -> FamResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FamError::rpc(format!("failed to read frame: {}", e))),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(FamError::rpc("incoming frame exceeds maximum size"));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FamError::rpc(format!("failed to read frame body: {}", e)))?;
    let message = bincode::deserialize(&body)
        .map_err(|e| FamError::rpc(format!("failed to decode frame: {}", e)))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = RequestFrame {
            id: 7,
            body: CisRequest::LookupRegion {
                name: "scratch".into(),
                uid: 10,
                gid: 20,
            },
        };
        write_frame(&mut a, &frame).await.unwrap();
        let decoded: RequestFrame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded.id, 7);
        match decoded.body {
            CisRequest::LookupRegion { name, uid, gid } => {
                assert_eq!(name, "scratch");
                assert_eq!((uid, gid), (10, 20));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<RequestFrame> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }
}
