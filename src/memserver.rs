//! Per-memory-server data services.
//!
//! The async engine fans cross-server copies, backups and restores out to
//! one `MemoryService` per involved server. The in-process implementation
//! works directly on registered pool addresses and keeps backups as
//! per-server part files next to a JSON catalog entry.

use crate::error::{FamError, FamErrorKind, FamResult};
use crate::transport::key_allows_read;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Interleave layout of a source data item, enough to resolve any linear
/// byte range to per-server addresses.
#[derive(Clone, Debug)]
pub(crate) struct SrcLayout {
    pub bases: Vec<u64>,
    pub keys: Vec<u64>,
    pub used_cnt: u64,
    pub interleave: u64,
}

/// One destination server's share of a cross-server copy.
#[derive(Clone, Debug)]
pub(crate) struct SubCopyRequest {
    pub src: SrcLayout,
    /// Linear position in the source item of the first byte this server
    /// copies.
    pub src_copy_start: u64,
    /// Linear end of the whole copy in the source item.
    pub src_copy_end: u64,
    /// Address of the first byte this server writes.
    pub dst_addr: u64,
    /// Length of the first (possibly partial) destination chunk.
    pub first_chunk_len: u64,
    pub dst_used_cnt: u64,
    pub dst_interleave: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct SubBackupRequest {
    pub backup_name: String,
    pub part_index: usize,
    pub src_addr: u64,
    pub size: u64,
    pub write_metadata: bool,
    pub meta: BackupMeta,
}

#[derive(Clone, Debug)]
pub(crate) struct SubRestoreRequest {
    pub backup_name: String,
    /// Base address of this server's share of the destination item.
    pub dst_addr: u64,
    pub server_index: u64,
    pub dst_used_cnt: u64,
    pub dst_interleave: u64,
    pub nbytes: u64,
}

/// Catalog entry written once per backup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct BackupMeta {
    pub backup_name: String,
    pub item_name: String,
    pub item_size: u64,
    pub used_cnt: u64,
    pub interleave_size: u64,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_epoch_secs: u64,
}

/// Data-plane contract of one memory server.
pub(crate) trait MemoryService: Send + Sync {
    fn copy(&self, req: &SubCopyRequest) -> FamResult<()>;
    fn backup(&self, req: &SubBackupRequest) -> FamResult<()>;
    fn restore(&self, req: &SubRestoreRequest) -> FamResult<()>;
    fn delete_backup(&self, backup_name: &str) -> FamResult<()>;
}

/// In-process service over registered shared memory.
pub(crate) struct ShmMemoryService {
    server_id: u64,
    backup_dir: PathBuf,
}

impl ShmMemoryService {
    pub(crate) fn new(server_id: u64, backup_dir: PathBuf) -> Self {
        Self {
            server_id,
            backup_dir,
        }
    }
}

impl MemoryService for ShmMemoryService {
    fn copy(&self, req: &SubCopyRequest) -> FamResult<()> {
        tracing::debug!(
            server = self.server_id,
            start = req.src_copy_start,
            end = req.src_copy_end,
            "sub-copy"
        );
        let il = effective_interleave(req.dst_interleave, req.src_copy_end);
        let stride_skip = (req.dst_used_cnt.saturating_sub(1)) * il;

        let mut src_pos = req.src_copy_start;
        let mut dst_addr = req.dst_addr;
        let mut chunk_len = req.first_chunk_len.min(il);
        while src_pos < req.src_copy_end {
            let len = chunk_len.min(req.src_copy_end - src_pos);
            if len == 0 {
                break;
            }
            let mut buf = vec![0u8; len as usize];
            read_linear(&req.src, src_pos, &mut buf)?;
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), dst_addr as *mut u8, buf.len());
            }
            src_pos += len + stride_skip;
            dst_addr += len;
            chunk_len = il;
        }
        Ok(())
    }

    fn backup(&self, req: &SubBackupRequest) -> FamResult<()> {
        fs::create_dir_all(&self.backup_dir).map_err(io_err)?;
        let part = part_path(&self.backup_dir, &req.backup_name, req.part_index);
        let data =
            unsafe { std::slice::from_raw_parts(req.src_addr as *const u8, req.size as usize) };
        fs::write(&part, data).map_err(io_err)?;
        if req.write_metadata {
            let meta = serde_json::to_vec_pretty(&req.meta)
                .map_err(|e| FamError::resource(format!("failed to encode backup meta: {}", e)))?;
            fs::write(meta_path(&self.backup_dir, &req.backup_name), meta).map_err(io_err)?;
        }
        tracing::debug!(
            server = self.server_id,
            backup = %req.backup_name,
            part = req.part_index,
            size = req.size,
            "backup part written"
        );
        Ok(())
    }

    fn restore(&self, req: &SubRestoreRequest) -> FamResult<()> {
        let meta = load_backup_meta(&self.backup_dir, &req.backup_name)?;
        let il = effective_interleave(req.dst_interleave, req.nbytes);
        let cnt = req.dst_used_cnt.max(1);

        let mut chunk = req.server_index;
        while chunk * il < req.nbytes {
            let start = chunk * il;
            let len = il.min(req.nbytes - start);
            let mut buf = vec![0u8; len as usize];
            read_backup_range(&self.backup_dir, &meta, start, &mut buf)?;
            let local = (chunk / cnt) * il;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    (req.dst_addr + local) as *mut u8,
                    buf.len(),
                );
            }
            chunk += cnt;
        }
        Ok(())
    }

    fn delete_backup(&self, backup_name: &str) -> FamResult<()> {
        let meta = load_backup_meta(&self.backup_dir, backup_name)?;
        for part_index in 0..meta.used_cnt as usize {
            let part = part_path(&self.backup_dir, backup_name, part_index);
            if part.exists() {
                fs::remove_file(part).map_err(io_err)?;
            }
        }
        fs::remove_file(meta_path(&self.backup_dir, backup_name)).map_err(io_err)?;
        tracing::debug!(server = self.server_id, backup = %backup_name, "backup deleted");
        Ok(())
    }
}

/// Gather a linear `[start, start + buf.len())` range of an interleaved item
/// into `buf`, validating the read key of every touched server.
pub(crate) fn read_linear(src: &SrcLayout, start: u64, buf: &mut [u8]) -> FamResult<()> {
    let cnt = src.used_cnt.max(1);
    let il = effective_interleave(src.interleave, start + buf.len() as u64);

    let mut off = start;
    let mut local = 0usize;
    let mut remaining = buf.len() as u64;
    while remaining > 0 {
        let block = off / il;
        let within = off % il;
        let server_index = (block % cnt) as usize;
        let len = remaining.min(il - within);
        if !key_allows_read(src.keys[server_index]) {
            return Err(FamError::no_perm("not permitted to read from data item"));
        }
        let addr = src.bases[server_index] + (block / cnt) * il + within;
        unsafe {
            std::ptr::copy_nonoverlapping(
                addr as *const u8,
                buf[local..local + len as usize].as_mut_ptr(),
                len as usize,
            );
        }
        off += len;
        local += len as usize;
        remaining -= len;
    }
    Ok(())
}

/// Read a linear range of a backed-up item from its part files.
fn read_backup_range(dir: &Path, meta: &BackupMeta, start: u64, buf: &mut [u8]) -> FamResult<()> {
    let cnt = meta.used_cnt.max(1);
    let il = effective_interleave(meta.interleave_size, meta.item_size);

    let mut off = start;
    let mut local = 0usize;
    let mut remaining = buf.len() as u64;
    while remaining > 0 {
        let block = off / il;
        let within = off % il;
        let part_index = (block % cnt) as usize;
        let part_off = (block / cnt) * il + within;
        let len = remaining.min(il - within);

        let mut file = fs::File::open(part_path(dir, &meta.backup_name, part_index))
            .map_err(io_err)?;
        file.seek(SeekFrom::Start(part_off)).map_err(io_err)?;
        file.read_exact(&mut buf[local..local + len as usize])
            .map_err(io_err)?;

        off += len;
        local += len as usize;
        remaining -= len;
    }
    Ok(())
}

fn effective_interleave(interleave: u64, total: u64) -> u64 {
    if interleave == 0 {
        total.max(1)
    } else {
        interleave
    }
}

pub(crate) fn meta_path(dir: &Path, backup_name: &str) -> PathBuf {
    dir.join(format!("{}.meta.json", backup_name))
}

pub(crate) fn part_path(dir: &Path, backup_name: &str, part_index: usize) -> PathBuf {
    dir.join(format!("{}.part{}", backup_name, part_index))
}

pub(crate) fn backup_exists(dir: &Path, backup_name: &str) -> bool {
    meta_path(dir, backup_name).exists()
}

pub(crate) fn load_backup_meta(dir: &Path, backup_name: &str) -> FamResult<BackupMeta> {
    let path = meta_path(dir, backup_name);
    let contents = fs::read(&path)
        .map_err(|_| FamError::not_found(format!("backup {} not found", backup_name)))?;
    serde_json::from_slice(&contents)
        .map_err(|e| FamError::resource(format!("corrupt backup catalog entry: {}", e)))
}

pub(crate) fn list_backup_names(dir: &Path) -> FamResult<Vec<String>> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(names),
    };
    for entry in entries {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stripped) = name.strip_suffix(".meta.json") {
            names.push(stripped.to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub(crate) fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn io_err(e: std::io::Error) -> FamError {
    FamError::new(FamErrorKind::Resource, format!("backup I/O failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FAM_KEY_READ, FAM_KEY_WRITE};

    fn layout_over(bufs: &[&mut [u8]], interleave: u64) -> SrcLayout {
        SrcLayout {
            bases: bufs.iter().map(|b| b.as_ptr() as u64).collect(),
            keys: vec![FAM_KEY_READ | FAM_KEY_WRITE; bufs.len()],
            used_cnt: bufs.len() as u64,
            interleave,
        }
    }

    #[test]
    fn read_linear_reassembles_interleaved_data() {
        // Two servers, 4-byte chunks. Linear content: chunks alternate.
        let mut s0 = *b"AAAACCCC";
        let mut s1 = *b"BBBBDDDD";
        let src = layout_over(&[&mut s0[..], &mut s1[..]], 4);

        let mut out = vec![0u8; 16];
        read_linear(&src, 0, &mut out).unwrap();
        assert_eq!(&out, b"AAAABBBBCCCCDDDD");

        let mut out = vec![0u8; 6];
        read_linear(&src, 3, &mut out).unwrap();
        assert_eq!(&out, b"ABBBBC");
    }

    #[test]
    fn read_linear_rejects_unreadable_key() {
        let mut s0 = *b"AAAA";
        let mut src = layout_over(&[&mut s0[..]], 4);
        src.keys[0] = FAM_KEY_WRITE;
        let mut out = vec![0u8; 4];
        let err = read_linear(&src, 0, &mut out).unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::NoPerm);
    }

    #[test]
    fn sub_copy_writes_this_servers_chunks_contiguously() {
        // Source: one server holding 16 linear bytes; destination view:
        // two servers with 4-byte chunks, this service is dest server 0.
        let mut src_buf = *b"0123456789abcdef";
        let src = layout_over(&[&mut src_buf[..]], 16);
        let mut dst_buf = vec![0u8; 8];

        let service = ShmMemoryService::new(0, std::env::temp_dir());
        service
            .copy(&SubCopyRequest {
                src,
                src_copy_start: 0,
                src_copy_end: 16,
                dst_addr: dst_buf.as_mut_ptr() as u64,
                first_chunk_len: 4,
                dst_used_cnt: 2,
                dst_interleave: 4,
            })
            .unwrap();
        // Server 0 receives linear chunks 0 and 2.
        assert_eq!(&dst_buf, b"012389ab");
    }
}
