//! Resumable chunked file transfer with bandwidth quotas.
//!
//! A transfer moves a [`FileManifest`] (ordered files with sizes and
//! relative paths) in fixed-size chunks. Uploads survive connection loss:
//! the server keeps per-upload-id progress, and a resumed `BeginUpload`
//! returns the offset to continue from. Disk work never runs on the
//! session task; it is queued to a small worker pool over a channel.
//!
//! Bandwidth is governed per [`BandwidthQuota`]: the quota's byte rate is
//! divided across the transfers sharing it, and the allowed rate returns
//! in every reply so the peer paces itself over the transfer window.
//! Downloads are additionally paced server-side by withholding chunks for
//! the rest of the window once the allowance is spent.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::protocol::method_ids;
use crate::service::now_ms;
use crate::transport::CancelHandle;

/// One file inside a manifest; `path` is relative to the transfer root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

/// The ordered file list of one logical transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifest {
    pub files: Vec<FileInfo>,
}

impl FileManifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// A contiguous run of bytes of one manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// A position inside a manifest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChunkPos {
    pub file_index: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginUploadRequest {
    pub manifest: FileManifest,
    pub first_chunks: Vec<FileChunk>,
    pub session_local_id: u32,
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginUploadReply {
    pub start: FileChunkPos,
    pub max_message_len: u32,
    pub upload_id: String,
    pub bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunksRequest {
    pub chunks: Vec<FileChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunksReply {
    pub bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginDownloadRequest {
    pub path: String,
    pub chunk_len: u32,
    pub session_local_id: u32,
    pub server_download_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginDownloadReply {
    pub manifest: FileManifest,
    pub first_chunks: Vec<FileChunk>,
    pub max_message_len: u32,
    pub bps: u32,
    pub download_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadChunksRequest {
    pub chunk_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadChunksReply {
    pub chunks: Vec<FileChunk>,
    pub advise_wait_ms: u32,
    pub bps: u32,
}

/// Shared byte-rate allowance. The rate divides evenly across the
/// transfers currently holding a slot; zero means unlimited.
pub struct BandwidthQuota {
    bps: u32,
    users: AtomicU32,
}

impl BandwidthQuota {
    pub fn new(bps: u32) -> Arc<Self> {
        Arc::new(BandwidthQuota {
            bps,
            users: AtomicU32::new(0),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> QuotaSlot {
        self.users.fetch_add(1, Ordering::AcqRel);
        QuotaSlot {
            quota: Arc::clone(self),
        }
    }

    /// Per-transfer allowance in bytes per second; zero means unlimited.
    pub fn allowed_bps(&self) -> u32 {
        if self.bps == 0 {
            return 0;
        }
        let users = self.users.load(Ordering::Acquire).max(1);
        self.bps / users
    }
}

/// Holds one slot of a quota; releasing is dropping.
pub struct QuotaSlot {
    quota: Arc<BandwidthQuota>,
}

impl QuotaSlot {
    pub fn allowed_bps(&self) -> u32 {
        self.quota.allowed_bps()
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        self.quota.users.fetch_sub(1, Ordering::AcqRel);
    }
}

enum FileIoRequest {
    Append {
        path: PathBuf,
        truncate_first: bool,
        data: Vec<u8>,
        done: oneshot::Sender<std::io::Result<()>>,
    },
    ReadAt {
        path: PathBuf,
        offset: u64,
        len: usize,
        done: oneshot::Sender<std::io::Result<Vec<u8>>>,
    },
}

/// Worker pool that keeps disk I/O off the session tasks. Requests queue
/// over a channel to plain threads; completions come back on oneshots.
#[derive(Clone)]
pub struct FileIoPool {
    tx: crossbeam::channel::Sender<FileIoRequest>,
}

impl FileIoPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<FileIoRequest>();
        for n in 0..workers.max(1) {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("file-io-{n}"))
                .spawn(move || {
                    while let Ok(request) = rx.recv() {
                        Self::serve(request);
                    }
                })
                .expect("spawning file io worker");
        }
        FileIoPool { tx }
    }

    fn serve(request: FileIoRequest) {
        match request {
            FileIoRequest::Append {
                path,
                truncate_first,
                data,
                done,
            } => {
                let result = (|| {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(!truncate_first)
                        .write(true)
                        .truncate(truncate_first)
                        .open(&path)?;
                    if truncate_first {
                        file.seek(SeekFrom::End(0))?;
                    }
                    file.write_all(&data)?;
                    Ok(())
                })();
                let _ = done.send(result);
            }
            FileIoRequest::ReadAt {
                path,
                offset,
                len,
                done,
            } => {
                let result = (|| {
                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let mut buf = vec![0u8; len];
                    let mut read = 0;
                    while read < len {
                        let n = file.read(&mut buf[read..])?;
                        if n == 0 {
                            break;
                        }
                        read += n;
                    }
                    buf.truncate(read);
                    Ok(buf)
                })();
                let _ = done.send(result);
            }
        }
    }

    async fn append(&self, path: PathBuf, truncate_first: bool, data: Vec<u8>) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(FileIoRequest::Append {
                path,
                truncate_first,
                data,
                done,
            })
            .map_err(|_| Error::resource("file io pool is shut down"))?;
        wait.await
            .map_err(|_| Error::resource("file io worker dropped the request"))?
            .map_err(Error::from)
    }

    async fn read_at(&self, path: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(FileIoRequest::ReadAt {
                path,
                offset,
                len,
                done,
            })
            .map_err(|_| Error::resource("file io pool is shut down"))?;
        wait.await
            .map_err(|_| Error::resource("file io worker dropped the request"))?
            .map_err(Error::from)
    }
}

/// Rejects absolute paths and parent traversal in manifest paths.
fn sanitize_relative(path: &str) -> Result<PathBuf> {
    let rel = Path::new(path);
    if path.is_empty() || rel.is_absolute() {
        return Err(Error::resource(format!("illegal transfer path: {path}")));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::resource(format!("illegal transfer path: {path}"))),
        }
    }
    Ok(rel.to_path_buf())
}

struct UploadState {
    manifest: FileManifest,
    root: PathBuf,
    current_file: u32,
    current_pos: u64,
    completed: bool,
    last_activity_ms: u64,
    _quota: QuotaSlot,
}

impl UploadState {
    fn position(&self) -> FileChunkPos {
        FileChunkPos {
            file_index: self.current_file,
            offset: self.current_pos,
        }
    }
}

/// Per-session download progress, owned by the session.
pub struct DownloadState {
    manifest: FileManifest,
    root: PathBuf,
    download_id: String,
    current_file: u32,
    current_pos: u64,
    window_start_ms: u64,
    window_bytes: u64,
    quota: QuotaSlot,
}

/// The transfer slots of one session.
#[derive(Default)]
pub struct SessionTransfers {
    pub upload_id: Option<String>,
    pub download: Option<DownloadState>,
}

struct FtInner {
    runtime: Runtime,
    uploads: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UploadState>>>>,
    upload_quota: Arc<BandwidthQuota>,
    download_quota: Arc<BandwidthQuota>,
    io: FileIoPool,
}

/// Server-side file transfer service.
#[derive(Clone)]
pub struct FileTransferService {
    inner: Arc<FtInner>,
}

impl FileTransferService {
    pub fn new(runtime: Runtime) -> Self {
        let upload_bps = runtime.config().upload_quota_bps;
        let download_bps = runtime.config().download_quota_bps;
        FileTransferService {
            inner: Arc::new(FtInner {
                upload_quota: BandwidthQuota::new(upload_bps),
                download_quota: BandwidthQuota::new(download_bps),
                io: FileIoPool::new(2),
                uploads: Mutex::new(HashMap::new()),
                runtime,
            }),
        }
    }

    fn max_message_len(&self) -> u32 {
        let max = self.inner.runtime.config().max_incoming_message_length / 2;
        max.min(256 * 1024) as u32
    }

    fn upload_root(&self) -> Result<PathBuf> {
        self.inner
            .runtime
            .config()
            .upload_directory
            .clone()
            .ok_or_else(|| Error::resource("server has no upload directory configured"))
    }

    fn download_root(&self) -> Result<PathBuf> {
        self.inner
            .runtime
            .config()
            .download_directory
            .clone()
            .ok_or_else(|| Error::resource("server has no download directory configured"))
    }

    pub async fn begin_upload(
        &self,
        session: &mut SessionTransfers,
        request: BeginUploadRequest,
    ) -> Result<BeginUploadReply> {
        if request.manifest.files.is_empty() {
            return Err(Error::resource("upload manifest is empty"));
        }
        let root = self.upload_root()?;
        for file in &request.manifest.files {
            sanitize_relative(&file.path)?;
        }

        let (upload_id, state) = match &request.upload_id {
            Some(id) => {
                let existing = self.inner.uploads.lock().get(id).cloned();
                match existing {
                    Some(state) => {
                        {
                            let mut guard = state.lock().await;
                            if guard.manifest != request.manifest {
                                return Err(Error::resource(
                                    "resume manifest does not match the original upload",
                                ));
                            }
                            guard.last_activity_ms = now_ms();
                        }
                        info!(upload_id = %id, "upload resumed");
                        (id.clone(), state)
                    }
                    None => {
                        // The original upload was reaped; start over.
                        self.new_upload(&root, &request.manifest).await?
                    }
                }
            }
            None => self.new_upload(&root, &request.manifest).await?,
        };

        session.upload_id = Some(upload_id.clone());
        if !request.first_chunks.is_empty() {
            self.append_chunks(&state, request.first_chunks).await?;
        }

        let guard = state.lock().await;
        Ok(BeginUploadReply {
            start: guard.position(),
            max_message_len: self.max_message_len(),
            upload_id,
            bps: self.inner.upload_quota.allowed_bps(),
        })
    }

    async fn new_upload(
        &self,
        root: &Path,
        manifest: &FileManifest,
    ) -> Result<(String, Arc<tokio::sync::Mutex<UploadState>>)> {
        let upload_id = Uuid::new_v4().to_string();
        // Truncate every target so a fresh upload never appends to stale
        // content.
        for file in &manifest.files {
            let path = root.join(sanitize_relative(&file.path)?);
            self.inner.io.append(path, true, Vec::new()).await?;
        }
        let mut initial = UploadState {
            manifest: manifest.clone(),
            root: root.to_path_buf(),
            current_file: 0,
            current_pos: 0,
            completed: false,
            last_activity_ms: now_ms(),
            _quota: self.inner.upload_quota.acquire(),
        };
        // Zero-length files need no chunks; skip straight past them.
        while let Some(file) = initial.manifest.files.get(initial.current_file as usize) {
            if file.size > 0 {
                break;
            }
            initial.current_file += 1;
        }
        if initial.current_file as usize == initial.manifest.files.len() {
            initial.completed = true;
        }
        let state = Arc::new(tokio::sync::Mutex::new(initial));
        self.inner
            .uploads
            .lock()
            .insert(upload_id.clone(), state.clone());
        info!(upload_id = %upload_id, files = manifest.files.len(), "upload started");
        Ok((upload_id, state))
    }

    pub async fn upload_chunks(
        &self,
        session: &mut SessionTransfers,
        request: UploadChunksRequest,
    ) -> Result<UploadChunksReply> {
        let upload_id = session
            .upload_id
            .clone()
            .ok_or_else(|| Error::resource("no upload in progress on this session"))?;
        let state = self
            .inner
            .uploads
            .lock()
            .get(&upload_id)
            .cloned()
            .ok_or_else(|| Error::resource("upload was aborted by the server"))?;
        self.append_chunks(&state, request.chunks).await?;

        let completed = state.lock().await.completed;
        if completed {
            self.inner.uploads.lock().remove(&upload_id);
            session.upload_id = None;
            info!(upload_id = %upload_id, "upload completed");
        }
        Ok(UploadChunksReply {
            bps: self.inner.upload_quota.allowed_bps(),
        })
    }

    async fn append_chunks(
        &self,
        state: &Arc<tokio::sync::Mutex<UploadState>>,
        chunks: Vec<FileChunk>,
    ) -> Result<()> {
        let mut guard = state.lock().await;
        for chunk in chunks {
            if guard.completed {
                return Err(Error::resource("upload already completed"));
            }
            if chunk.file_index != guard.current_file || chunk.offset != guard.current_pos {
                return Err(Error::resource(format!(
                    "out-of-order chunk: got file {} offset {}, expected file {} offset {}",
                    chunk.file_index, chunk.offset, guard.current_file, guard.current_pos
                )));
            }
            let file = &guard.manifest.files[guard.current_file as usize];
            if chunk.offset + chunk.data.len() as u64 > file.size {
                return Err(Error::resource("chunk extends past the declared file size"));
            }
            let path = guard.root.join(sanitize_relative(&file.path)?);
            let len = chunk.data.len() as u64;
            self.inner.io.append(path, false, chunk.data).await?;

            guard.current_pos += len;
            let file_size = guard.manifest.files[guard.current_file as usize].size;
            while guard.current_pos
                == guard
                    .manifest
                    .files
                    .get(guard.current_file as usize)
                    .map(|f| f.size)
                    .unwrap_or(u64::MAX)
            {
                guard.current_file += 1;
                guard.current_pos = 0;
                if guard.current_file as usize == guard.manifest.files.len() {
                    guard.completed = true;
                    break;
                }
            }
            debug!(
                file = guard.current_file,
                pos = guard.current_pos,
                total = file_size,
                "chunk stored"
            );
        }
        guard.last_activity_ms = now_ms();
        Ok(())
    }

    pub async fn begin_download(
        &self,
        session: &mut SessionTransfers,
        request: BeginDownloadRequest,
    ) -> Result<BeginDownloadReply> {
        let root = self.download_root()?;
        let rel = sanitize_relative(&request.path)?;
        let full = root.join(&rel);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Error::resource(format!("download path {}: {e}", request.path)))?;

        let manifest = if meta.is_file() {
            FileManifest {
                files: vec![FileInfo {
                    path: request.path.clone(),
                    size: meta.len(),
                }],
            }
        } else {
            let mut files = Vec::new();
            let mut dir = tokio::fs::read_dir(&full).await?;
            while let Some(entry) = dir.next_entry().await? {
                let entry_meta = entry.metadata().await?;
                if entry_meta.is_file() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    files.push(FileInfo {
                        path: format!("{}/{name}", request.path),
                        size: entry_meta.len(),
                    });
                }
            }
            files.sort_by(|a, b| a.path.cmp(&b.path));
            FileManifest { files }
        };
        if manifest.files.is_empty() {
            return Err(Error::resource("download manifest is empty"));
        }

        let download_id = if request.server_download_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.server_download_id.clone()
        };
        session.download = Some(DownloadState {
            manifest: manifest.clone(),
            root,
            download_id: download_id.clone(),
            current_file: 0,
            current_pos: 0,
            window_start_ms: now_ms(),
            window_bytes: 0,
            quota: self.inner.download_quota.acquire(),
        });
        info!(download_id = %download_id, files = manifest.files.len(), "download started");

        let first = self
            .next_download_chunks(session, request.chunk_len)
            .await?;
        Ok(BeginDownloadReply {
            manifest,
            first_chunks: first.chunks,
            max_message_len: self.max_message_len(),
            bps: first.bps,
            download_id,
        })
    }

    pub fn trim_download(
        &self,
        session: &mut SessionTransfers,
        position: FileChunkPos,
    ) -> Result<()> {
        let download = session
            .download
            .as_mut()
            .ok_or_else(|| Error::resource("no download in progress on this session"))?;
        if position.file_index as usize > download.manifest.files.len() {
            return Err(Error::resource("trim position is outside the manifest"));
        }
        download.current_file = position.file_index;
        download.current_pos = position.offset;
        debug!(
            file = position.file_index,
            offset = position.offset,
            "download trimmed"
        );
        Ok(())
    }

    pub async fn download_chunks(
        &self,
        session: &mut SessionTransfers,
        request: DownloadChunksRequest,
    ) -> Result<DownloadChunksReply> {
        let reply = self.next_download_chunks(session, request.chunk_len).await?;
        if let Some(download) = &session.download {
            if download.current_file as usize == download.manifest.files.len() {
                info!(download_id = %download.download_id, "download completed");
                session.download = None;
            }
        }
        Ok(reply)
    }

    async fn next_download_chunks(
        &self,
        session: &mut SessionTransfers,
        chunk_len: u32,
    ) -> Result<DownloadChunksReply> {
        let window = self.inner.runtime.config().transfer_window;
        let download = session
            .download
            .as_mut()
            .ok_or_else(|| Error::resource("no download in progress on this session"))?;
        let bps = download.quota.allowed_bps();
        let chunk_len = chunk_len.clamp(1, self.max_message_len()) as usize;

        // Roll the pacing window.
        let now = now_ms();
        let window_ms = window.as_millis() as u64;
        if now.saturating_sub(download.window_start_ms) >= window_ms {
            download.window_start_ms = now;
            download.window_bytes = 0;
        }
        if bps > 0 {
            let allowed_per_window = u64::from(bps) * window_ms / 1000;
            if download.window_bytes >= allowed_per_window {
                let wait = window_ms - now.saturating_sub(download.window_start_ms);
                return Ok(DownloadChunksReply {
                    chunks: Vec::new(),
                    advise_wait_ms: wait.max(1) as u32,
                    bps,
                });
            }
        }

        let mut chunks = Vec::new();
        if (download.current_file as usize) < download.manifest.files.len() {
            let file = &download.manifest.files[download.current_file as usize];
            let path = download.root.join(sanitize_relative(&file.path)?);
            let remaining = file.size.saturating_sub(download.current_pos);
            let len = (chunk_len as u64).min(remaining) as usize;
            let data = if len > 0 {
                self.inner
                    .io
                    .read_at(path, download.current_pos, len)
                    .await?
            } else {
                Vec::new()
            };
            let read = data.len() as u64;
            chunks.push(FileChunk {
                file_index: download.current_file,
                offset: download.current_pos,
                data,
            });
            download.current_pos += read;
            download.window_bytes += read;
            if download.current_pos >= file.size {
                download.current_file += 1;
                download.current_pos = 0;
            }
        }

        Ok(DownloadChunksReply {
            chunks,
            advise_wait_ms: 0,
            bps,
        })
    }

    /// Called when a session closes; download slots release immediately,
    /// uploads stay resumable until reaped.
    pub fn session_closed(&self, session: &mut SessionTransfers) {
        session.download = None;
        session.upload_id = None;
    }

    /// Reaper: aborts uploads with no activity inside twice the transfer
    /// window, releasing their quota slots.
    pub async fn run(self, shutdown: CancelHandle) {
        let interval = self.inner.runtime.config().reaping_interval;
        let window = self.inner.runtime.config().transfer_window;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let threshold_ms = 2 * window.as_millis() as u64;
            let now = now_ms();
            let stale: Vec<String> = {
                let uploads = self.inner.uploads.lock();
                let mut stale = Vec::new();
                for (id, state) in uploads.iter() {
                    if let Ok(guard) = state.try_lock() {
                        if now.saturating_sub(guard.last_activity_ms) > threshold_ms {
                            stale.push(id.clone());
                        }
                    }
                }
                stale
            };
            for id in stale {
                warn!(upload_id = %id, "upload aborted after inactivity");
                self.inner.uploads.lock().remove(&id);
            }
        }
    }
}

/// Uploads a local file to the server under `remote_path`, resuming the
/// given upload id if provided. Returns the upload id for later resume.
pub async fn upload_file(
    client: &mut Client,
    local_path: &Path,
    remote_path: &str,
    resume_upload_id: Option<String>,
) -> Result<String> {
    let meta = tokio::fs::metadata(local_path).await?;
    let manifest = FileManifest {
        files: vec![FileInfo {
            path: remote_path.to_string(),
            size: meta.len(),
        }],
    };
    let begin = BeginUploadRequest {
        manifest,
        first_chunks: Vec::new(),
        session_local_id: 1,
        upload_id: resume_upload_id,
    };
    let reply: BeginUploadReply = client
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::BEGIN_UPLOAD,
            1,
            &(begin,),
        )
        .await?;

    if reply.start.file_index >= 1 {
        return Ok(reply.upload_id);
    }
    let chunk_len = reply.max_message_len.clamp(4096, 64 * 1024) as usize;
    let mut bps = reply.bps;
    let mut pos = reply.start.offset;

    let data = tokio::fs::read(local_path).await?;
    while pos < data.len() as u64 {
        let end = (pos as usize + chunk_len).min(data.len());
        let chunk = FileChunk {
            file_index: 0,
            offset: pos,
            data: data[pos as usize..end].to_vec(),
        };
        let sent = chunk.data.len();
        let request = UploadChunksRequest { chunks: vec![chunk] };
        let ack: UploadChunksReply = client
            .call(
                method_ids::BUILTIN_INTERFACE,
                method_ids::UPLOAD_CHUNKS,
                1,
                &(request,),
            )
            .await?;
        pos = end as u64;
        bps = ack.bps;
        if bps > 0 {
            // Pace to the granted rate.
            let wait = Duration::from_secs_f64(sent as f64 / bps as f64);
            tokio::time::sleep(wait).await;
        }
    }
    Ok(reply.upload_id)
}

/// Downloads a single server file at `remote_path` into `local_path`.
/// Returns the byte count written.
pub async fn download_file(
    client: &mut Client,
    remote_path: &str,
    local_path: &Path,
) -> Result<u64> {
    let begin = BeginDownloadRequest {
        path: remote_path.to_string(),
        chunk_len: 64 * 1024,
        session_local_id: 1,
        server_download_id: String::new(),
    };
    let reply: BeginDownloadReply = client
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::BEGIN_DOWNLOAD,
            1,
            &(begin,),
        )
        .await?;
    if reply.manifest.files.len() != 1 {
        return Err(Error::resource(
            "download_file expects a single-file manifest",
        ));
    }
    let total = reply.manifest.files[0].size;
    let mut file = tokio::fs::File::create(local_path).await?;
    let mut written = 0u64;

    let mut pending = reply.first_chunks;
    loop {
        for chunk in &pending {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk.data).await?;
            written += chunk.data.len() as u64;
        }
        if written >= total {
            break;
        }
        let request = DownloadChunksRequest { chunk_len: 64 * 1024 };
        let ack: DownloadChunksReply = client
            .call(
                method_ids::BUILTIN_INTERFACE,
                method_ids::DOWNLOAD_CHUNKS,
                1,
                &(request,),
            )
            .await?;
        if ack.chunks.is_empty() && ack.advise_wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(ack.advise_wait_ms))).await;
        }
        pending = ack.chunks;
    }
    tokio::io::AsyncWriteExt::flush(&mut file).await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_divides_across_users() {
        let quota = BandwidthQuota::new(1000);
        assert_eq!(quota.allowed_bps(), 1000);
        let a = quota.acquire();
        assert_eq!(quota.allowed_bps(), 1000);
        let b = quota.acquire();
        assert_eq!(a.allowed_bps(), 500);
        drop(b);
        assert_eq!(quota.allowed_bps(), 1000);
        drop(a);
    }

    #[test]
    fn unlimited_quota_reports_zero() {
        let quota = BandwidthQuota::new(0);
        let _slot = quota.acquire();
        assert_eq!(quota.allowed_bps(), 0);
    }

    #[test]
    fn transfer_paths_are_sanitized() {
        assert!(sanitize_relative("data/file.bin").is_ok());
        assert!(sanitize_relative("/etc/passwd").is_err());
        assert!(sanitize_relative("../escape").is_err());
        assert!(sanitize_relative("a/../../b").is_err());
        assert!(sanitize_relative("").is_err());
    }

    #[tokio::test]
    async fn io_pool_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FileIoPool::new(1);
        let path = dir.path().join("nested/out.bin");

        pool.append(path.clone(), true, b"hello ".to_vec()).await.unwrap();
        pool.append(path.clone(), false, b"world".to_vec()).await.unwrap();

        let all = pool.read_at(path.clone(), 0, 64).await.unwrap();
        assert_eq!(all, b"hello world");
        let tail = pool.read_at(path, 6, 5).await.unwrap();
        assert_eq!(tail, b"world");
    }

    #[tokio::test]
    async fn upload_state_machine_tracks_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::RuntimeConfig::default();
        cfg.upload_directory = Some(dir.path().to_path_buf());
        let service = FileTransferService::new(crate::config::Runtime::new(cfg));
        let mut session = SessionTransfers::default();

        let manifest = FileManifest {
            files: vec![
                FileInfo { path: "a.bin".into(), size: 4 },
                FileInfo { path: "b.bin".into(), size: 2 },
            ],
        };
        let reply = service
            .begin_upload(
                &mut session,
                BeginUploadRequest {
                    manifest,
                    first_chunks: Vec::new(),
                    session_local_id: 1,
                    upload_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.start, FileChunkPos { file_index: 0, offset: 0 });

        // Out-of-order chunk is rejected.
        let bad = service
            .upload_chunks(
                &mut session,
                UploadChunksRequest {
                    chunks: vec![FileChunk { file_index: 0, offset: 2, data: vec![0, 0] }],
                },
            )
            .await;
        assert!(bad.is_err());

        for (idx, offset, data) in [
            (0u32, 0u64, vec![1u8, 2]),
            (0, 2, vec![3, 4]),
            (1, 0, vec![9, 9]),
        ] {
            service
                .upload_chunks(
                    &mut session,
                    UploadChunksRequest {
                        chunks: vec![FileChunk { file_index: idx, offset, data }],
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), vec![9, 9]);
        assert!(session.upload_id.is_none(), "completed upload clears the slot");
    }
}
