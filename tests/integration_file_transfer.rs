use std::time::Duration;

use anyhow::Result;
use wirecall::protocol::method_ids;
use wirecall::service::filetransfer::{
    download_file, upload_file, BeginUploadReply, BeginUploadRequest, FileChunk, FileInfo,
    FileManifest, UploadChunksReply, UploadChunksRequest,
};
use wirecall::{Client, Endpoint, Runtime, RuntimeConfig, Server};

fn transfer_runtime(
    upload_dir: &std::path::Path,
    download_dir: &std::path::Path,
) -> Runtime {
    let mut cfg = RuntimeConfig::default();
    cfg.upload_directory = Some(upload_dir.to_path_buf());
    cfg.download_directory = Some(download_dir.to_path_buf());
    cfg.call_timeout = Duration::from_secs(10);
    Runtime::new(cfg)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

/// The file finally written on the server is byte-exact.
#[tokio::test]
async fn upload_round_trip_is_byte_exact() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let staging = tempfile::tempdir()?;
    let runtime = transfer_runtime(uploads.path(), downloads.path());
    let server = Server::new(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let content = pattern(300_000);
    let local = staging.path().join("source.bin");
    std::fs::write(&local, &content)?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let upload_id = upload_file(&mut client, &local, "incoming/source.bin", None).await?;
    assert!(!upload_id.is_empty());

    let stored = std::fs::read(uploads.path().join("incoming/source.bin"))?;
    assert_eq!(stored, content);

    server.shutdown();
    Ok(())
}

/// An upload interrupted mid-way resumes from the recorded offset and
/// yields the same final content.
#[tokio::test]
async fn interrupted_upload_resumes() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let runtime = transfer_runtime(uploads.path(), downloads.path());
    let server = Server::new(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let content = pattern(100_000);
    let half = content.len() / 2;
    let manifest = FileManifest {
        files: vec![FileInfo {
            path: "resume/big.bin".to_string(),
            size: content.len() as u64,
        }],
    };

    // First connection uploads only the first half, then goes away.
    let mut first = Client::new(&runtime, handle.endpoint().clone());
    let begin: BeginUploadReply = first
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::BEGIN_UPLOAD,
            1,
            &(BeginUploadRequest {
                manifest: manifest.clone(),
                first_chunks: Vec::new(),
                session_local_id: 1,
                upload_id: None,
            },),
        )
        .await?;
    let _: UploadChunksReply = first
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::UPLOAD_CHUNKS,
            1,
            &(UploadChunksRequest {
                chunks: vec![FileChunk {
                    file_index: 0,
                    offset: 0,
                    data: content[..half].to_vec(),
                }],
            },),
        )
        .await?;
    first.disconnect().await;

    // Second connection resumes under the same upload id.
    let mut second = Client::new(&runtime, handle.endpoint().clone());
    let resume: BeginUploadReply = second
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::BEGIN_UPLOAD,
            1,
            &(BeginUploadRequest {
                manifest,
                first_chunks: Vec::new(),
                session_local_id: 1,
                upload_id: Some(begin.upload_id.clone()),
            },),
        )
        .await?;
    assert_eq!(resume.upload_id, begin.upload_id);
    assert_eq!(resume.start.file_index, 0);
    assert_eq!(resume.start.offset, half as u64);

    let _: UploadChunksReply = second
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::UPLOAD_CHUNKS,
            1,
            &(UploadChunksRequest {
                chunks: vec![FileChunk {
                    file_index: 0,
                    offset: half as u64,
                    data: content[half..].to_vec(),
                }],
            },),
        )
        .await?;

    let stored = std::fs::read(uploads.path().join("resume/big.bin"))?;
    assert_eq!(stored, content);

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn download_round_trip_is_byte_exact() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let staging = tempfile::tempdir()?;
    let runtime = transfer_runtime(uploads.path(), downloads.path());
    let server = Server::new(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let content = pattern(200_000);
    std::fs::create_dir_all(downloads.path().join("pub"))?;
    std::fs::write(downloads.path().join("pub/data.bin"), &content)?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let local = staging.path().join("fetched.bin");
    let written = download_file(&mut client, "pub/data.bin", &local).await?;
    assert_eq!(written, content.len() as u64);
    assert_eq!(std::fs::read(&local)?, content);

    server.shutdown();
    Ok(())
}

/// The granted rate steers pacing: with a quota configured, replies carry
/// a non-zero bytes-per-second advice.
#[tokio::test]
async fn quota_advice_travels_in_replies() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let downloads = tempfile::tempdir()?;
    let mut cfg = RuntimeConfig::default();
    cfg.upload_directory = Some(uploads.path().to_path_buf());
    cfg.download_directory = Some(downloads.path().to_path_buf());
    cfg.upload_quota_bps = 10_000_000;
    let runtime = Runtime::new(cfg);
    let server = Server::new(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let begin: BeginUploadReply = client
        .call(
            method_ids::BUILTIN_INTERFACE,
            method_ids::BEGIN_UPLOAD,
            1,
            &(BeginUploadRequest {
                manifest: FileManifest {
                    files: vec![FileInfo { path: "q.bin".to_string(), size: 8 }],
                },
                first_chunks: Vec::new(),
                session_local_id: 1,
                upload_id: None,
            },),
        )
        .await?;
    assert_eq!(begin.bps, 10_000_000);

    server.shutdown();
    Ok(())
}
