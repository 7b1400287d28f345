use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indicatif::ProgressBar;
use md5::{Digest, Md5};
use futures::{Stream, StreamExt, future, stream};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, StatusCode};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::client::S3Client;
use super::error::{self, S3Error};
use super::target::Target;

/// Bytes the in-process pipe buffers before writers block
const PIPE_CAPACITY: usize = 64 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const CONTENT_MD5: &str = "Content-MD5";

impl S3Client {
    /// Start uploading an object whose content is written through the
    /// returned handle.
    ///
    /// The request is sent from a background task right away. `md5_hex` may
    /// be empty; otherwise it is sent as `Content-MD5`. A negative `size`
    /// leaves the content length unset and the body is streamed chunked.
    /// Every failure, including a malformed `md5_hex`, is reported by
    /// [`UploadHandle::close`].
    pub fn put(&self, target: &Target, md5_hex: &str, size: i64) -> UploadHandle {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (release, completion) = oneshot::channel();
        let complete = Arc::new(AtomicBool::new(false));

        let client = self.clone();
        let task_target = target.clone();
        let md5_hex = md5_hex.trim().to_string();
        let body_complete = complete.clone();
        let task = tokio::spawn(async move {
            let outcome = client
                .send_put(&task_target, &md5_hex, size, reader, body_complete)
                .await;
            if let Err(e) = &outcome {
                warn!("Upload to {} failed: {}", task_target, e);
            }
            // The handle may already be gone
            let _ = release.send(outcome);
        });

        UploadHandle {
            target: target.clone(),
            writer: Some(writer),
            completion: Some(completion),
            outcome: None,
            complete,
            closed: false,
            task,
        }
    }

    async fn send_put(
        &self,
        target: &Target,
        md5_hex: &str,
        size: i64,
        body: DuplexStream,
        complete: Arc<AtomicBool>,
    ) -> error::Result<()> {
        let body = ReaderStream::new(body).chain(end_of_body(complete));
        let mut builder = self
            .http()
            .put(self.key_url(target)?)
            .body(Body::wrap_stream(body));

        if size >= 0 {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        if !md5_hex.is_empty() {
            let digest = hex::decode(md5_hex).map_err(|source| S3Error::InvalidContentHash {
                value: md5_hex.to_string(),
                source,
            })?;
            builder = builder.header(CONTENT_MD5, BASE64.encode(digest));
        }

        let response = self.execute(builder.build()?).await?;
        if response.status() != StatusCode::OK {
            return Err(S3Error::from_response(response).await);
        }

        debug!("Uploaded {}", target);
        Ok(())
    }
}

/// Ends the request body cleanly only if the handle was closed; otherwise
/// the body fails so the server discards what it received.
fn end_of_body<T>(complete: Arc<AtomicBool>) -> impl Stream<Item = io::Result<T>> {
    stream::once(async move {
        if complete.load(Ordering::Acquire) {
            None
        } else {
            Some(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upload abandoned before close",
            )))
        }
    })
    .filter_map(future::ready)
}

/// Write side of a streaming upload.
///
/// Bytes written here flow through a bounded pipe into the request body, so
/// a writer blocks while the network is slower than its input. A write that
/// would block after the request has already finished fails with
/// [`S3Error::UploadEnded`]. The outcome of the request is only known once
/// [`close`](Self::close) returns.
///
/// Dropping a handle without closing it abandons the upload.
#[derive(Debug)]
pub struct UploadHandle {
    target: Target,
    writer: Option<DuplexStream>,
    completion: Option<oneshot::Receiver<error::Result<()>>>,
    /// Outcome received while a write was waiting
    outcome: Option<error::Result<()>>,
    complete: Arc<AtomicBool>,
    closed: bool,
    task: JoinHandle<()>,
}

impl UploadHandle {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> error::Result<()> {
        if self.writer.is_none() {
            return Err(S3Error::HandleClosed);
        }

        match AsyncWriteExt::write_all(&mut *self, buf).await {
            Ok(()) => Ok(()),
            Err(e) if self.outcome.is_some() || e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Write to {} stopped: {}", self.target, e);
                Err(S3Error::UploadEnded)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signal end of content and wait for the upload to finish.
    ///
    /// Only the first call waits and reports the outcome; later calls return
    /// `Ok(())` immediately.
    pub async fn close(&mut self) -> error::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.complete.store(true, Ordering::Release);

        let shutdown = match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };

        let outcome = match (self.outcome.take(), self.completion.take()) {
            (Some(outcome), _) => outcome,
            // A dropped sender means the task ended without reporting
            (None, Some(completion)) => completion.await.unwrap_or(Err(S3Error::UploadInterrupted)),
            (None, None) => Err(S3Error::UploadInterrupted),
        };
        outcome?;
        shutdown?;
        Ok(())
    }

    /// Cancel the upload so the server never sees a complete body.
    ///
    /// A following [`close`](Self::close) reports
    /// [`S3Error::UploadInterrupted`].
    pub fn abort(&mut self) {
        self.task.abort();
        self.writer = None;
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        if !self.closed {
            debug!("Upload to {} dropped before close, aborting", self.target);
            self.task.abort();
        }
    }
}

impl AsyncWrite for UploadHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.outcome.is_some() {
            return Poll::Ready(Err(upload_ended()));
        }
        let Some(writer) = this.writer.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                S3Error::HandleClosed,
            )));
        };

        match Pin::new(writer).poll_write(cx, buf) {
            Poll::Pending => {
                // The pipe is full; nobody drains it once the request is over
                let Some(completion) = this.completion.as_mut() else {
                    return Poll::Pending;
                };
                match Pin::new(completion).poll(cx) {
                    Poll::Ready(outcome) => {
                        this.completion = None;
                        this.outcome = Some(outcome.unwrap_or(Err(S3Error::UploadInterrupted)));
                        Poll::Ready(Err(upload_ended()))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            ready => ready,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Shutting down the writer is the end of content, same as close()
        this.complete.store(true, Ordering::Release);
        match this.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn upload_ended() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, S3Error::UploadEnded)
}

/// Hex MD5 digest of a local file
pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Upload a local file with its size and MD5, updating a progress bar
pub async fn upload_file(
    client: &S3Client,
    target: &Target,
    local_path: &Path,
    pb: Option<&ProgressBar>,
) -> Result<u64> {
    let uploaded = send_file(client, target, local_path, pb).await;
    if let (Err(_), Some(pb)) = (&uploaded, pb) {
        pb.abandon_with_message(format!("Failed to upload {}", local_path.display()));
    }
    uploaded
}

async fn send_file(
    client: &S3Client,
    target: &Target,
    local_path: &Path,
    pb: Option<&ProgressBar>,
) -> Result<u64> {
    let mut file = File::open(local_path)
        .await
        .context("Failed to open local file")?;
    let file_size = file
        .metadata()
        .await
        .context("Failed to get file metadata")?
        .len();
    let md5_hex = file_md5(local_path).await?;

    if let Some(pb) = pb {
        pb.set_length(file_size);
        pb.set_message(format!("Uploading {}", local_path.display()));
    }

    let mut handle = client.put(target, &md5_hex, file_size as i64);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut write_error = None;
    loop {
        let n = match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                handle.abort();
                let _ = handle.close().await;
                return Err(anyhow::Error::new(e).context("Failed to read local file"));
            }
        };
        // A failed write means the request already ended; close() says why
        if let Err(e) = handle.write_all(&buffer[..n]).await {
            write_error = Some(e);
            break;
        }
        if let Some(pb) = pb {
            pb.inc(n as u64);
        }
    }

    handle.close().await.context("Failed to upload file")?;
    if let Some(e) = write_error {
        return Err(anyhow::Error::new(e).context("Failed to upload file"));
    }

    if let Some(pb) = pb {
        pb.finish_with_message(format!("Uploaded {}", local_path.display()));
    }
    info!(
        "Uploaded {} ({} bytes, md5 {}) -> {}",
        local_path.display(),
        file_size,
        md5_hex,
        target
    );

    Ok(file_size)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::s3::client::tests::mock_client;
    use crate::s3::signer::AnonymousSigner;
    use std::io::Write;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Client for a server that answers every request with 403 right after
    /// its headers and never reads the body
    pub(crate) async fn stalled_forbidden_client() -> S3Client {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match socket.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => break,
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                    .await;
                held.push(socket);
            }
        });

        S3Client::new(
            reqwest::Client::new(),
            reqwest::Url::parse(&format!("http://{}/", addr)).unwrap(),
            Arc::new(AnonymousSigner),
        )
    }

    async fn mount_put(server: &MockServer, object_path: &str, status: u16) {
        Mock::given(method("PUT"))
            .and(path(object_path))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    async fn single_request(server: &MockServer) -> wiremock::Request {
        let mut requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        requests.remove(0)
    }

    #[tokio::test]
    async fn test_put_streams_payload_of_any_size() {
        for size in [0usize, 1, 5, PIPE_CAPACITY + 1, 1024 * 1024] {
            let server = MockServer::start().await;
            mount_put(&server, "/bucket/object", 200).await;
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

            let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "", -1);
            for chunk in payload.chunks(10_000) {
                handle.write_all(chunk).await.unwrap();
            }
            handle.close().await.unwrap();

            let request = single_request(&server).await;
            assert_eq!(request.body.len(), size);
            assert_eq!(request.body, payload);
            assert!(request.headers.get("content-length").is_none());
        }
    }

    #[tokio::test]
    async fn test_put_declared_length_and_md5() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/hello.txt", 200).await;
        let md5_hex = "5d41402abc4b2a76b9719d911017c592";

        let mut handle =
            mock_client(&server).put(&Target::new("bucket", "hello.txt"), md5_hex, 5);
        handle.write_all(b"hello").await.unwrap();
        handle.close().await.unwrap();

        let request = single_request(&server).await;
        assert_eq!(request.body, b"hello");
        assert_eq!(request.headers.get("content-length").unwrap(), "5");
        assert_eq!(
            request.headers.get("content-md5").unwrap().to_str().unwrap(),
            BASE64.encode(hex::decode(md5_hex).unwrap())
        );
    }

    #[tokio::test]
    async fn test_close_waits_for_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let start = Instant::now();
        // Closing before any write still waits for the background outcome
        let mut handle = mock_client(&server).put(&Target::new("bucket", "empty"), "", -1);
        handle.close().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));

        let request = single_request(&server).await;
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_close_reports_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <Error><Code>AccessDenied</Code><Message>Access Denied</Message><RequestId>R1</RequestId></Error>"#,
            ))
            .mount(&server)
            .await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "", -1);
        handle.write_all(b"data").await.unwrap();
        let err = handle.close().await.unwrap_err();

        match err {
            S3Error::Protocol {
                status,
                code,
                message,
                request_id,
            } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(code.as_deref(), Some("AccessDenied"));
                assert_eq!(message.as_deref(), Some("Access Denied"));
                assert_eq!(request_id.as_deref(), Some("R1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_md5_fails_at_close_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "not-hex", 4);
        let err = handle.close().await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidContentHash { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_reported_at_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = S3Client::new(
            reqwest::Client::new(),
            reqwest::Url::parse(&format!("http://{}/", addr)).unwrap(),
            Arc::new(AnonymousSigner),
        );
        let mut handle = client.put(&Target::new("bucket", "object"), "", -1);
        let err = handle.close().await.unwrap_err();
        assert!(matches!(err, S3Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_write_fails_once_request_has_ended() {
        let client = stalled_forbidden_client().await;
        let mut handle = client.put(&Target::new("bucket", "object"), "", -1);

        // Far more than the pipe and socket buffers can hold
        let payload = vec![7u8; 16 * 1024 * 1024];
        let written =
            tokio::time::timeout(Duration::from_secs(5), handle.write_all(&payload)).await;
        assert!(matches!(written, Ok(Err(S3Error::UploadEnded))));

        match handle.close().await {
            Err(S3Error::Protocol { status, .. }) => assert_eq!(status, StatusCode::FORBIDDEN),
            other => panic!("unexpected close result: {other:?}"),
        }
        assert!(handle.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_is_not_committed() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/object", 200).await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "", -1);
        handle.write_all(b"partial").await.unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let requests = server.received_requests().await.unwrap();
        assert!(requests.is_empty(), "partial body was committed");
    }

    #[tokio::test]
    async fn test_second_close_returns_immediately() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/object", 500).await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "", -1);
        assert!(handle.close().await.is_err());
        assert!(handle.close().await.is_ok());
        assert!(matches!(
            handle.write_all(b"late").await,
            Err(S3Error::HandleClosed)
        ));
    }

    #[tokio::test]
    async fn test_handle_as_async_write() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/copied", 200).await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "copied"), "", -1);
        let mut input: &[u8] = b"copied through tokio::io::copy";
        tokio::io::copy(&mut input, &mut handle).await.unwrap();
        handle.close().await.unwrap();

        let request = single_request(&server).await;
        assert_eq!(request.body, b"copied through tokio::io::copy");
    }

    #[tokio::test]
    async fn test_abort_interrupts_upload() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/object", 200).await;

        let mut handle = mock_client(&server).put(&Target::new("bucket", "object"), "", -1);
        handle.write_all(b"partial").await.unwrap();
        handle.abort();
        assert!(matches!(
            handle.close().await,
            Err(S3Error::UploadInterrupted)
        ));
    }

    #[tokio::test]
    async fn test_upload_file() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/notes.txt", 200).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"meeting notes").unwrap();
        file.flush().unwrap();

        let size = upload_file(
            &mock_client(&server),
            &Target::new("bucket", "notes.txt"),
            file.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(size, 13);

        let request = single_request(&server).await;
        assert_eq!(request.body, b"meeting notes");
        assert_eq!(request.headers.get("content-length").unwrap(), "13");
        let expected_md5 = file_md5(file.path()).await.unwrap();
        assert_eq!(
            request.headers.get("content-md5").unwrap().to_str().unwrap(),
            BASE64.encode(hex::decode(expected_md5).unwrap())
        );
    }

    #[tokio::test]
    async fn test_upload_file_abandons_progress_bar_on_failure() {
        let server = MockServer::start().await;
        mount_put(&server, "/bucket/notes.txt", 500).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"meeting notes").unwrap();
        file.flush().unwrap();

        let pb = ProgressBar::hidden();
        let result = upload_file(
            &mock_client(&server),
            &Target::new("bucket", "notes.txt"),
            file.path(),
            Some(&pb),
        )
        .await;

        assert!(result.is_err());
        assert!(pb.is_finished());
    }
}
