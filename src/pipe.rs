//! Fan-out of one input stream to many objects.

use futures::StreamExt;
use futures::future::join_all;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::s3::{ObjectUrl, Result, S3Client, S3Error, Target, UploadHandle};

/// Bytes read from the input per fan-out round
const CHUNK_SIZE: usize = 32 * 1024;

/// One object to receive a copy of the input
#[derive(Debug, Clone)]
pub struct Destination {
    /// Identifier used when reporting errors
    pub label: String,
    pub client: S3Client,
    pub target: Target,
}

impl Destination {
    pub fn new(client: S3Client, url: &ObjectUrl) -> Self {
        Self {
            label: url.to_string(),
            client,
            target: url.target().clone(),
        }
    }
}

/// Copy `input` to every destination, or to `output` when there are none.
///
/// Every destination receives the full, identical stream. All uploads are
/// closed before returning, and the first failure is reported together with
/// the labels of all destinations.
pub async fn pipe<R, W>(destinations: &[Destination], input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if destinations.is_empty() {
        return cat_out(input, output).await;
    }

    put_targets(destinations, input)
        .await
        .map_err(|source| S3Error::FanOut {
            targets: destinations.iter().map(|d| d.label.clone()).collect(),
            source: Box::new(source),
        })
}

/// Copy `input` to `output`; a reader that goes away is not an error
pub async fn cat_out<R, W>(mut input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = async {
        let n = tokio::io::copy(&mut input, &mut output).await?;
        output.flush().await?;
        Ok::<_, io::Error>(n)
    }
    .await;

    match copied {
        Ok(n) => {
            debug!("Copied {} bytes to output", n);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Output closed by reader, stopping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn put_targets<R>(destinations: &[Destination], input: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    // Size is unknown up front: stdin may be a pipe or a /proc file
    let mut handles: Vec<UploadHandle> = destinations
        .iter()
        .map(|d| d.client.put(&d.target, "", -1))
        .collect();
    let mut write_errors: Vec<Option<S3Error>> = handles.iter().map(|_| None).collect();

    let copied = tee(input, &mut handles, &mut write_errors).await;

    if copied.is_err() {
        // Incomplete input must not be committed as a finished object
        handles.iter_mut().for_each(UploadHandle::abort);
    }

    let closed = join_all(handles.iter_mut().map(|h| h.close())).await;
    let bytes = copied?;

    let first_close_error = closed.into_iter().find_map(|r| r.err());
    match first_close_error.or_else(|| write_errors.into_iter().flatten().next()) {
        Some(e) => Err(e),
        None => {
            info!(
                "Copied {} bytes to {} target(s)",
                bytes,
                destinations.len()
            );
            Ok(())
        }
    }
}

/// Write every chunk of `input` to each handle that has not failed yet
async fn tee<R>(
    input: R,
    handles: &mut [UploadHandle],
    write_errors: &mut [Option<S3Error>],
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = ReaderStream::with_capacity(input, CHUNK_SIZE);
    let mut total = 0u64;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let chunk = &chunk;

        let writes = handles
            .iter_mut()
            .zip(write_errors.iter_mut())
            .filter(|(_, failed)| failed.is_none())
            .map(|(handle, failed)| async move {
                if let Err(e) = handle.write_all(chunk).await {
                    debug!("Stopped writing to {}: {}", handle.target(), e);
                    *failed = Some(e);
                }
            });
        join_all(writes).await;

        total += chunk.len() as u64;
        if write_errors.iter().all(Option::is_some) {
            break;
        }
    }

    Ok(total)
}
