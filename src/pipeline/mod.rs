//! Pipeline plumbing shared by backup and restore: chunked streaming over
//! bounded channels, retry with exponential backoff, and liveness
//! heartbeats for long-running stages.

pub mod backup;
pub mod restore;

use crate::Result;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Stage granularity: bytes move between stages in 64 KiB chunks.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Back-pressure bound between stages.
pub const CHANNEL_DEPTH: usize = 8;

/// Stream a buffer through a bounded channel as 64 KiB chunks, yielding an
/// `AsyncRead` for the consuming stage. `Bytes` slices share the backing
/// allocation, so this adds no copies.
pub fn chunk_reader(data: Bytes) -> impl tokio::io::AsyncRead + Send + Unpin {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_DEPTH);
    tokio::spawn(async move {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + CHUNK_SIZE).min(data.len());
            if tx.send(Ok(data.slice(offset..end))).await.is_err() {
                // Consumer went away; stop producing.
                return;
            }
            offset = end;
        }
    });
    StreamReader::new(ReceiverStream::new(rx))
}

/// Retry an operation on transient errors with exponential backoff.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    cap: Duration,
    op: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1).min(cap);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    "{} failed, retrying in {:?}",
                    what,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Log a liveness heartbeat until the returned token is cancelled. Used
/// around database extraction, which has no deadline of its own.
pub fn spawn_heartbeat(what: &'static str, period: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::info!(elapsed_secs = started.elapsed().as_secs(), "{} in progress", what);
                }
                _ = child.cancelled() => break,
            }
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunk_reader_reassembles_the_buffer() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| i as u8).collect();
        let mut reader = chunk_reader(Bytes::from(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn chunk_reader_handles_empty_input() {
        let mut reader = chunk_reader(Bytes::new());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn retries_stop_after_transient_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("op", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::StorageUnavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("op", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::KeyNotFound("k1".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eventual_success_is_returned() {
        let calls = AtomicU32::new(0);
        let result = with_retries("op", 5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::StorageUnavailable("down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
