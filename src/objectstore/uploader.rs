//! Uploader base
//!
//! Bridges the request-body copy loop (a plain `AsyncWrite`) to an upload
//! running in its own task. The two sides are joined by a bounded
//! [`tokio::io::duplex`] channel, so a slow store stalls the writer.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► Writing ──close()──► Success ──┐
//!              │                            ├─ caller context ends ─► delete | abort (once)
//!              └──── error / deadline ──► Failed ──┘
//! ```
//!
//! Two signals are involved and they are deliberately separate (see
//! [`Lifetimes`]): the upload deadline bounds the transfer, while the caller
//! context decides when the stored object may be cleaned up.

use super::multipart::Multipart;
use super::put_object::Object;
use super::s3_object::S3Object;
use super::{extract_etag, ObjectStoreError};
use crate::metrics;
use md5::{Digest, Md5};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default capacity of the duplex channel (64KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 65536;

/// The two independent lifetimes an uploader is bound to
///
/// * `upload` + `deadline` bound the transfer. `upload` is a child of the
///   caller context, so a client disconnect also stops the transfer.
/// * `cleanup` is the caller context itself. Delete/abort waits for it,
///   because the backend may still read the object after the upload ends.
#[derive(Debug, Clone)]
pub struct Lifetimes {
    upload: CancellationToken,
    deadline: Instant,
    cleanup: CancellationToken,
}

impl Lifetimes {
    /// Derive upload lifetimes from the caller context and an absolute deadline
    pub fn new(caller: &CancellationToken, deadline: Instant) -> Self {
        Self {
            upload: caller.child_token(),
            deadline,
            cleanup: caller.clone(),
        }
    }

    pub fn upload_token(&self) -> &CancellationToken {
        &self.upload
    }

    pub fn cleanup_token(&self) -> &CancellationToken {
        &self.cleanup
    }
}

/// Guard making delete/abort fire at most once per object
///
/// The upload task already picks one of them; this covers callers driving
/// an uploader directly.
#[derive(Debug, Default)]
pub(crate) struct CleanupOnce(AtomicBool);

impl CleanupOnce {
    /// Returns `true` for the first caller only
    pub(crate) fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Remote destinations an [`Uploader`] can drive
pub enum RemoteStrategy {
    /// Single presigned PUT
    Object(Object),
    /// Presigned S3 multipart upload
    Multipart(Multipart),
    /// AWS SDK upload with bucket credentials
    S3(S3Object),
}

impl RemoteStrategy {
    /// Short name used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Multipart(_) => "multipart",
            Self::S3(_) => "s3",
        }
    }

    fn checks_etag(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    async fn upload(&mut self, reader: DuplexStream) -> Result<Option<String>, ObjectStoreError> {
        match self {
            Self::Object(o) => o.upload(reader).await.map(Some),
            Self::Multipart(m) => m.upload(reader).await.map(Some),
            Self::S3(s) => s.upload(reader).await.map(|_| None),
        }
    }

    async fn delete(&self) {
        match self {
            Self::Object(o) => o.delete().await,
            Self::Multipart(m) => m.delete().await,
            Self::S3(s) => s.delete().await,
        }
    }

    async fn abort(&self) {
        match self {
            Self::Object(o) => o.abort().await,
            Self::Multipart(m) => m.abort().await,
            Self::S3(s) => s.abort().await,
        }
    }
}

type Outcome = Result<Option<String>, ObjectStoreError>;

/// Write side of a remote upload
///
/// Implements [`AsyncWrite`]; [`Uploader::close`] must be called to learn
/// whether the upload succeeded. Dropping an uploader without closing it
/// cancels the transfer and the object is aborted.
pub struct Uploader {
    writer: Option<DuplexStream>,
    md5: Option<Md5>,
    outcome: Option<oneshot::Receiver<Outcome>>,
    upload: CancellationToken,
    abandoned: Arc<AtomicBool>,
    deadline: Instant,
    kind: &'static str,
    written: u64,
    closed: bool,
    succeeded: bool,
}

impl Uploader {
    /// Spawn the upload task and return its write side
    pub fn start(strategy: RemoteStrategy, lifetimes: Lifetimes, pipe_capacity: usize) -> Self {
        let (writer, reader) = tokio::io::duplex(pipe_capacity.max(1));
        let (tx, rx) = oneshot::channel();
        let abandoned = Arc::new(AtomicBool::new(false));
        let md5 = strategy.checks_etag().then(Md5::new);
        let kind = strategy.kind();
        let upload = lifetimes.upload.clone();
        let deadline = lifetimes.deadline;

        tokio::spawn(run_upload(
            strategy,
            reader,
            lifetimes,
            Arc::clone(&abandoned),
            tx,
        ));

        Self {
            writer: Some(writer),
            md5,
            outcome: Some(rx),
            upload,
            abandoned,
            deadline,
            kind,
            written: 0,
            closed: false,
            succeeded: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Signal end-of-stream and wait for the upload to finish
    ///
    /// Returns the upload's own error, `DeadlineExceeded` when the deadline
    /// passes first, or an ETag mismatch for single-object uploads.
    pub async fn close(&mut self) -> Result<(), ObjectStoreError> {
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            // The reader may already be gone after a failed upload; the task
            // outcome below carries the real error.
            let _ = writer.shutdown().await;
        }

        let Some(outcome) = self.outcome.take() else {
            return if self.succeeded {
                Ok(())
            } else {
                Err(ObjectStoreError::Cancelled)
            };
        };

        let etag = match tokio::time::timeout_at(self.deadline, outcome).await {
            Err(_) => {
                self.upload.cancel();
                return Err(ObjectStoreError::DeadlineExceeded);
            }
            Ok(Err(_)) => return Err(ObjectStoreError::Cancelled),
            Ok(Ok(result)) => result?,
        };

        if let Some(md5) = self.md5.take() {
            let expected = hex::encode(md5.finalize());
            let actual = etag.as_deref().map(extract_etag).unwrap_or_default();
            if actual != expected {
                self.abandoned.store(true, Ordering::Release);
                return Err(ObjectStoreError::ETagMismatch {
                    expected,
                    actual: actual.to_string(),
                });
            }
        }

        metrics::record_upload_bytes(self.written);
        self.succeeded = true;
        Ok(())
    }

    /// Give up on the upload: the transfer is cancelled and the object will
    /// be aborted instead of deleted once the caller context ends
    pub fn abandon(&mut self) {
        self.abandoned.store(true, Ordering::Release);
        self.upload.cancel();
        self.writer.take();
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        if !self.closed {
            self.abandon();
        }
    }
}

impl AsyncWrite for Uploader {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(writer) = this.writer.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "uploader is closed",
            )));
        };

        match Pin::new(writer).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if let Some(md5) = this.md5.as_mut() {
                    md5.update(&buf[..n]);
                }
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

async fn run_upload(
    mut strategy: RemoteStrategy,
    reader: DuplexStream,
    lifetimes: Lifetimes,
    abandoned: Arc<AtomicBool>,
    tx: oneshot::Sender<Outcome>,
) {
    let kind = strategy.kind();
    let started = std::time::Instant::now();
    metrics::OPEN_UPLOADS.inc();

    let outcome = tokio::select! {
        biased;
        _ = lifetimes.upload.cancelled() => Err(ObjectStoreError::Cancelled),
        _ = tokio::time::sleep_until(lifetimes.deadline) => Err(ObjectStoreError::DeadlineExceeded),
        result = strategy.upload(reader) => result,
    };

    metrics::OPEN_UPLOADS.dec();
    metrics::record_upload_duration(kind, started.elapsed().as_secs_f64());

    let succeeded = outcome.is_ok();
    match &outcome {
        Ok(_) => {
            metrics::record_upload_success(kind);
            tracing::debug!(destination = kind, "Remote upload finished");
        }
        Err(e) => {
            metrics::record_upload_failure(kind, e.category());
            tracing::warn!(destination = kind, error = %e, "Remote upload failed");
        }
    }
    // Nobody may be listening any more (uploader dropped).
    let _ = tx.send(outcome);

    lifetimes.cleanup.cancelled().await;

    if succeeded && !abandoned.load(Ordering::Acquire) {
        strategy.delete().await;
    } else {
        strategy.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cleanup_once_claims_once() {
        let once = CleanupOnce::default();
        assert!(once.claim());
        assert!(!once.claim());
        assert!(!once.claim());
    }

    #[test]
    fn test_lifetimes_upload_follows_caller() {
        let caller = CancellationToken::new();
        let lifetimes = Lifetimes::new(&caller, Instant::now() + Duration::from_secs(60));

        assert!(!lifetimes.upload_token().is_cancelled());
        caller.cancel();
        assert!(lifetimes.upload_token().is_cancelled());
        assert!(lifetimes.cleanup_token().is_cancelled());
    }

    #[test]
    fn test_lifetimes_upload_cancel_does_not_release_cleanup() {
        let caller = CancellationToken::new();
        let lifetimes = Lifetimes::new(&caller, Instant::now() + Duration::from_secs(60));

        lifetimes.upload_token().cancel();
        assert!(!lifetimes.cleanup_token().is_cancelled());
        assert!(!caller.is_cancelled());
    }
}
