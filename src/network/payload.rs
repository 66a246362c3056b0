//! Side-channel payload transfer.
//!
//! A message with attached payload data only carries metadata on the control
//! channel: the byte size and the TCP port the sender is listening on. The
//! receiver opens a second connection to that port and streams the bytes over
//! it. Uploads reserve their port from the shared [`PortPool`] before any
//! metadata goes out, accept exactly one connection, and release the port on
//! every path. Transfers are TLS-secured with the same pinning rules as the
//! control channel; here the listening side is the TLS server.

use bytes::BytesMut;
use rustls::pki_types::CertificateDer;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::network::port_pool::ReservedPort;
use crate::network::tls::{TlsError, TlsStack};

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Timeout for the receiver establishing its connection. The uploader's
/// listen timeout comes from the configuration.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Timed out waiting for the payload connection")]
    Timeout,

    #[error("Payload source was reclaimed before the transfer started")]
    Reclaimed,

    #[error("Payload ended early: got {got} of {expected} bytes")]
    Truncated { expected: u64, got: u64 },
}

pub type PayloadSource = Box<dyn AsyncRead + Send + Unpin>;

/// Stream `size` bytes (or everything until EOF when unknown) in 64 KiB
/// chunks. Returns the byte count written.
async fn pump<R, W>(source: &mut R, sink: &mut W, size: Option<u64>) -> Result<u64, PayloadError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(CHUNK_SIZE);
    let mut total: u64 = 0;
    loop {
        let want = match size {
            Some(size) if total >= size => break,
            Some(size) => CHUNK_SIZE.min((size - total) as usize),
            None => CHUNK_SIZE,
        };
        let n = match source.read(&mut buf[..want]).await {
            Ok(n) => n,
            // A dirty close at a known size is a short transfer, not a
            // transport fault.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return match size {
                    Some(expected) => Err(PayloadError::Truncated { expected, got: total }),
                    None => Err(PayloadError::Io(e)),
                };
            }
            Err(e) => return Err(PayloadError::Io(e)),
        };
        if n == 0 {
            match size {
                Some(expected) => {
                    return Err(PayloadError::Truncated { expected, got: total })
                }
                None => break,
            }
        }
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    sink.flush().await?;
    Ok(total)
}

/// One pending outbound payload transfer.
///
/// The source sits in a shared slot until the receiver connects, so a link
/// that closes before the transfer starts can take it back and reattach it
/// to the reclaimed message. Once a connection is accepted the transfer
/// counts as started and is no longer reclaimable.
pub struct PayloadUpload {
    port: Option<ReservedPort>,
    source: Arc<parking_lot::Mutex<Option<PayloadSource>>>,
    size: Option<u64>,
    listen_timeout: Duration,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Detached view of an upload, kept by the link for reclaim bookkeeping
/// after the upload itself moved onto its task.
#[derive(Clone)]
pub struct UploadHandle {
    source: Arc<parking_lot::Mutex<Option<PayloadSource>>>,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl UploadHandle {
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Cancel the waiting upload and take its source back. Fails once the
    /// receiver has connected.
    pub fn reclaim_source(&self) -> Option<PayloadSource> {
        if self.has_started() {
            return None;
        }
        self.cancel.cancel();
        self.source.lock().take()
    }
}

impl PayloadUpload {
    pub fn new(
        port: ReservedPort,
        source: PayloadSource,
        size: Option<u64>,
        listen_timeout: Duration,
    ) -> Self {
        Self {
            port: Some(port),
            source: Arc::new(parking_lot::Mutex::new(Some(source))),
            size,
            listen_timeout,
            started: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> UploadHandle {
        UploadHandle {
            source: Arc::clone(&self.source),
            started: Arc::clone(&self.started),
            cancel: self.cancel.clone(),
        }
    }

    /// The advertised port. Valid until [`spawn`](Self::spawn) consumes the
    /// reservation.
    pub fn port(&self) -> u16 {
        self.port.as_ref().map(|p| p.port()).unwrap_or(0)
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Take the source back for resending elsewhere. Fails once the
    /// receiver has connected.
    pub fn reclaim_source(&self) -> Option<PayloadSource> {
        if self.has_started() {
            return None;
        }
        self.source.lock().take()
    }

    /// Run the transfer on its own task. `on_done` fires exactly once with
    /// the transfer outcome; the port is released when the task finishes.
    pub fn spawn(
        mut self,
        tls: Arc<TlsStack>,
        pinned: Option<CertificateDer<'static>>,
        on_done: impl FnOnce(bool) + Send + 'static,
    ) {
        let source = Arc::clone(&self.source);
        let started = Arc::clone(&self.started);
        let cancel = self.cancel.clone();
        let size = self.size;
        let listen_timeout = self.listen_timeout;
        let port = match self.port.take() {
            Some(p) => p,
            None => {
                on_done(false);
                return;
            }
        };

        tokio::spawn(async move {
            let result =
                run_upload(port, tls, pinned, source, started, cancel, size, listen_timeout)
                    .await;
            match &result {
                Ok(sent) => tracing::debug!("Payload upload finished, {} bytes", sent),
                Err(e) => tracing::warn!("Payload upload failed: {}", e),
            }
            on_done(result.is_ok());
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upload(
    mut port: ReservedPort,
    tls: Arc<TlsStack>,
    pinned: Option<CertificateDer<'static>>,
    source: Arc<parking_lot::Mutex<Option<PayloadSource>>>,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
    size: Option<u64>,
    listen_timeout: Duration,
) -> Result<u64, PayloadError> {
    let listener = port.take_listener()?;
    let accepted = tokio::select! {
        _ = cancel.cancelled() => return Err(PayloadError::Reclaimed),
        accepted = tokio::time::timeout(listen_timeout, listener.accept()) => accepted,
    };
    let (socket, peer) = accepted.map_err(|_| PayloadError::Timeout)??;
    tracing::debug!("Payload receiver connected from {}", peer);

    started.store(true, Ordering::Release);
    let mut stream = match source.lock().take() {
        Some(s) => s,
        None => return Err(PayloadError::Reclaimed),
    };

    let mut secured = tls.upgrade_server(socket, pinned).await?;
    let sent = pump(stream.as_mut(), &mut secured, size).await?;
    secured.shutdown().await?;
    // Close the listener before the pool announces the port free.
    drop(listener);
    drop(port);
    Ok(sent)
}

/// Handle for retrieving the payload attached to an inbound message.
pub struct PayloadDownload {
    peer_ip: IpAddr,
    port: u16,
    size: Option<u64>,
}

impl PayloadDownload {
    pub fn new(peer_ip: IpAddr, port: u16, size: Option<u64>) -> Self {
        Self { peer_ip, port, size }
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Connect to the sender and stream the payload into `sink`. With a
    /// known size the transfer stops exactly there and an early EOF is an
    /// error; with an unknown size a clean EOF ends it.
    pub async fn retrieve<W>(self, tls: &TlsStack, pinned: Option<CertificateDer<'static>>, sink: &mut W) -> Result<u64, PayloadError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let socket = tokio::time::timeout(
            TRANSFER_TIMEOUT,
            TcpStream::connect((self.peer_ip, self.port)),
        )
        .await
        .map_err(|_| PayloadError::Timeout)??;

        let mut secured = tls.upgrade_client(socket, pinned).await?;
        let got = pump(&mut secured, sink, self.size).await?;
        Ok(got)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::port_pool::PortPool;
    use crate::truststore::{MemoryTrustStore, TrustStore};
    use std::io::Cursor;
    use tokio::sync::oneshot;

    fn stacks() -> (Arc<TlsStack>, Arc<TlsStack>) {
        let a = MemoryTrustStore::new("a");
        let b = MemoryTrustStore::new("b");
        (
            Arc::new(TlsStack::new(a.host_identity().unwrap())),
            Arc::new(TlsStack::new(b.host_identity().unwrap())),
        )
    }

    #[tokio::test]
    async fn transfers_known_size_payload() {
        let (up_tls, down_tls) = stacks();
        let pool = PortPool::new(42300..=42305);
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();

        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(data.clone())),
            Some(data.len() as u64),
            TRANSFER_TIMEOUT,
        );
        let port = upload.port();
        let (done_tx, done_rx) = oneshot::channel();
        upload.spawn(up_tls, None, move |ok| {
            let _ = done_tx.send(ok);
        });

        let download = PayloadDownload::new("127.0.0.1".parse().unwrap(), port, Some(data.len() as u64));
        let mut sink = Vec::new();
        let got = download.retrieve(&down_tls, None, &mut sink).await.unwrap();

        assert_eq!(got, data.len() as u64);
        assert_eq!(sink, data);
        assert!(done_rx.await.unwrap());
    }

    #[tokio::test]
    async fn short_stream_reports_truncation() {
        let (up_tls, down_tls) = stacks();
        let pool = PortPool::new(42310..=42315);
        let data = vec![7u8; 64 * 1024];

        // Source holds fewer bytes than the declared size.
        let declared = (data.len() as u64) * 2;
        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(data.clone())),
            Some(declared),
            TRANSFER_TIMEOUT,
        );
        let port = upload.port();
        let (done_tx, done_rx) = oneshot::channel();
        upload.spawn(up_tls, None, move |ok| {
            let _ = done_tx.send(ok);
        });

        let download = PayloadDownload::new("127.0.0.1".parse().unwrap(), port, Some(declared));
        let mut sink = Vec::new();
        let err = download.retrieve(&down_tls, None, &mut sink).await.unwrap_err();
        match err {
            PayloadError::Truncated { expected, got } => {
                assert_eq!(expected, declared);
                assert_eq!(got, data.len() as u64);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!done_rx.await.unwrap());
    }

    #[tokio::test]
    async fn unknown_size_stops_at_clean_eof() {
        let (up_tls, down_tls) = stacks();
        let pool = PortPool::new(42320..=42325);
        let data = vec![3u8; 10_000];

        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(data.clone())),
            None,
            TRANSFER_TIMEOUT,
        );
        let port = upload.port();
        upload.spawn(up_tls, None, |_| {});

        let download = PayloadDownload::new("127.0.0.1".parse().unwrap(), port, None);
        let mut sink = Vec::new();
        let got = download.retrieve(&down_tls, None, &mut sink).await.unwrap();
        assert_eq!(got, data.len() as u64);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn reclaim_before_start_returns_source() {
        let pool = PortPool::new(42330..=42335);
        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(vec![1u8; 100])),
            Some(100),
            TRANSFER_TIMEOUT,
        );
        assert!(!upload.has_started());
        let mut source = upload.reclaim_source().unwrap();
        assert!(upload.reclaim_source().is_none());

        let mut buf = Vec::new();
        source.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 100);
    }

    #[tokio::test]
    async fn spawned_upload_releases_port_when_done() {
        let (up_tls, down_tls) = stacks();
        let pool = PortPool::new(42340..=42340);
        let data = vec![9u8; 512];

        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(data.clone())),
            Some(data.len() as u64),
            TRANSFER_TIMEOUT,
        );
        let port = upload.port();
        assert_eq!(pool.reserve().unwrap_err(), crate::network::port_pool::PortPoolError::Busy);

        let mut released = pool.subscribe();
        upload.spawn(up_tls, None, |_| {});
        let download = PayloadDownload::new("127.0.0.1".parse().unwrap(), port, Some(data.len() as u64));
        let mut sink = Vec::new();
        download.retrieve(&down_tls, None, &mut sink).await.unwrap();

        released.recv().await.unwrap();
        assert!(pool.reserve().is_ok());
    }

    #[tokio::test]
    async fn listen_timeout_fails_the_upload() {
        let (up_tls, _) = stacks();
        let pool = PortPool::new(42350..=42351);
        let upload = PayloadUpload::new(
            pool.reserve().unwrap(),
            Box::new(Cursor::new(vec![0u8; 16])),
            Some(16),
            Duration::from_millis(100),
        );
        let (done_tx, done_rx) = oneshot::channel();
        upload.spawn(up_tls, None, move |ok| {
            let _ = done_tx.send(ok);
        });
        // Nobody connects; the configured listen window expires.
        assert!(!done_rx.await.unwrap());
    }
}
