use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{JdwpError, Result};

/// Duplex byte channel underneath a [`crate::JdwpSession`].
///
/// `read` and `write` may be called concurrently (one reader, one writer).
/// `read` returns `Ok(0)` for a clean end of stream, which is distinct from
/// [`JdwpError::Timeout`] and from hard I/O errors. `close` must be idempotent.
pub trait PacketTransport: Send + Sync + 'static {
    fn read<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<usize>>;

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> BoxFuture<'a, Result<()>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// [`PacketTransport`] over any tokio byte stream, such as the TCP socket of an
/// `adb forward tcp:<port> jdwp:<pid>` or an in-memory duplex in tests.
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: CancellationToken,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl StreamTransport<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream))
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| JdwpError::Timeout)?
            .map_err(JdwpError::from),
        None => fut.await.map_err(JdwpError::from),
    }
}

impl<S> PacketTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn read<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(0);
            }
            let mut reader = self.reader.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => Ok(0),
                res = with_timeout(timeout, reader.read(buf)) => res,
            }
        })
    }

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(JdwpError::Closed);
            }
            let mut writer = self.writer.lock().await;
            with_timeout(timeout, async {
                writer.write_all(buf).await?;
                writer.flush().await
            })
            .await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(());
            }
            self.closed.cancel();
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(target: "ddmux.jdwp", error = %err, "transport shutdown failed");
            }
            Ok(())
        })
    }
}
