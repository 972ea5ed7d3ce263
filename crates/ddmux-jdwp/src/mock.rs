//! In-memory test doubles for the JDWP session layer.
//!
//! [`mock_connection`] returns a [`StreamTransport`] wired to a
//! [`MockJdwpPeer`], which plays the VM side of the connection: it answers the
//! handshake and reads/writes raw packets.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::Result;
use crate::packet::{JdwpPacket, PacketHeader, HANDSHAKE, JDWP_HEADER_LEN};
use crate::transport::{PacketTransport, StreamTransport};

const DUPLEX_BUFFER: usize = 64 * 1024;

pub fn mock_connection() -> (StreamTransport<DuplexStream>, MockJdwpPeer) {
    mock_connection_with_capacity(DUPLEX_BUFFER)
}

/// Like [`mock_connection`], with `capacity` bytes of buffering per
/// direction. A small capacity makes writes stall until the peer reads.
pub fn mock_connection_with_capacity(
    capacity: usize,
) -> (StreamTransport<DuplexStream>, MockJdwpPeer) {
    let (client, server) = tokio::io::duplex(capacity);
    (StreamTransport::new(client), MockJdwpPeer { stream: server })
}

/// VM side of an in-memory JDWP connection. Dropping it closes the
/// connection, which the client observes as a clean end of stream.
pub struct MockJdwpPeer {
    stream: DuplexStream,
}

impl MockJdwpPeer {
    /// Reads the debugger's handshake and echoes it back.
    pub async fn accept_handshake(&mut self) -> io::Result<()> {
        let mut buf = [0u8; HANDSHAKE.len()];
        self.stream.read_exact(&mut buf).await?;
        if buf != *HANDSHAKE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected handshake {:?}", String::from_utf8_lossy(&buf)),
            ));
        }
        self.stream.write_all(HANDSHAKE).await
    }

    /// Reads the next packet, or `None` once the client closed the connection.
    pub async fn read_packet(&mut self) -> io::Result<Option<JdwpPacket>> {
        let mut header = [0u8; JDWP_HEADER_LEN];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let header = PacketHeader::parse(&header);
        let payload_len = header
            .payload_len(usize::MAX)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload).await?;
        Ok(Some(header.into_packet(payload)))
    }

    pub async fn send_packet(&mut self, packet: &JdwpPacket) -> io::Result<()> {
        let bytes = packet
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        self.stream.write_all(&bytes).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf).await.map(|_| ())
    }
}

/// Shared view of how many times a [`CountingTransport`] was closed.
#[derive(Clone, Debug, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps a transport and counts `close` calls that reach it.
pub struct CountingTransport<T> {
    inner: T,
    closes: CloseCounter,
}

impl<T: PacketTransport> CountingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            closes: CloseCounter::default(),
        }
    }

    pub fn close_count(&self) -> CloseCounter {
        self.closes.clone()
    }
}

impl<T: PacketTransport> PacketTransport for CountingTransport<T> {
    fn read<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<usize>> {
        self.inner.read(buf, timeout)
    }

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> BoxFuture<'a, Result<()>> {
        self.inner.write(buf, timeout)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}
