use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ddmux_config::JdwpConfig;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::error::{JdwpError, Result};
use crate::packet::{next_packet_id, JdwpPacket, PacketHeader, HANDSHAKE, JDWP_HEADER_LEN};
use crate::transport::PacketTransport;

/// One JDWP conversation over one transport.
///
/// Sends and receives are each serialized (one packet at a time per
/// direction) but independent of each other, so a pending `receive` never
/// blocks a `send`. The handshake runs lazily, exactly once, before the first
/// packet in either direction.
///
/// A write that fails, or a read that fails after the first byte of a packet,
/// leaves the byte stream out of sync with the peer. The session then counts
/// as broken: every later `send` and `receive` fails with the same cause.
pub struct JdwpSession {
    transport: Arc<dyn PacketTransport>,
    config: JdwpConfig,
    handshake: OnceCell<()>,
    send_lock: Mutex<()>,
    receive_lock: Mutex<()>,
    closed: AtomicBool,
    broken: parking_lot::Mutex<Option<JdwpError>>,
    broken_signal: CancellationToken,
}

impl JdwpSession {
    pub fn new(transport: Arc<dyn PacketTransport>, config: JdwpConfig) -> Self {
        Self {
            transport,
            config,
            handshake: OnceCell::new(),
            send_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            broken: parking_lot::Mutex::new(None),
            broken_signal: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &JdwpConfig {
        &self.config
    }

    pub fn next_packet_id(&self) -> u32 {
        next_packet_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The failure that desynchronized the byte stream, if any.
    pub fn broken_cause(&self) -> Option<JdwpError> {
        self.broken.lock().clone()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(JdwpError::Closed);
        }
        match self.broken_cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Records the first desynchronizing failure and returns it. Causes are
    /// never [`JdwpError::Timeout`], which callers treat as retryable.
    fn mark_broken(&self, cause: JdwpError) -> JdwpError {
        let mut broken = self.broken.lock();
        match &*broken {
            Some(first) => first.clone(),
            None => {
                tracing::warn!(
                    target: "ddmux.jdwp",
                    error = %cause,
                    "JDWP byte stream out of sync; session unusable"
                );
                *broken = Some(cause.clone());
                self.broken_signal.cancel();
                cause
            }
        }
    }

    async fn ensure_handshake(&self) -> Result<()> {
        self.handshake
            .get_or_try_init(|| self.perform_handshake())
            .await
            .map(|_| ())
    }

    async fn perform_handshake(&self) -> Result<()> {
        let exchange = async {
            self.transport.write(HANDSHAKE, None).await?;

            let mut reply = [0u8; HANDSHAKE.len()];
            let read = read_fully(&*self.transport, &mut reply, None).await?;
            if read < reply.len() {
                return Err(JdwpError::HandshakeFailed(format!(
                    "connection closed after {read} handshake bytes"
                )));
            }
            if reply != *HANDSHAKE {
                return Err(JdwpError::HandshakeFailed(format!(
                    "invalid handshake reply: {:?}",
                    String::from_utf8_lossy(&reply)
                )));
            }
            Ok(())
        };

        tokio::time::timeout(self.config.handshake_timeout(), exchange)
            .await
            .map_err(|_| JdwpError::HandshakeFailed("timed out".to_string()))??;
        tracing::debug!(target: "ddmux.jdwp", "JDWP handshake completed");
        Ok(())
    }

    /// Writes one fully formed packet.
    ///
    /// Any write failure, a timeout included, breaks the session: part of the
    /// packet may already be on the wire. Dropping the future mid-write does
    /// the same.
    pub async fn send(&self, packet: &JdwpPacket) -> Result<()> {
        self.ensure_usable()?;
        let length = packet.length();
        if length > self.config.max_packet_bytes {
            return Err(JdwpError::PacketTooLarge {
                length,
                max: self.config.max_packet_bytes,
            });
        }
        let bytes = packet.encode()?;

        self.ensure_handshake().await?;
        let _guard = self.send_lock.lock().await;
        self.ensure_usable()?;

        let mut in_flight = InFlight::new(self, "send");
        let written = self
            .transport
            .write(&bytes, Some(self.config.write_timeout()))
            .await;
        in_flight.finish();
        if let Err(err) = written {
            return Err(self.mark_broken(match err {
                JdwpError::Timeout => {
                    JdwpError::Protocol("timed out inside a packet write".to_string())
                }
                other => other,
            }));
        }
        tracing::trace!(
            target: "ddmux.jdwp",
            id = packet.id,
            reply = packet.is_reply(),
            length,
            "sent packet"
        );
        Ok(())
    }

    /// Waits for the next packet.
    ///
    /// Fails with [`JdwpError::EndOfStream`] when the peer closes the
    /// connection between packets; a close in the middle of a packet is a
    /// protocol error.
    ///
    /// With a read timeout configured, [`JdwpError::Timeout`] means no byte
    /// of a new packet arrived in time; the stream is still in sync and the
    /// caller may simply receive again. A stall inside a packet breaks the
    /// session instead.
    pub async fn receive(&self) -> Result<JdwpPacket> {
        self.ensure_usable()?;
        self.ensure_handshake().await?;
        let _guard = self.receive_lock.lock().await;
        self.ensure_usable()?;

        tokio::select! {
            biased;
            _ = self.broken_signal.cancelled() => {
                Err(self.broken_cause().unwrap_or(JdwpError::Closed))
            }
            res = self.receive_packet() => res,
        }
    }

    async fn receive_packet(&self) -> Result<JdwpPacket> {
        let timeout = self.config.read_timeout();

        let mut header = [0u8; JDWP_HEADER_LEN];
        let first = self.transport.read(&mut header, timeout).await?;
        if first == 0 {
            return Err(JdwpError::EndOfStream);
        }

        let mut in_flight = InFlight::new(self, "receive");
        let packet = self.receive_rest(&mut header, first, timeout).await;
        in_flight.finish();
        let packet = packet.map_err(|err| {
            self.mark_broken(match err {
                JdwpError::Timeout => {
                    JdwpError::Protocol("timed out inside a packet read".to_string())
                }
                other => other,
            })
        })?;

        tracing::trace!(
            target: "ddmux.jdwp",
            id = packet.id,
            reply = packet.is_reply(),
            length = packet.length(),
            "received packet"
        );
        Ok(packet)
    }

    /// Reads the remainder of a packet whose first `filled` header bytes are
    /// already in `header`.
    async fn receive_rest(
        &self,
        header: &mut [u8; JDWP_HEADER_LEN],
        filled: usize,
        timeout: Option<std::time::Duration>,
    ) -> Result<JdwpPacket> {
        let read = filled + read_fully(&*self.transport, &mut header[filled..], timeout).await?;
        if read < header.len() {
            return Err(JdwpError::Protocol(format!(
                "connection closed inside packet header ({read} of {JDWP_HEADER_LEN} bytes)"
            )));
        }

        let header = PacketHeader::parse(&*header);
        let payload_len = header.payload_len(self.config.max_packet_bytes)?;
        let mut payload = vec![0u8; payload_len];
        let read = read_fully(&*self.transport, &mut payload, timeout).await?;
        if read < payload_len {
            return Err(JdwpError::Protocol(format!(
                "connection closed inside packet payload ({read} of {payload_len} bytes)"
            )));
        }
        Ok(header.into_packet(payload))
    }

    /// Closes the transport. Only the first call reaches the transport.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(target: "ddmux.jdwp", "closing JDWP session");
        self.transport.close().await
    }
}

/// Breaks the session if dropped before [`finish`](Self::finish), which
/// happens when a caller abandons a half-done transfer.
struct InFlight<'a> {
    session: &'a JdwpSession,
    what: &'static str,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn new(session: &'a JdwpSession, what: &'static str) -> Self {
        Self {
            session,
            what,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.session.is_closed() {
            self.session.mark_broken(JdwpError::Protocol(format!(
                "{} abandoned inside a packet",
                self.what
            )));
        }
    }
}

/// Fills `buf` unless the stream ends first; returns the number of bytes read.
async fn read_fully(
    transport: &dyn PacketTransport,
    buf: &mut [u8],
    timeout: Option<std::time::Duration>,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..], timeout).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
