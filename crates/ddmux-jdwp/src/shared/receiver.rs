use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{Delivery, Inner};
use crate::error::{JdwpError, Result};
use crate::packet::JdwpPacket;

type ActivationHook = Box<dyn FnOnce() + Send>;

/// An inactive subscription to a [`super::SharedJdwpSession`].
pub struct PacketReceiver {
    inner: Arc<Inner>,
    name: Option<String>,
    on_activation: Option<ActivationHook>,
}

impl PacketReceiver {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            name: None,
            on_activation: None,
        }
    }

    /// Name used in diagnostics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runs `hook` when the receiver is activated, before anything is
    /// delivered to it.
    pub fn on_activation(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_activation = Some(Box::new(hook));
        self
    }

    /// Begins consumption.
    ///
    /// In order: runs the activation hook, subscribes to live packets, starts
    /// the session pump if no receiver ever did, and queues the replay buffer
    /// ahead of live packets. Must be called within a tokio runtime.
    pub fn activate(self) -> ActivePacketReceiver {
        if let Some(hook) = self.on_activation {
            hook();
        }

        let name: Arc<str> = Arc::from(self.name.as_deref().unwrap_or("<unnamed>"));
        let (id, replay, live) = self.inner.register(name.clone());
        if live.is_some() {
            self.inner.ensure_pump_started();
        }
        tracing::debug!(
            target: "ddmux.jdwp",
            receiver = %name,
            replay = replay.len(),
            "packet receiver activated"
        );

        ActivePacketReceiver {
            inner: self.inner,
            id,
            name,
            replay: replay.into(),
            live,
        }
    }
}

impl fmt::Debug for PacketReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketReceiver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An activated subscription. Dropping it unsubscribes.
pub struct ActivePacketReceiver {
    inner: Arc<Inner>,
    id: u64,
    name: Arc<str>,
    replay: VecDeque<JdwpPacket>,
    live: Option<mpsc::Receiver<Delivery>>,
}

impl ActivePacketReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next packet: replayed packets first, then live ones.
    ///
    /// Returns `Ok(None)` once the peer closed the connection cleanly, and the
    /// pump failure (or [`JdwpError::Closed`]) otherwise. While the returned
    /// [`ReceivedPacket`] is alive the whole session pump waits, so keep
    /// handling short.
    pub async fn recv(&mut self) -> Result<Option<ReceivedPacket>> {
        if let Some(packet) = self.replay.pop_front() {
            return Ok(Some(ReceivedPacket {
                packet: Arc::new(packet),
                replayed: true,
                done: None,
            }));
        }

        let Some(live) = self.live.as_mut() else {
            return self.inner.termination_result();
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                self.live = None;
                Err(JdwpError::Closed)
            }
            delivery = live.recv() => match delivery {
                Some(Delivery { packet, done }) => Ok(Some(ReceivedPacket {
                    packet,
                    replayed: false,
                    done: Some(done),
                })),
                None => {
                    self.live = None;
                    self.inner.termination_result()
                }
            },
        }
    }
}

impl Drop for ActivePacketReceiver {
    fn drop(&mut self) {
        if self.live.is_some() {
            self.inner.unregister(self.id);
        }
    }
}

impl fmt::Debug for ActivePacketReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePacketReceiver")
            .field("name", &self.name)
            .field("pending_replay", &self.replay.len())
            .finish_non_exhaustive()
    }
}

/// A packet being handled by one receiver. Dropping it lets the pump move on.
pub struct ReceivedPacket {
    packet: Arc<JdwpPacket>,
    replayed: bool,
    done: Option<oneshot::Sender<()>>,
}

impl ReceivedPacket {
    /// `true` when the packet came from the replay buffer.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub fn to_packet(&self) -> JdwpPacket {
        JdwpPacket::clone(&self.packet)
    }
}

impl Deref for ReceivedPacket {
    type Target = JdwpPacket;

    fn deref(&self) -> &JdwpPacket {
        &self.packet
    }
}

impl Drop for ReceivedPacket {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("packet", &*self.packet)
            .field("replayed", &self.replayed)
            .finish()
    }
}
