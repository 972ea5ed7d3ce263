//! One [`JdwpSession`] shared by many packet receivers.
//!
//! A single pump task reads packets off the session and hands each one to
//! every active receiver in activation order. The pump waits for a receiver
//! to finish with a packet (drop its [`ReceivedPacket`]) before moving to the
//! next receiver, so at most one receiver is ever handling a packet and the
//! global delivery order matches arrival order.
//!
//! Packets recorded with [`SharedJdwpSession::add_replay_packet`] are handed
//! to receivers activated *after* the call, before any live packet. Receivers
//! that were already active when a packet was added do not get it again.
//!
//! Replay is catch-up, not live traffic: a receiver reads its replayed
//! packets from its own buffer without waiting for the pump. The one-handler
//! rule above covers live packets only, so a late receiver may handle a
//! replayed packet while another receiver handles a live one.

mod receiver;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{JdwpError, Result};
use crate::packet::JdwpPacket;
use crate::refcount::AsyncClose;
use crate::session::JdwpSession;

pub use receiver::{ActivePacketReceiver, PacketReceiver, ReceivedPacket};

/// Handed from the pump to one receiver; `done` fires when the receiver is
/// finished with the packet.
struct Delivery {
    packet: Arc<JdwpPacket>,
    done: oneshot::Sender<()>,
}

struct ReceiverSlot {
    id: u64,
    name: Arc<str>,
    deliveries: mpsc::Sender<Delivery>,
}

#[derive(Clone, Debug)]
enum Termination {
    EndOfStream,
    Failed(JdwpError),
    Closed,
}

struct State {
    replay: Vec<JdwpPacket>,
    receivers: Vec<ReceiverSlot>,
    termination: Option<Termination>,
}

struct Inner {
    session: JdwpSession,
    state: Mutex<State>,
    pump_started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    next_receiver_id: AtomicU64,
}

/// Cheaply cloneable handle to a shared JDWP session.
#[derive(Clone)]
pub struct SharedJdwpSession {
    inner: Arc<Inner>,
}

impl SharedJdwpSession {
    pub fn new(session: JdwpSession) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                state: Mutex::new(State {
                    replay: Vec::new(),
                    receivers: Vec::new(),
                    termination: None,
                }),
                pump_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                next_receiver_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn next_packet_id(&self) -> u32 {
        self.inner.session.next_packet_id()
    }

    /// Sends a packet on a session-owned task.
    ///
    /// Dropping the returned future (for example on a caller timeout) only
    /// stops waiting; the write itself still completes, so the stream is never
    /// left with half a packet.
    pub async fn send_packet(&self, packet: JdwpPacket) -> Result<()> {
        if self.is_closed() {
            return Err(JdwpError::Closed);
        }
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => Err(JdwpError::Closed),
                res = inner.session.send(&packet) => res,
            }
        });
        task.await
            .map_err(|err| JdwpError::Protocol(format!("send task failed: {err}")))?
    }

    /// Returns an inactive receiver; nothing is delivered until it is
    /// [activated](PacketReceiver::activate).
    pub fn new_packet_receiver(&self) -> PacketReceiver {
        PacketReceiver::new(self.inner.clone())
    }

    /// Records an owned copy of `packet` for receivers activated from now on.
    pub fn add_replay_packet(&self, packet: JdwpPacket) {
        let mut state = self.inner.state.lock();
        tracing::trace!(
            target: "ddmux.jdwp",
            id = packet.id,
            replay_len = state.replay.len() + 1,
            "recorded replay packet"
        );
        state.replay.push(packet);
    }

    pub fn replay_len(&self) -> usize {
        self.inner.state.lock().replay.len()
    }

    pub fn active_receivers(&self) -> usize {
        self.inner.state.lock().receivers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// `true` once the pump stopped (end of stream, failure or close).
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().termination.is_some()
    }

    /// Stops the pump, ends every active receiver with [`JdwpError::Closed`]
    /// and closes the transport. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // A pump must never start after close.
        self.inner.pump_started.store(true, Ordering::Release);
        self.inner.shutdown.cancel();
        self.inner.terminate(Termination::Closed);
        tracing::debug!(target: "ddmux.jdwp", "shared JDWP session closed");
        self.inner.session.close().await
    }
}

impl AsyncClose for SharedJdwpSession {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = SharedJdwpSession::close(self).await {
                tracing::warn!(target: "ddmux.jdwp", error = %err, "failed to close JDWP session");
            }
        })
    }
}

impl Inner {
    /// Registers a receiver, returning the replay snapshot it must see first
    /// and its live channel (none when the session already terminated).
    fn register(
        &self,
        name: Arc<str>,
    ) -> (u64, Vec<JdwpPacket>, Option<mpsc::Receiver<Delivery>>) {
        let id = self.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let replay = state.replay.clone();
        if state.termination.is_some() {
            return (id, replay, None);
        }
        let (tx, rx) = mpsc::channel(1);
        state.receivers.push(ReceiverSlot {
            id,
            name,
            deliveries: tx,
        });
        (id, replay, Some(rx))
    }

    fn unregister(&self, id: u64) {
        self.state.lock().receivers.retain(|slot| slot.id != id);
    }

    fn ensure_pump_started(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: "ddmux.jdwp", "starting JDWP pump");
        tokio::spawn(pump(self.clone()));
    }

    fn terminate(&self, termination: Termination) {
        let receivers = {
            let mut state = self.state.lock();
            if state.termination.is_none() {
                state.termination = Some(termination);
            }
            std::mem::take(&mut state.receivers)
        };
        // Dropping the senders ends every receiver's live stream.
        drop(receivers);
    }

    fn termination_result(&self) -> Result<Option<ReceivedPacket>> {
        match self.state.lock().termination.clone() {
            Some(Termination::EndOfStream) => Ok(None),
            Some(Termination::Failed(err)) => Err(err),
            Some(Termination::Closed) | None => Err(JdwpError::Closed),
        }
    }
}

async fn pump(inner: Arc<Inner>) {
    let termination = loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break Termination::Closed,
            res = inner.session.receive() => res,
        };
        let packet = match received {
            Ok(packet) => Arc::new(packet),
            Err(JdwpError::EndOfStream) => break Termination::EndOfStream,
            // Idle between packets; the stream is still in sync.
            Err(JdwpError::Timeout) => continue,
            Err(err) => break Termination::Failed(err),
        };

        let targets: Vec<(u64, Arc<str>, mpsc::Sender<Delivery>)> = inner
            .state
            .lock()
            .receivers
            .iter()
            .map(|slot| (slot.id, slot.name.clone(), slot.deliveries.clone()))
            .collect();

        for (id, name, deliveries) in targets {
            let (done_tx, done_rx) = oneshot::channel();
            let delivery = Delivery {
                packet: packet.clone(),
                done: done_tx,
            };
            let handled = tokio::select! {
                _ = inner.shutdown.cancelled() => None,
                handled = async {
                    deliveries.send(delivery).await.ok()?;
                    done_rx.await.ok()
                } => Some(handled.is_some()),
            };
            match handled {
                None => break,
                Some(true) => {}
                Some(false) => {
                    tracing::debug!(
                        target: "ddmux.jdwp",
                        receiver = %name,
                        "receiver went away; unsubscribing"
                    );
                    inner.unregister(id);
                }
            }
        }
    };

    match &termination {
        Termination::EndOfStream => {
            tracing::debug!(target: "ddmux.jdwp", "JDWP pump reached end of stream")
        }
        Termination::Failed(err) => {
            tracing::warn!(target: "ddmux.jdwp", error = %err, "JDWP pump failed")
        }
        Termination::Closed => tracing::debug!(target: "ddmux.jdwp", "JDWP pump stopped"),
    }
    inner.terminate(termination);
}
