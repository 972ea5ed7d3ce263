//! JDWP session layer for ddmux.
//!
//! A device exposes one raw byte channel per debuggable process. This crate
//! turns that channel into:
//!
//! - [`JdwpSession`]: one packet at a time in each direction, lazy handshake.
//! - [`SharedJdwpSession`]: the same session fanned out to any number of
//!   [`PacketReceiver`]s, with strictly sequential delivery and a replay
//!   buffer for late subscribers.
//! - [`ReferenceCountedResource`]: lazily created, closed when the last
//!   [`Retained`] guard goes away.

mod codec;
mod error;
mod packet;
mod refcount;
mod session;
mod shared;
mod transport;

pub use codec::{JdwpReader, JdwpWriter};
pub use error::{JdwpError, Result};
pub use packet::{
    next_packet_id, JdwpPacket, PacketHeader, PacketIdGenerator, FLAG_REPLY, HANDSHAKE,
    JDWP_HEADER_LEN,
};
pub use refcount::{AsyncClose, ReferenceCountedResource, Retained};
pub use session::JdwpSession;
pub use shared::{ActivePacketReceiver, PacketReceiver, ReceivedPacket, SharedJdwpSession};
pub use transport::{PacketTransport, StreamTransport};

// The in-memory peer is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
