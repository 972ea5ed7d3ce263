use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

/// Errors produced by the JDWP session layer.
///
/// The type is `Clone` so that a single pump failure can be handed to every
/// active receiver of a shared session.
#[derive(Debug, Clone, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(Arc<io::Error>),
    /// The peer closed the connection on a packet boundary.
    #[error("JDWP connection reached end of stream")]
    EndOfStream,
    #[error("JDWP handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP packet too large ({length} bytes, max {max})")]
    PacketTooLarge { length: usize, max: usize },
    #[error("JDWP transport unavailable: {0}")]
    Transport(String),
    #[error("JDWP operation timed out")]
    Timeout,
    #[error("JDWP session closed")]
    Closed,
    #[error("JDWP operation cancelled")]
    Cancelled,
}

impl From<io::Error> for JdwpError {
    fn from(err: io::Error) -> Self {
        JdwpError::Io(Arc::new(err))
    }
}

impl JdwpError {
    /// `true` for a clean end of stream, which is normal termination rather
    /// than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, JdwpError::EndOfStream)
    }
}
