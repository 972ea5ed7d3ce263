//! The device side: which JDWP processes exist, and how to reach one.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use ddmux_jdwp::PacketTransport;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub type ProcessIdList = BTreeSet<u32>;

/// Snapshots of the device's JDWP process ids. The stream ending, or
/// yielding an error, means the subscription is over.
pub type ProcessIdStream = BoxStream<'static, Result<ProcessIdList, DeviceError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("process tracking failed: {0}")]
    Tracking(String),
    #[error("cannot open JDWP channel to pid {pid}: {message}")]
    OpenJdwp { pid: u32, message: String },
    #[error("malformed track-jdwp message: {0}")]
    Malformed(String),
    #[error("device I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

/// One device as seen by a [`crate::ProcessTracker`].
pub trait DeviceProcessSource: Send + Sync + 'static {
    fn serial(&self) -> &str;

    /// Subscribes to process id snapshots (adb `track-jdwp`).
    fn track_processes(&self) -> BoxFuture<'_, Result<ProcessIdStream, DeviceError>>;

    /// Asked after a subscription ends, independently of how it ended.
    fn is_reachable(&self) -> BoxFuture<'_, bool>;

    /// Opens a raw JDWP channel to `pid` (adb `jdwp:<pid>`). Only one such
    /// channel per process can be open at a time.
    fn open_jdwp(&self, pid: u32) -> BoxFuture<'_, Result<Arc<dyn PacketTransport>, DeviceError>>;
}

/// Parses the body of one `track-jdwp` message: one decimal pid per line.
/// Lines that are not pids are skipped.
pub fn parse_process_ids(body: &str) -> ProcessIdList {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(target: "ddmux.process", line, error = %err, "skipping invalid pid");
                None
            }
        })
        .collect()
}

/// Reads one length-prefixed `track-jdwp` message (four hex digits, then
/// the body). Returns `None` on a clean end of stream.
pub async fn read_track_jdwp_message<R>(reader: &mut R) -> Result<Option<ProcessIdList>, DeviceError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DeviceError::Malformed(format!(
                "stream ended inside length prefix ({filled} of 4 bytes)"
            )));
        }
        filled += n;
    }

    let len = std::str::from_utf8(&prefix)
        .ok()
        .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        .ok_or_else(|| DeviceError::Malformed(format!("invalid length prefix {prefix:?}")))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            DeviceError::Malformed(format!("stream ended inside a {len} byte message"))
        }
        _ => DeviceError::from(err),
    })?;
    Ok(Some(parse_process_ids(&String::from_utf8_lossy(&body))))
}

/// Turns a `track-jdwp` byte stream into a [`ProcessIdStream`]. The stream
/// stops after the first error.
pub fn track_jdwp_stream<R>(reader: R) -> ProcessIdStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        match read_track_jdwp_message(&mut reader).await {
            Ok(Some(ids)) => Some((Ok(ids), Some(reader))),
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}
