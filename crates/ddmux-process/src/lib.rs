//! Process discovery for ddmux.
//!
//! A [`ProcessTracker`] follows the JDWP process ids of one device and keeps
//! a [`ProcessHandle`] per live process. Each handle lazily opens a
//! [`ddmux_jdwp::SharedJdwpSession`] and can run a
//! [`ProcessPropertiesCollector`], which asks the VM who it is over DDMS and
//! publishes what it learns as [`ProcessProperties`] snapshots.

mod collector;
mod ddms;
mod device;
mod handle;
mod process_map;
mod properties;
mod tracker;

pub use collector::{CollectorError, CollectorState, CollectorTermination, ProcessPropertiesCollector};
pub use ddms::{
    is_ddms_command, ApnmChunk, ChunkType, DdmsChunk, DdmsChunkCodec, DdmsError, HeloChunk,
    WaitChunk, DDMS_COMMAND, DDMS_COMMAND_SET, DDMS_PROTOCOL_VERSION,
};
pub use device::{
    parse_process_ids, read_track_jdwp_message, track_jdwp_stream, DeviceError,
    DeviceProcessSource, ProcessIdList, ProcessIdStream,
};
pub use handle::ProcessHandle;
pub use process_map::{ProcessIdDelta, ProcessMap};
pub use properties::{filter_early_name, ProcessProperties, ProcessPropertiesCell, EARLY_PROCESS_NAMES};
pub use tracker::{ProcessTracker, ProcessTrackerEvent, TrackerError};

#[cfg(any(test, feature = "test-support"))]
pub mod mock;
