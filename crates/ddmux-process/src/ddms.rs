//! DDMS chunks carried inside JDWP packets.
//!
//! Only the chunk envelope (`type:u32`, `length:u32`, payload) is handled
//! here. Payload layouts belong to a [`DdmsChunkCodec`].

use std::fmt;

use ddmux_jdwp::JdwpPacket;
use thiserror::Error;

pub const DDMS_COMMAND_SET: u8 = 0xC7;
pub const DDMS_COMMAND: u8 = 0x01;
pub const DDMS_PROTOCOL_VERSION: u32 = 1;

const CHUNK_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DdmsError {
    #[error("DDMS chunk truncated: {0}")]
    Truncated(String),
    #[error("malformed {chunk} chunk: {message}")]
    Malformed { chunk: ChunkType, message: String },
}

impl DdmsError {
    pub fn malformed(chunk: ChunkType, err: impl fmt::Display) -> Self {
        DdmsError::Malformed {
            chunk,
            message: err.to_string(),
        }
    }
}

/// Four-character DDMS chunk tag, stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkType(u32);

impl ChunkType {
    pub const HELO: ChunkType = ChunkType::from_tag(b"HELO");
    pub const FEAT: ChunkType = ChunkType::from_tag(b"FEAT");
    pub const REAQ: ChunkType = ChunkType::from_tag(b"REAQ");
    pub const WAIT: ChunkType = ChunkType::from_tag(b"WAIT");
    pub const APNM: ChunkType = ChunkType::from_tag(b"APNM");
    pub const EXIT: ChunkType = ChunkType::from_tag(b"EXIT");
    pub const FAIL: ChunkType = ChunkType::from_tag(b"FAIL");

    pub const fn from_tag(tag: &[u8; 4]) -> Self {
        ChunkType(u32::from_be_bytes(*tag))
    }

    pub const fn from_raw(raw: u32) -> Self {
        ChunkType(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_be_bytes() {
            let c = if byte.is_ascii_graphic() { byte as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({self})")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdmsChunk {
    pub chunk_type: ChunkType,
    pub payload: Vec<u8>,
}

impl DdmsChunk {
    pub fn new(chunk_type: ChunkType, payload: Vec<u8>) -> Self {
        Self {
            chunk_type,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.chunk_type.raw().to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses the first chunk in `bytes`. Trailing bytes are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, DdmsError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(DdmsError::Truncated(format!(
                "{} bytes, need {CHUNK_HEADER_LEN} for the chunk header",
                bytes.len()
            )));
        }
        let chunk_type = ChunkType::from_raw(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]));
        let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let body = &bytes[CHUNK_HEADER_LEN..];
        if body.len() < length {
            return Err(DdmsError::Truncated(format!(
                "{chunk_type} chunk announces {length} bytes, {} present",
                body.len()
            )));
        }
        Ok(Self::new(chunk_type, body[..length].to_vec()))
    }

    /// The chunk inside a DDMS packet, or `None` for an empty payload (the VM
    /// declined to answer).
    pub fn from_packet(packet: &JdwpPacket) -> Result<Option<Self>, DdmsError> {
        if packet.payload.is_empty() {
            return Ok(None);
        }
        Self::parse(&packet.payload).map(Some)
    }

    pub fn into_command(self, id: u32) -> JdwpPacket {
        JdwpPacket::command(id, DDMS_COMMAND_SET, DDMS_COMMAND, self.encode())
    }
}

pub fn is_ddms_command(packet: &JdwpPacket) -> bool {
    packet.is_command() && packet.command_set == DDMS_COMMAND_SET && packet.command == DDMS_COMMAND
}

/// Decoded HELO reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeloChunk {
    pub protocol_version: u32,
    pub pid: u32,
    pub vm_identifier: String,
    pub process_name: String,
    pub user_id: Option<i32>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub is_native_debuggable: Option<bool>,
    pub package_name: Option<String>,
}

/// Decoded APNM command: the VM learned its application name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApnmChunk {
    pub process_name: String,
    pub user_id: Option<i32>,
    pub package_name: Option<String>,
}

/// Decoded WAIT command: the VM is waiting for a debugger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitChunk {
    pub reason: u8,
}

/// Payload layouts of the chunks the property collector exchanges.
pub trait DdmsChunkCodec: Send + Sync + 'static {
    fn helo_request(&self, protocol_version: u32) -> DdmsChunk;
    fn feat_request(&self) -> DdmsChunk;
    fn reaq_request(&self) -> DdmsChunk;

    fn decode_helo(&self, payload: &[u8]) -> Result<HeloChunk, DdmsError>;
    fn decode_feat(&self, payload: &[u8]) -> Result<Vec<String>, DdmsError>;
    fn decode_reaq(&self, payload: &[u8]) -> Result<bool, DdmsError>;
    fn decode_apnm(&self, payload: &[u8]) -> Result<ApnmChunk, DdmsError>;
    fn decode_wait(&self, payload: &[u8]) -> Result<WaitChunk, DdmsError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chunk_type_displays_ascii_tag() {
        assert_eq!(ChunkType::HELO.to_string(), "HELO");
        assert_eq!(ChunkType::HELO.raw(), 0x48454C4F);
        assert_eq!(ChunkType::from_raw(0x4100_0001).to_string(), "A???");
        assert_eq!(format!("{:?}", ChunkType::WAIT), "ChunkType(WAIT)");
    }

    #[test]
    fn command_packet_carries_chunk_envelope() {
        let packet = DdmsChunk::new(ChunkType::HELO, vec![0, 0, 0, 1]).into_command(42);
        assert!(is_ddms_command(&packet));
        assert_eq!(packet.id, 42);
        assert_eq!(
            packet.payload,
            vec![b'H', b'E', b'L', b'O', 0, 0, 0, 4, 0, 0, 0, 1]
        );
        assert_eq!(
            DdmsChunk::from_packet(&packet).unwrap(),
            Some(DdmsChunk::new(ChunkType::HELO, vec![0, 0, 0, 1]))
        );
    }

    #[test]
    fn empty_reply_has_no_chunk() {
        let reply = JdwpPacket::reply(1, 0, Vec::new());
        assert_eq!(DdmsChunk::from_packet(&reply).unwrap(), None);
        assert!(!is_ddms_command(&reply));
    }

    #[test]
    fn truncated_chunks_are_rejected() {
        assert!(matches!(
            DdmsChunk::parse(b"HEL"),
            Err(DdmsError::Truncated(_))
        ));
        assert!(matches!(
            DdmsChunk::parse(&[b'F', b'E', b'A', b'T', 0, 0, 0, 9, 1, 2]),
            Err(DdmsError::Truncated(_))
        ));
    }

    #[test]
    fn trailing_bytes_after_first_chunk_are_ignored() {
        let mut bytes = DdmsChunk::new(ChunkType::WAIT, vec![1]).encode();
        bytes.extend_from_slice(&DdmsChunk::new(ChunkType::EXIT, vec![0; 4]).encode());
        assert_eq!(
            DdmsChunk::parse(&bytes).unwrap(),
            DdmsChunk::new(ChunkType::WAIT, vec![1])
        );
    }
}
