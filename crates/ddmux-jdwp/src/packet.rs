use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{JdwpError, Result};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const JDWP_HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// A single JDWP packet.
///
/// Commands carry `command_set`/`command` and a zero `error_code`; replies
/// carry `error_code` and zero command fields. The payload is owned, so a
/// clone is an independent copy (this is what the replay buffer stores).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JdwpPacket {
    pub id: u32,
    pub flags: u8,
    pub command_set: u8,
    pub command: u8,
    pub error_code: u16,
    pub payload: Vec<u8>,
}

impl JdwpPacket {
    pub fn command(id: u32, command_set: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: 0,
            command_set,
            command,
            error_code: 0,
            payload,
        }
    }

    pub fn reply(id: u32, error_code: u16, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: FLAG_REPLY,
            command_set: 0,
            command: 0,
            error_code,
            payload,
        }
    }

    pub fn is_reply(&self) -> bool {
        (self.flags & FLAG_REPLY) != 0
    }

    pub fn is_command(&self) -> bool {
        !self.is_reply()
    }

    /// Total on-the-wire length, header included.
    pub fn length(&self) -> usize {
        JDWP_HEADER_LEN + self.payload.len()
    }

    pub fn header(&self) -> Result<PacketHeader> {
        let length = u32::try_from(self.length())
            .map_err(|_| JdwpError::Protocol("packet length overflows u32".to_string()))?;
        Ok(PacketHeader {
            length,
            id: self.id,
            flags: self.flags,
            command_set: self.command_set,
            command: self.command,
            error_code: self.error_code,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(self.length());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// The fixed 11-byte packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub id: u32,
    pub flags: u8,
    pub command_set: u8,
    pub command: u8,
    pub error_code: u16,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8; JDWP_HEADER_LEN]) -> Self {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let flags = bytes[8];
        if (flags & FLAG_REPLY) != 0 {
            Self {
                length,
                id,
                flags,
                command_set: 0,
                command: 0,
                error_code: u16::from_be_bytes([bytes[9], bytes[10]]),
            }
        } else {
            Self {
                length,
                id,
                flags,
                command_set: bytes[9],
                command: bytes[10],
                error_code: 0,
            }
        }
    }

    pub fn to_bytes(&self) -> [u8; JDWP_HEADER_LEN] {
        let mut out = [0u8; JDWP_HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        if (self.flags & FLAG_REPLY) != 0 {
            out[9..11].copy_from_slice(&self.error_code.to_be_bytes());
        } else {
            out[9] = self.command_set;
            out[10] = self.command;
        }
        out
    }

    /// Number of payload bytes that follow the header, validated against
    /// `max_packet_bytes`.
    pub fn payload_len(&self, max_packet_bytes: usize) -> Result<usize> {
        let length = self.length as usize;
        if length < JDWP_HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "invalid packet length {length} (header is {JDWP_HEADER_LEN} bytes)"
            )));
        }
        if length > max_packet_bytes {
            return Err(JdwpError::PacketTooLarge {
                length,
                max: max_packet_bytes,
            });
        }
        Ok(length - JDWP_HEADER_LEN)
    }

    pub fn into_packet(self, payload: Vec<u8>) -> JdwpPacket {
        JdwpPacket {
            id: self.id,
            flags: self.flags,
            command_set: self.command_set,
            command: self.command,
            error_code: self.error_code,
            payload,
        }
    }
}

/// Thread-safe monotonic packet id source. Id `0` is never handed out.
#[derive(Debug)]
pub struct PacketIdGenerator {
    next: AtomicU32,
}

impl PacketIdGenerator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static PACKET_IDS: PacketIdGenerator = PacketIdGenerator::new();

/// Next id from the process-wide generator shared by every session.
pub fn next_packet_id() -> u32 {
    PACKET_IDS.next_id()
}
