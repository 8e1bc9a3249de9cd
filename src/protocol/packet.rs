use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Typed message header: 1 byte tag + 4 bytes length (length includes itself)
pub const MESSAGE_HEADER_SIZE: usize = 5;
/// Startup message header: 4 bytes length, no tag
pub const STARTUP_HEADER_SIZE: usize = 4;
/// Largest typed message accepted from either side
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;
/// Largest typed message accepted from a client that has not logged in yet
pub const MAX_LOGIN_MESSAGE_SIZE: usize = 10_000;
/// Most buffer space reserved ahead of bytes actually received
pub const READ_RESERVE_CHUNK: usize = 8 * 1024;
/// Largest startup packet accepted from a client
pub const MAX_STARTUP_SIZE: usize = 10_000;

/// A typed PostgreSQL v3 protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Encode message to bytes (tag + length + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MESSAGE_HEADER_SIZE + self.payload.len());
        dst.put_u8(self.tag);
        dst.put_i32((self.payload.len() + 4) as i32);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode a message, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> io::Result<Option<Self>> {
        Self::decode_limited(src, MAX_MESSAGE_SIZE)
    }

    /// Decode with an explicit frame limit. The buffer grows with the bytes
    /// received, never by more than [`READ_RESERVE_CHUNK`] ahead of them.
    pub fn decode_limited(src: &mut BytesMut, max_len: usize) -> io::Result<Option<Self>> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 || len as usize > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid message length {} for tag '{}'", len, tag as char),
            ));
        }

        let total_len = 1 + len as usize;
        if src.len() < total_len {
            src.reserve((total_len - src.len()).min(READ_RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(MESSAGE_HEADER_SIZE);
        let payload = src.split_to(len as usize - 4).freeze();

        Ok(Some(Self { tag, payload }))
    }
}

/// Decode an untyped startup-phase packet, returning its body (without the length)
pub fn decode_startup(src: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if src.len() < STARTUP_HEADER_SIZE {
        return Ok(None);
    }

    let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if len < 8 || len as usize > MAX_STARTUP_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid startup packet length {}", len),
        ));
    }

    let len = len as usize;
    if src.len() < len {
        src.reserve(len - src.len());
        return Ok(None);
    }

    src.advance(STARTUP_HEADER_SIZE);
    Ok(Some(src.split_to(len - STARTUP_HEADER_SIZE).freeze()))
}

/// Message tags sent by clients
pub mod frontend {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const FUNCTION_CALL: u8 = b'F';
    pub const PASSWORD: u8 = b'p';
    pub const TERMINATE: u8 = b'X';
}

/// Message tags sent by servers
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
}
