use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{decode_startup, Message, MAX_LOGIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE};

/// Codec for typed protocol messages, used with tokio Framed
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_len: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_len: MAX_MESSAGE_SIZE,
        }
    }

    /// Small frame limit for clients that have not authenticated yet
    pub fn login() -> Self {
        Self {
            max_len: MAX_LOGIN_MESSAGE_SIZE,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Message::decode_limited(src, self.max_len)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Encoder that can write raw bytes directly (untyped startup message)
impl Encoder<&[u8]> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

/// Codec for the client's startup phase, where packets carry no tag
#[derive(Debug, Default)]
pub struct StartupCodec;

impl Decoder for StartupCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_startup(src)
    }
}

/// Single-byte answers to SSL/GSS negotiation are raw bytes
impl Encoder<&[u8]> for StartupCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}
