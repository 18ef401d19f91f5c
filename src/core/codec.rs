//! # Packet Codec
//!
//! Tokio codec framing [`Packet`]s over the relay byte stream.
//!
//! There is no outer frame header: the tag byte determines the field list and
//! the decoder simply retries once more bytes arrive. Field length prefixes
//! are validated against the configured payload ceiling before any allocation
//! happens.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::Packet;
use crate::core::wire::WireCursor;
use crate::error::RelayError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for relay packets, parameterized by the payload ceiling.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = RelayError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        packet.encode(dst);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Self::Error> {
        let mut cur = WireCursor::new(&src[..]);
        match Packet::decode(&mut cur, self.max_payload)? {
            Some(packet) => {
                let consumed = cur.consumed();
                src.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}
