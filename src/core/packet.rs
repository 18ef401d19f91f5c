//! # Packet Types
//!
//! The closed set of packets exchanged with the relay daemon.
//!
//! Every packet is one tag byte followed by a fixed, tag-specific field list.
//! The same variants travel in both directions: outbound operations and
//! inbound deliveries share shapes, and fields a receiver does not need are
//! simply carried along.
//!
//! ## Tunnel Addressing
//! Tunnel data packets carry the *destination's* identifier: the sender writes
//! the remote id it learned during the open handshake, and the receiver looks
//! the arriving id up in its own tunnel registry.

use crate::core::wire::{self, WireCursor};
use crate::error::{RelayError, Result};
use bytes::BytesMut;

/// Wire tag bytes, one per packet variant.
pub mod tag {
    pub const BROADCAST: u8 = 0x01;
    pub const REQUEST: u8 = 0x02;
    pub const REPLY: u8 = 0x03;
    pub const SUBSCRIBE: u8 = 0x04;
    pub const UNSUBSCRIBE: u8 = 0x05;
    pub const PUBLISH: u8 = 0x06;
    pub const TUNNEL_INIT: u8 = 0x07;
    pub const TUNNEL_CONFIRM: u8 = 0x08;
    pub const TUNNEL_ALLOW: u8 = 0x09;
    pub const TUNNEL_TRANSFER: u8 = 0x0A;
    pub const TUNNEL_CLOSE: u8 = 0x0B;
    pub const CLOSE: u8 = 0x0C;
}

/// A single relay protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One-to-many delivery to every peer registered under `app`.
    Broadcast { app: String, message: Vec<u8> },

    /// Round-trip request addressed to one peer of `app`.
    Request {
        id: u64,
        app: String,
        request: Vec<u8>,
        timeout_ms: u64,
    },

    /// Completion of a pending request: reply bytes or a remote error.
    Reply {
        id: u64,
        result: std::result::Result<Vec<u8>, String>,
    },

    /// Open a topic subscription; acknowledged through a `Reply` with `id`.
    Subscribe { id: u64, topic: String },

    /// Drop a topic subscription; acknowledged through a `Reply` with `id`.
    Unsubscribe { id: u64, topic: String },

    /// Topic-scoped one-to-many delivery.
    Publish { topic: String, message: Vec<u8> },

    /// Open a tunnel towards a peer of `app`. Outbound `id` is the initiator's
    /// local tunnel id; inbound `id` is the remote id the acceptor must use
    /// when addressing the new tunnel.
    TunnelInit {
        id: u64,
        app: String,
        timeout_ms: u64,
    },

    /// Tunnel open completion. From the acceptor: `init_id` echoes the inbound
    /// init id and `tun_id` is the acceptor's fresh local id. Towards the
    /// initiator: `init_id` is the initiator's local id and `tun_id` the
    /// remote id to address the tunnel with.
    TunnelConfirm { init_id: u64, tun_id: u64 },

    /// Replenish `bytes` of send allowance on the addressed tunnel.
    TunnelAllow { id: u64, bytes: u64 },

    /// One chunk of a logical tunnel message. `size` is the total message
    /// length plus one on an opening chunk (so the zero-length message stays
    /// representable) and zero on a continuation.
    TunnelTransfer {
        id: u64,
        size: u64,
        payload: Vec<u8>,
    },

    /// Close the addressed tunnel.
    TunnelClose { id: u64 },

    /// Orderly connection shutdown.
    Close,
}

impl Packet {
    /// The wire tag byte for this packet.
    pub fn tag(&self) -> u8 {
        match self {
            Packet::Broadcast { .. } => tag::BROADCAST,
            Packet::Request { .. } => tag::REQUEST,
            Packet::Reply { .. } => tag::REPLY,
            Packet::Subscribe { .. } => tag::SUBSCRIBE,
            Packet::Unsubscribe { .. } => tag::UNSUBSCRIBE,
            Packet::Publish { .. } => tag::PUBLISH,
            Packet::TunnelInit { .. } => tag::TUNNEL_INIT,
            Packet::TunnelConfirm { .. } => tag::TUNNEL_CONFIRM,
            Packet::TunnelAllow { .. } => tag::TUNNEL_ALLOW,
            Packet::TunnelTransfer { .. } => tag::TUNNEL_TRANSFER,
            Packet::TunnelClose { .. } => tag::TUNNEL_CLOSE,
            Packet::Close => tag::CLOSE,
        }
    }

    /// Encode the packet into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(1 + self.encoded_hint());
        dst.extend_from_slice(&[self.tag()]);
        match self {
            Packet::Broadcast { app, message } => {
                wire::put_string(dst, app);
                wire::put_blob(dst, message);
            }
            Packet::Request {
                id,
                app,
                request,
                timeout_ms,
            } => {
                wire::put_uvarint(dst, *id);
                wire::put_string(dst, app);
                wire::put_blob(dst, request);
                wire::put_uvarint(dst, *timeout_ms);
            }
            Packet::Reply { id, result } => {
                wire::put_uvarint(dst, *id);
                match result {
                    Ok(reply) => {
                        wire::put_bool(dst, true);
                        wire::put_blob(dst, reply);
                    }
                    Err(error) => {
                        wire::put_bool(dst, false);
                        wire::put_string(dst, error);
                    }
                }
            }
            Packet::Subscribe { id, topic } => {
                wire::put_uvarint(dst, *id);
                wire::put_string(dst, topic);
            }
            Packet::Unsubscribe { id, topic } => {
                wire::put_uvarint(dst, *id);
                wire::put_string(dst, topic);
            }
            Packet::Publish { topic, message } => {
                wire::put_string(dst, topic);
                wire::put_blob(dst, message);
            }
            Packet::TunnelInit {
                id,
                app,
                timeout_ms,
            } => {
                wire::put_uvarint(dst, *id);
                wire::put_string(dst, app);
                wire::put_uvarint(dst, *timeout_ms);
            }
            Packet::TunnelConfirm { init_id, tun_id } => {
                wire::put_uvarint(dst, *init_id);
                wire::put_uvarint(dst, *tun_id);
            }
            Packet::TunnelAllow { id, bytes } => {
                wire::put_uvarint(dst, *id);
                wire::put_uvarint(dst, *bytes);
            }
            Packet::TunnelTransfer { id, size, payload } => {
                wire::put_uvarint(dst, *id);
                wire::put_uvarint(dst, *size);
                wire::put_blob(dst, payload);
            }
            Packet::TunnelClose { id } => {
                wire::put_uvarint(dst, *id);
            }
            Packet::Close => {}
        }
    }

    /// Attempt to decode one packet. `Ok(None)` means the input ends mid-packet
    /// and the caller should retry with more bytes.
    pub fn decode(cur: &mut WireCursor<'_>, max_payload: usize) -> Result<Option<Packet>> {
        let Some(tag_byte) = cur.get_u8() else {
            return Ok(None);
        };
        let packet = match tag_byte {
            tag::BROADCAST => {
                let Some(app) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                let Some(message) = cur.get_blob(max_payload)? else {
                    return Ok(None);
                };
                Packet::Broadcast { app, message }
            }
            tag::REQUEST => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(app) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                let Some(request) = cur.get_blob(max_payload)? else {
                    return Ok(None);
                };
                let Some(timeout_ms) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                Packet::Request {
                    id,
                    app,
                    request,
                    timeout_ms,
                }
            }
            tag::REPLY => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(success) = cur.get_bool()? else {
                    return Ok(None);
                };
                let result = if success {
                    let Some(reply) = cur.get_blob(max_payload)? else {
                        return Ok(None);
                    };
                    Ok(reply)
                } else {
                    let Some(error) = cur.get_string(max_payload)? else {
                        return Ok(None);
                    };
                    Err(error)
                };
                Packet::Reply { id, result }
            }
            tag::SUBSCRIBE => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(topic) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                Packet::Subscribe { id, topic }
            }
            tag::UNSUBSCRIBE => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(topic) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                Packet::Unsubscribe { id, topic }
            }
            tag::PUBLISH => {
                let Some(topic) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                let Some(message) = cur.get_blob(max_payload)? else {
                    return Ok(None);
                };
                Packet::Publish { topic, message }
            }
            tag::TUNNEL_INIT => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(app) = cur.get_string(max_payload)? else {
                    return Ok(None);
                };
                let Some(timeout_ms) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                Packet::TunnelInit {
                    id,
                    app,
                    timeout_ms,
                }
            }
            tag::TUNNEL_CONFIRM => {
                let Some(init_id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(tun_id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                Packet::TunnelConfirm { init_id, tun_id }
            }
            tag::TUNNEL_ALLOW => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(bytes) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                Packet::TunnelAllow { id, bytes }
            }
            tag::TUNNEL_TRANSFER => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(size) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                let Some(payload) = cur.get_blob(max_payload)? else {
                    return Ok(None);
                };
                Packet::TunnelTransfer { id, size, payload }
            }
            tag::TUNNEL_CLOSE => {
                let Some(id) = cur.get_uvarint()? else {
                    return Ok(None);
                };
                Packet::TunnelClose { id }
            }
            tag::CLOSE => Packet::Close,
            unknown => {
                return Err(RelayError::Protocol(format!(
                    "unknown packet tag {unknown:#04x}"
                )))
            }
        };
        Ok(Some(packet))
    }

    /// Rough encoded-size hint used to presize the output buffer.
    fn encoded_hint(&self) -> usize {
        match self {
            Packet::Broadcast { app, message } => app.len() + message.len() + 8,
            Packet::Request { app, request, .. } => app.len() + request.len() + 24,
            Packet::Reply { result, .. } => {
                16 + match result {
                    Ok(reply) => reply.len(),
                    Err(error) => error.len(),
                }
            }
            Packet::Subscribe { topic, .. } | Packet::Unsubscribe { topic, .. } => topic.len() + 16,
            Packet::Publish { topic, message } => topic.len() + message.len() + 8,
            Packet::TunnelInit { app, .. } => app.len() + 24,
            Packet::TunnelConfirm { .. } | Packet::TunnelAllow { .. } => 20,
            Packet::TunnelTransfer { payload, .. } => payload.len() + 24,
            Packet::TunnelClose { .. } => 10,
            Packet::Close => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PAYLOAD_SIZE;

    fn roundtrip(packet: Packet) {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let mut cur = WireCursor::new(&buf);
        let decoded = Packet::decode(&mut cur, MAX_PAYLOAD_SIZE)
            .expect("decode")
            .expect("complete");
        assert_eq!(decoded, packet);
        assert_eq!(cur.consumed(), buf.len());
    }

    #[test]
    fn all_variants_roundtrip() {
        roundtrip(Packet::Broadcast {
            app: "echo".into(),
            message: vec![1, 2, 3],
        });
        roundtrip(Packet::Request {
            id: 7,
            app: "echo".into(),
            request: b"ping".to_vec(),
            timeout_ms: 250,
        });
        roundtrip(Packet::Reply {
            id: 7,
            result: Ok(b"pong".to_vec()),
        });
        roundtrip(Packet::Reply {
            id: 8,
            result: Err("no such app".into()),
        });
        roundtrip(Packet::Subscribe {
            id: 9,
            topic: "news".into(),
        });
        roundtrip(Packet::Unsubscribe {
            id: 10,
            topic: "news".into(),
        });
        roundtrip(Packet::Publish {
            topic: "news".into(),
            message: vec![],
        });
        roundtrip(Packet::TunnelInit {
            id: 1,
            app: "files".into(),
            timeout_ms: 1000,
        });
        roundtrip(Packet::TunnelConfirm {
            init_id: 1,
            tun_id: 42,
        });
        roundtrip(Packet::TunnelAllow { id: 42, bytes: 65536 });
        roundtrip(Packet::TunnelTransfer {
            id: 42,
            size: 4,
            payload: vec![0xAB; 3],
        });
        roundtrip(Packet::TunnelClose { id: 42 });
        roundtrip(Packet::Close);
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut cur = WireCursor::new(&[0x7F]);
        assert!(matches!(
            Packet::decode(&mut cur, MAX_PAYLOAD_SIZE),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_packet_decodes_to_none() {
        let mut buf = BytesMut::new();
        Packet::Broadcast {
            app: "echo".into(),
            message: vec![0u8; 64],
        }
        .encode(&mut buf);
        for cut in 0..buf.len() {
            let mut cur = WireCursor::new(&buf[..cut]);
            assert_eq!(
                Packet::decode(&mut cur, MAX_PAYLOAD_SIZE).expect("no error"),
                None,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn oversized_field_is_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[tag::PUBLISH]);
        crate::core::wire::put_uvarint(&mut buf, (MAX_PAYLOAD_SIZE as u64) + 1);
        let mut cur = WireCursor::new(&buf);
        assert!(Packet::decode(&mut cur, MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn empty_input_is_incomplete() {
        let mut cur = WireCursor::new(&[]);
        assert_eq!(Packet::decode(&mut cur, MAX_PAYLOAD_SIZE).unwrap(), None);
    }
}
