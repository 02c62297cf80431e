// Platea - Replicated seat reservation over a TCP peer mesh: Ricart-Agrawala mutual exclusion on Lamport time, length-framed JSON protocol
// Copyright (C) 2021  Platea contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use serde::{Deserialize, Serialize};

use tokio_util::codec::{Decoder, Encoder};

use crate::error::PlateaError;

/// Frames advertising a larger payload are treated as a framing break.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Network address of a peer's listening socket, as carried in SYNC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render as `host:port` for connecting.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Wire messages.
///
/// Every message travels as one length-prefixed JSON object whose `type`
/// field selects the variant. Unknown fields are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Peer to name server on boot.
    Register {
        node_id: String,
        listening_port: u16,
    },

    /// Name server to every member after a registration: the full
    /// directory, replacing whatever the peer held before.
    Sync { peers: HashMap<String, PeerAddr> },

    /// Joining peer to an established one, asking for its seat array.
    StateRequest { sender: String },

    StateReply {
        sender: String,
        seats: Vec<Option<String>>,
    },

    /// Mutual exclusion request, stamped with the requester's clock.
    Request { sender: String, ts: u64 },

    Reply { sender: String, ts: u64 },

    /// Authoritative announcement from inside the critical section:
    /// the slot now belongs to `owner`.
    Acquire {
        seat_id: usize,
        owner: String,
        sender: String,
        ts: u64,
    },

    /// Authoritative announcement from inside the critical section:
    /// the slot is free again.
    Release {
        seat_id: usize,
        sender: String,
        ts: u64,
    },
}

impl Message {
    /// Stamp the sender field of every variant that carries one.
    ///
    /// The transport stamps each outgoing message, so receivers never
    /// rely on socket addresses for identity.
    pub fn stamp_sender(&mut self, id: &str) {
        match self {
            Message::StateRequest { sender }
            | Message::StateReply { sender, .. }
            | Message::Request { sender, .. }
            | Message::Reply { sender, .. }
            | Message::Acquire { sender, .. }
            | Message::Release { sender, .. } => *sender = id.to_string(),
            Message::Register { .. } | Message::Sync { .. } => {}
        }
    }
}

/// Length-prefixed JSON framing: a 4-byte big-endian payload length
/// followed by that many bytes of UTF-8 JSON.
///
/// The decoder is stream-oriented and copes with TCP sticky packets and
/// short reads: it yields nothing until a whole frame is buffered, and
/// leaves trailing bytes in place for the next call.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = PlateaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, PlateaError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length = [0u8; 4];
        length.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length) as usize;

        if length > MAX_FRAME_LENGTH {
            return Err(PlateaError::OversizedFrame(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());

            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);

        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = PlateaError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), PlateaError> {
        let payload = serde_json::to_vec(message)?;

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: &Message) -> BytesMut {
        let mut buf = BytesMut::new();

        FrameCodec.encode(message, &mut buf).unwrap();

        buf
    }

    fn frame_raw(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();

        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        buf
    }

    #[test]
    fn round_trip() {
        let message = Message::Request {
            sender: "node_1".to_string(),
            ts: 7,
        };

        let mut buf = frame(&message);
        let decoded = FrameCodec.decode(&mut buf).unwrap();

        assert_eq!(decoded, Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn length_prefix_is_big_endian_payload_length() {
        let message = Message::StateRequest {
            sender: "a".to_string(),
        };

        let buf = frame(&message);
        let payload = serde_json::to_vec(&message).unwrap();

        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes()[..]);
        assert_eq!(&buf[4..], &payload[..]);
    }

    #[test]
    fn sticky_frames_decode_in_order() {
        let first = Message::Request {
            sender: "a".to_string(),
            ts: 1,
        };
        let second = Message::Request {
            sender: "b".to_string(),
            ts: 2,
        };

        let mut buf = frame(&first);
        buf.extend_from_slice(&frame(&second));

        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(&buf[..], &frame(&second)[..]);

        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_nothing_and_keeps_the_buffer() {
        let full = frame(&Message::Reply {
            sender: "node_1".to_string(),
            ts: 3,
        });

        for k in 1..full.len() {
            let mut partial = BytesMut::from(&full[..k]);

            assert!(FrameCodec.decode(&mut partial).unwrap().is_none());
            assert_eq!(&partial[..], &full[..k]);
        }
    }

    #[test]
    fn malformed_json_is_a_framing_break() {
        let mut buf = frame_raw(b"not json at all");

        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn unknown_type_is_a_framing_break() {
        let mut buf = frame_raw(br#"{"type":"GOSSIP","sender":"a"}"#);

        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();

        buf.put_u32(MAX_FRAME_LENGTH as u32 + 1);

        match FrameCodec.decode(&mut buf) {
            Err(PlateaError::OversizedFrame(_)) => {}
            other => panic!("expected oversized frame error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut buf = frame_raw(br#"{"type":"REPLY","sender":"a","ts":4,"hops":9}"#);

        let decoded = FrameCodec.decode(&mut buf).unwrap();

        assert_eq!(
            decoded,
            Some(Message::Reply {
                sender: "a".to_string(),
                ts: 4,
            })
        );
    }

    #[test]
    fn wire_names_match_the_protocol() {
        let announcement = serde_json::to_value(&Message::Acquire {
            seat_id: 3,
            owner: "node_1".to_string(),
            sender: "node_1".to_string(),
            ts: 12,
        })
        .unwrap();

        assert_eq!(announcement["type"], "ACQUIRE");
        assert_eq!(announcement["seat_id"], 3);
        assert_eq!(announcement["owner"], "node_1");

        let state_request = serde_json::to_value(&Message::StateRequest {
            sender: "node_2".to_string(),
        })
        .unwrap();

        assert_eq!(state_request["type"], "STATE_REQUEST");
    }

    #[test]
    fn sync_carries_the_peer_directory() {
        let mut peers = HashMap::new();
        peers.insert("node_1".to_string(), PeerAddr::new("127.0.0.1", 5001));

        let value = serde_json::to_value(&Message::Sync {
            peers: peers.clone(),
        })
        .unwrap();

        assert_eq!(value["type"], "SYNC");
        assert_eq!(value["peers"]["node_1"]["host"], "127.0.0.1");
        assert_eq!(value["peers"]["node_1"]["port"], 5001);

        let parsed: Message = serde_json::from_value(value).unwrap();

        assert_eq!(parsed, Message::Sync { peers });
    }

    #[test]
    fn stamp_sender_overwrites() {
        let mut message = Message::Request {
            sender: String::new(),
            ts: 1,
        };

        message.stamp_sender("node_9");

        assert_eq!(
            message,
            Message::Request {
                sender: "node_9".to_string(),
                ts: 1,
            }
        );
    }
}
