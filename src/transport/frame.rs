//! MAL/TCP frame codec: 23-byte fixed header plus varint trailer.
//!
//! Fixed header layout (big-endian multi-byte fields):
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 1    | version(3) + SDU(5) |
//! | 1      | 2    | service area |
//! | 3      | 2    | service |
//! | 5      | 2    | operation |
//! | 7      | 1    | area version |
//! | 8      | 1    | is-error(1) + QoS(3) + session(4) |
//! | 9      | 8    | transaction id |
//! | 17     | 1    | presence flags |
//! | 18     | 1    | encoding id |
//! | 19     | 4    | variable length |

use thiserror::Error;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::transport::TransportConfig;
use crate::types::{
    InteractionType, MALTCP_PREFIX, Message, QosLevel, SessionType, Time, Uri, stage,
};

pub const FIXED_HEADER_LEN: usize = 23;
pub const VARIABLE_LENGTH_OFFSET: usize = 19;

const MALTCP_VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unsupported MAL/TCP version {0}")]
    Version(u8),
    #[error("unknown SDU {0}")]
    UnknownSdu(u8),
    #[error("no SDU for {pattern} stage {stage}")]
    BadStage {
        pattern: InteractionType,
        stage: u8,
    },
    #[error("unknown qos ordinal {0}")]
    BadQos(u8),
    #[error("unknown session ordinal {0}")]
    BadSession(u8),
    #[error("trailer: {0}")]
    Codec(#[from] CodecError),
}

/// Maps `(interaction type, stage)` onto the 5-bit SDU code.
pub fn encode_sdu(pattern: InteractionType, stage_nr: u8) -> Result<u8, FrameError> {
    let sdu = match (pattern, stage_nr) {
        (InteractionType::Send, stage::INIT) => 0,
        (InteractionType::Submit, stage::INIT) => 1,
        (InteractionType::Submit, stage::SUBMIT_ACK) => 2,
        (InteractionType::Request, stage::INIT) => 3,
        (InteractionType::Request, stage::REQUEST_RESPONSE) => 4,
        (InteractionType::Invoke, stage::INIT) => 5,
        (InteractionType::Invoke, stage::INVOKE_ACK) => 6,
        (InteractionType::Invoke, stage::INVOKE_RESPONSE) => 7,
        (InteractionType::Progress, stage::INIT) => 8,
        (InteractionType::Progress, stage::PROGRESS_ACK) => 9,
        (InteractionType::Progress, stage::PROGRESS_UPDATE) => 10,
        (InteractionType::Progress, stage::PROGRESS_RESPONSE) => 11,
        (InteractionType::PubSub, stage::PUBSUB_REGISTER) => 12,
        (InteractionType::PubSub, stage::PUBSUB_REGISTER_ACK) => 13,
        (InteractionType::PubSub, stage::PUBSUB_PUBLISH_REGISTER) => 14,
        (InteractionType::PubSub, stage::PUBSUB_PUBLISH_REGISTER_ACK) => 15,
        (InteractionType::PubSub, stage::PUBSUB_PUBLISH) => 16,
        (InteractionType::PubSub, stage::PUBSUB_NOTIFY) => 17,
        (InteractionType::PubSub, stage::PUBSUB_DEREGISTER) => 18,
        (InteractionType::PubSub, stage::PUBSUB_DEREGISTER_ACK) => 19,
        (InteractionType::PubSub, stage::PUBSUB_PUBLISH_DEREGISTER) => 20,
        (InteractionType::PubSub, stage::PUBSUB_PUBLISH_DEREGISTER_ACK) => 21,
        (pattern, stage) => return Err(FrameError::BadStage { pattern, stage }),
    };
    Ok(sdu)
}

pub fn decode_sdu(sdu: u8) -> Result<(InteractionType, u8), FrameError> {
    let pair = match sdu {
        0 => (InteractionType::Send, stage::INIT),
        1 => (InteractionType::Submit, stage::INIT),
        2 => (InteractionType::Submit, stage::SUBMIT_ACK),
        3 => (InteractionType::Request, stage::INIT),
        4 => (InteractionType::Request, stage::REQUEST_RESPONSE),
        5 => (InteractionType::Invoke, stage::INIT),
        6 => (InteractionType::Invoke, stage::INVOKE_ACK),
        7 => (InteractionType::Invoke, stage::INVOKE_RESPONSE),
        8 => (InteractionType::Progress, stage::INIT),
        9 => (InteractionType::Progress, stage::PROGRESS_ACK),
        10 => (InteractionType::Progress, stage::PROGRESS_UPDATE),
        11 => (InteractionType::Progress, stage::PROGRESS_RESPONSE),
        12 => (InteractionType::PubSub, stage::PUBSUB_REGISTER),
        13 => (InteractionType::PubSub, stage::PUBSUB_REGISTER_ACK),
        14 => (InteractionType::PubSub, stage::PUBSUB_PUBLISH_REGISTER),
        15 => (InteractionType::PubSub, stage::PUBSUB_PUBLISH_REGISTER_ACK),
        16 => (InteractionType::PubSub, stage::PUBSUB_PUBLISH),
        17 => (InteractionType::PubSub, stage::PUBSUB_NOTIFY),
        18 => (InteractionType::PubSub, stage::PUBSUB_DEREGISTER),
        19 => (InteractionType::PubSub, stage::PUBSUB_DEREGISTER_ACK),
        20 => (InteractionType::PubSub, stage::PUBSUB_PUBLISH_DEREGISTER),
        21 => (InteractionType::PubSub, stage::PUBSUB_PUBLISH_DEREGISTER_ACK),
        other => return Err(FrameError::UnknownSdu(other)),
    };
    Ok(pair)
}

/// Reads the announced trailer length from a complete fixed header.
pub fn variable_length(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < FIXED_HEADER_LEN {
        return Err(FrameError::Truncated {
            need: FIXED_HEADER_LEN,
            have: header.len(),
        });
    }
    let bytes: [u8; 4] = header[VARIABLE_LENGTH_OFFSET..VARIABLE_LENGTH_OFFSET + 4]
        .try_into()
        .expect("slice length checked above");
    Ok(u32::from_be_bytes(bytes) as usize)
}

/// Stateless per-transport frame codec. Holds the transport's own base
/// URI (`maltcp://host:port`) for optimized-URI handling and the
/// configured presence flags and defaults.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    base_uri: String,
    config: TransportConfig,
}

impl FrameCodec {
    pub fn new(base_uri: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            base_uri: base_uri.into(),
            config,
        }
    }

    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameError> {
        let sdu = encode_sdu(msg.interaction_type, msg.interaction_stage)?;

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + 64);
        buf.push((MALTCP_VERSION << 5) | sdu);
        buf.extend_from_slice(&msg.service_area.to_be_bytes());
        buf.extend_from_slice(&msg.service.to_be_bytes());
        buf.extend_from_slice(&msg.operation.to_be_bytes());
        buf.push(msg.area_version);
        buf.push(
            (u8::from(msg.is_error_message) << 7)
                | (msg.qos_level.ordinal() << 4)
                | msg.session.ordinal(),
        );
        buf.extend_from_slice(&msg.transaction_id.to_be_bytes());
        buf.push(self.config.flags.to_byte());
        buf.push(msg.encoding_id);
        buf.extend_from_slice(&0u32.to_be_bytes());

        let flags = self.config.flags;
        let mut trailer = Encoder::new();
        if flags.source {
            trailer.encode_string(&self.shrink_uri(&msg.uri_from));
        }
        if flags.destination {
            trailer.encode_string(&self.shrink_uri(&msg.uri_to));
        }
        if flags.priority {
            trailer.encode_uinteger(msg.priority);
        }
        if flags.timestamp {
            trailer.encode_time(msg.timestamp);
        }
        if flags.network_zone {
            trailer.encode_identifier(&msg.network_zone);
        }
        if flags.session_name {
            trailer.encode_identifier(&msg.session_name);
        }
        if flags.domain {
            crate::types::composites::encode_identifier_list(&msg.domain, &mut trailer)?;
        }
        if flags.authentication_id {
            trailer.encode_blob(&msg.authentication_id);
        }
        trailer.write_bytes(&msg.body);

        let variable = trailer.into_vec();
        let length = (variable.len() as u32).to_be_bytes();
        buf[VARIABLE_LENGTH_OFFSET..VARIABLE_LENGTH_OFFSET + 4].copy_from_slice(&length);
        buf.extend_from_slice(&variable);
        Ok(buf)
    }

    /// Decodes one complete frame. `peer` is the remote `host:port` of
    /// the connection the frame arrived on, used to re-materialize
    /// optimized source URIs.
    pub fn decode(&self, buf: &[u8], peer: &str) -> Result<Message, FrameError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(FrameError::Truncated {
                need: FIXED_HEADER_LEN,
                have: buf.len(),
            });
        }
        let announced = variable_length(buf)?;
        if buf.len() < FIXED_HEADER_LEN + announced {
            return Err(FrameError::Truncated {
                need: FIXED_HEADER_LEN + announced,
                have: buf.len(),
            });
        }

        let version = buf[0] >> 5;
        if version != MALTCP_VERSION {
            return Err(FrameError::Version(version));
        }
        let (interaction_type, interaction_stage) = decode_sdu(buf[0] & 0x1F)?;

        let service_area = u16::from_be_bytes([buf[1], buf[2]]);
        let service = u16::from_be_bytes([buf[3], buf[4]]);
        let operation = u16::from_be_bytes([buf[5], buf[6]]);
        let area_version = buf[7];

        let is_error_message = (buf[8] >> 7) & 0x1 == 1;
        let qos_ordinal = (buf[8] >> 4) & 0x07;
        let qos_level = QosLevel::from_ordinal(qos_ordinal).ok_or(FrameError::BadQos(qos_ordinal))?;
        let session_ordinal = buf[8] & 0x0F;
        let session = SessionType::from_ordinal(session_ordinal)
            .ok_or(FrameError::BadSession(session_ordinal))?;

        let transaction_id = u64::from_be_bytes(
            buf[9..17].try_into().expect("header length checked above"),
        );
        let wire_flags = buf[17];
        let encoding_id = buf[18];

        let defaults = &self.config.defaults;
        let mut decoder = Decoder::new(&buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + announced]);

        let uri_from = if wire_flags & (1 << 7) != 0 {
            self.expand_uri(decoder.decode_string()?, peer)
        } else {
            Uri::new(self.base_uri.clone())
        };
        let uri_to = if wire_flags & (1 << 6) != 0 {
            self.expand_uri(decoder.decode_string()?, &self.own_host_port())
        } else {
            Uri::new(self.base_uri.clone())
        };
        let priority = if wire_flags & (1 << 5) != 0 {
            decoder.decode_uinteger()?
        } else {
            defaults.priority
        };
        let timestamp = if wire_flags & (1 << 4) != 0 {
            decoder.decode_time()?
        } else {
            Time::now()
        };
        let network_zone = if wire_flags & (1 << 3) != 0 {
            decoder.decode_identifier()?
        } else {
            defaults.network_zone.clone()
        };
        let session_name = if wire_flags & (1 << 2) != 0 {
            decoder.decode_identifier()?
        } else {
            defaults.session_name.clone()
        };
        let domain = if wire_flags & (1 << 1) != 0 {
            crate::types::composites::decode_identifier_list(&mut decoder)?
        } else {
            defaults.domain.clone()
        };
        let authentication_id = if wire_flags & 1 != 0 {
            decoder.decode_blob()?
        } else {
            defaults.authentication_id.clone()
        };

        let body = decoder.take_remaining();

        Ok(Message {
            uri_from,
            uri_to,
            authentication_id,
            encoding_id,
            timestamp,
            qos_level,
            priority,
            domain,
            network_zone,
            session,
            session_name,
            interaction_type,
            interaction_stage,
            transaction_id,
            service_area,
            service,
            operation,
            area_version,
            is_error_message,
            body,
        })
    }

    fn own_host_port(&self) -> String {
        self.base_uri
            .strip_prefix(MALTCP_PREFIX)
            .unwrap_or(&self.base_uri)
            .to_string()
    }

    /// Emits a URI owned by this transport as its bare `/service` tail
    /// when optimization is enabled.
    fn shrink_uri(&self, uri: &Uri) -> String {
        if self.config.optimize_uris
            && let Some(tail) = uri.as_str().strip_prefix(&self.base_uri)
            && tail.starts_with('/')
        {
            return tail.to_string();
        }
        uri.as_str().to_string()
    }

    fn expand_uri(&self, raw: String, authority: &str) -> Uri {
        if raw.starts_with(MALTCP_PREFIX) {
            Uri(raw)
        } else if raw.starts_with('/') {
            Uri(format!("{MALTCP_PREFIX}{authority}{raw}"))
        } else {
            Uri(format!("{MALTCP_PREFIX}{authority}/{raw}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PresenceFlags, TransportDefaults};
    use crate::types::{Blob, Identifier, identifier_list};
    use bytes::Bytes;

    fn sample_message() -> Message {
        Message {
            uri_from: Uri::from("maltcp://127.0.0.1:16001/consumer"),
            uri_to: Uri::from("maltcp://127.0.0.1:16000/provider"),
            authentication_id: Blob::new(vec![0xAA, 0xBB]),
            encoding_id: 0,
            timestamp: Time(1_700_000_000_123),
            qos_level: QosLevel::Assured,
            priority: 7,
            domain: identifier_list(&["sc1", "payload"]),
            network_zone: Identifier::from("ground"),
            session: SessionType::Live,
            session_name: Identifier::from("ops"),
            interaction_type: InteractionType::Request,
            interaction_stage: stage::INIT,
            transaction_id: 42,
            service_area: 200,
            service: 1,
            operation: 1,
            area_version: 1,
            is_error_message: false,
            body: Bytes::from_static(&[0xDE, 0xAD]),
        }
    }

    fn codec() -> FrameCodec {
        FrameCodec::new("maltcp://127.0.0.1:16000", TransportConfig::default())
    }

    #[test]
    fn fixed_header_round_trip() {
        let codec = codec();
        let msg = sample_message();
        let frame = codec.encode(&msg).unwrap();
        assert_eq!(frame.len(), FIXED_HEADER_LEN + variable_length(&frame).unwrap());

        let decoded = codec.decode(&frame, "127.0.0.1:53000").unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn every_legal_sdu_round_trips() {
        for sdu in 0u8..=21 {
            let (pattern, stage_nr) = decode_sdu(sdu).unwrap();
            assert_eq!(encode_sdu(pattern, stage_nr).unwrap(), sdu);
        }
    }

    #[test]
    fn unknown_sdu_is_rejected() {
        for sdu in 22u8..=31 {
            assert_eq!(decode_sdu(sdu), Err(FrameError::UnknownSdu(sdu)));
        }

        let codec = codec();
        let mut frame = codec.encode(&sample_message()).unwrap();
        frame[0] = (MALTCP_VERSION << 5) | 22;
        assert_eq!(
            codec.decode(&frame, "127.0.0.1:53000"),
            Err(FrameError::UnknownSdu(22))
        );
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let codec = codec();
        let mut frame = codec.encode(&sample_message()).unwrap();
        frame[0] = (2 << 5) | (frame[0] & 0x1F);
        assert_eq!(
            codec.decode(&frame, "127.0.0.1:53000"),
            Err(FrameError::Version(2))
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let codec = codec();
        let frame = codec.encode(&sample_message()).unwrap();
        let cut = &frame[..frame.len() - 1];
        assert!(matches!(
            codec.decode(cut, "127.0.0.1:53000"),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn optimized_source_uri_round_trips() {
        let config = TransportConfig {
            optimize_uris: true,
            ..TransportConfig::default()
        };
        let sender = FrameCodec::new("maltcp://127.0.0.1:16002", config);
        let mut msg = sample_message();
        msg.uri_from = Uri::from("maltcp://127.0.0.1:16002/publisher");
        msg.uri_to = Uri::from("maltcp://127.0.0.1:16000/broker");

        let frame = sender.encode(&msg).unwrap();
        // The trailer carries the bare path for the sender's own URI; the
        // destination is not ours to shrink.
        let trailer = &frame[FIXED_HEADER_LEN..];
        let mut decoder = Decoder::new(trailer);
        assert_eq!(decoder.decode_string().unwrap(), "/publisher");
        assert_eq!(decoder.decode_string().unwrap(), "maltcp://127.0.0.1:16000/broker");

        // The receiving transport re-materializes both URIs.
        let receiver = FrameCodec::new("maltcp://127.0.0.1:16000", TransportConfig::default());
        let decoded = receiver.decode(&frame, "127.0.0.1:16002").unwrap();
        assert_eq!(decoded.uri_from, msg.uri_from);
        assert_eq!(decoded.uri_to, msg.uri_to);
    }

    #[test]
    fn cleared_presence_flags_apply_defaults() {
        let config = TransportConfig {
            flags: PresenceFlags {
                priority: false,
                network_zone: false,
                session_name: false,
                domain: false,
                authentication_id: false,
                ..PresenceFlags::default()
            },
            defaults: TransportDefaults {
                priority: 9,
                network_zone: Identifier::from("default-zone"),
                session_name: Identifier::from("default-session"),
                authentication_id: Blob::new(vec![1, 2, 3]),
                domain: identifier_list(&["dflt"]),
            },
            ..TransportConfig::default()
        };
        let codec = FrameCodec::new("maltcp://127.0.0.1:16000", config);

        let msg = sample_message();
        let frame = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&frame, "127.0.0.1:53000").unwrap();

        assert_eq!(decoded.priority, 9);
        assert_eq!(decoded.network_zone, Identifier::from("default-zone"));
        assert_eq!(decoded.session_name, Identifier::from("default-session"));
        assert_eq!(decoded.authentication_id, Blob::new(vec![1, 2, 3]));
        assert_eq!(decoded.domain, identifier_list(&["dflt"]));
        // Fields that stayed on the wire are untouched.
        assert_eq!(decoded.uri_from, msg.uri_from);
        assert_eq!(decoded.body, msg.body);
    }
}
