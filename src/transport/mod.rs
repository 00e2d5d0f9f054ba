//! MAL/TCP transport: frame codec, connection multiplexer and pumps.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Blob, Identifier, IdentifierList, Message};

pub mod frame;
pub mod tcp;

pub use frame::{FIXED_HEADER_LEN, FrameCodec, FrameError, decode_sdu, encode_sdu};
pub use tcp::{TcpTransport, TransmitHandle};

/// Underlying socket protocol selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

/// Presence flags for the eight optional header fields. A cleared flag
/// means the field is never put on the wire and both sides substitute
/// the configured default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceFlags {
    pub source: bool,
    pub destination: bool,
    pub priority: bool,
    pub timestamp: bool,
    pub network_zone: bool,
    pub session_name: bool,
    pub domain: bool,
    pub authentication_id: bool,
}

impl Default for PresenceFlags {
    fn default() -> Self {
        Self {
            source: true,
            destination: true,
            priority: true,
            timestamp: true,
            network_zone: true,
            session_name: true,
            domain: true,
            authentication_id: true,
        }
    }
}

impl PresenceFlags {
    /// Packs the flags into the wire byte, bit 7 = source .. bit 0 =
    /// authentication id.
    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        for (bit, flag) in [
            self.source,
            self.destination,
            self.priority,
            self.timestamp,
            self.network_zone,
            self.session_name,
            self.domain,
            self.authentication_id,
        ]
        .into_iter()
        .enumerate()
        {
            if flag {
                byte |= 1 << (7 - bit);
            }
        }
        byte
    }
}

/// Defaults substituted for optional fields absent on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportDefaults {
    pub priority: u32,
    pub network_zone: Identifier,
    pub session_name: Identifier,
    pub authentication_id: Blob,
    pub domain: IdentifierList,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: Network,
    /// Emit URIs owned by this transport as bare `/service` paths.
    pub optimize_uris: bool,
    pub flags: PresenceFlags,
    pub defaults: TransportDefaults,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("destination {0} is not a routable uri")]
    BadDestination(String),
    #[error("connection to {addr} failed: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },
    #[error("transport closed")]
    Closed,
}

/// Inbound delivery hook; the context implements this to route messages
/// to endpoints. Called from the connection reader threads.
pub trait TransportCallback: Send + Sync {
    fn receive(&self, msg: Message);
}
