//! MAL data model: attributes, enumerations and the message header.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod composites;

pub use composites::{
    EntityKey, EntityKeyList, EntityRequest, EntityRequestList, Subscription, UpdateHeader,
    UpdateHeaderList, UpdateType,
};

/// URI scheme of the MAL/TCP transport.
pub const MALTCP: &str = "maltcp";
pub const MALTCP_PREFIX: &str = "maltcp://";

/// Opaque endpoint name of the shape `maltcp://<host>:<port>/<service>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri(pub String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `host:port` part, without scheme or service path.
    pub fn host_port(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(MALTCP_PREFIX)?;
        Some(rest.split('/').next().unwrap_or(rest))
    }

    /// The service token after `host:port`, if any.
    pub fn service(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(MALTCP_PREFIX)?;
        rest.split_once('/').map(|(_, service)| service)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// MAL Identifier attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier(pub String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// MAL Blob attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob(pub Bytes);

impl Blob {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Absolute time as milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(pub u64);

impl Time {
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }
}

/// Ordered domain path, e.g. `[spacecraft1, payload, camera]`.
pub type IdentifierList = Vec<Identifier>;

pub type BlobList = Vec<Blob>;

pub fn identifier_list(names: &[&str]) -> IdentifierList {
    names.iter().map(|name| Identifier::from(*name)).collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    #[default]
    BestEffort,
    Assured,
    Queued,
    Timely,
}

impl QosLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            QosLevel::BestEffort => 0,
            QosLevel::Assured => 1,
            QosLevel::Queued => 2,
            QosLevel::Timely => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(QosLevel::BestEffort),
            1 => Some(QosLevel::Assured),
            2 => Some(QosLevel::Queued),
            3 => Some(QosLevel::Timely),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Live,
    Simulation,
    Replay,
}

impl SessionType {
    pub fn ordinal(self) -> u8 {
        match self {
            SessionType::Live => 0,
            SessionType::Simulation => 1,
            SessionType::Replay => 2,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(SessionType::Live),
            1 => Some(SessionType::Simulation),
            2 => Some(SessionType::Replay),
            _ => None,
        }
    }
}

/// The six MAL interaction patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InteractionType {
    Send,
    Submit,
    Request,
    Invoke,
    Progress,
    PubSub,
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InteractionType::Send => "SEND",
            InteractionType::Submit => "SUBMIT",
            InteractionType::Request => "REQUEST",
            InteractionType::Invoke => "INVOKE",
            InteractionType::Progress => "PROGRESS",
            InteractionType::PubSub => "PUBSUB",
        };
        f.write_str(name)
    }
}

/// Interaction stage numbers. The initial stage of every non-PUB/SUB
/// pattern is 1; PUB/SUB stages are numbered so that odd stages travel
/// peer-to-broker and even stages broker-to-peer.
pub mod stage {
    pub const INIT: u8 = 1;

    pub const SUBMIT_ACK: u8 = 2;

    pub const REQUEST_RESPONSE: u8 = 2;

    pub const INVOKE_ACK: u8 = 2;
    pub const INVOKE_RESPONSE: u8 = 3;

    pub const PROGRESS_ACK: u8 = 2;
    pub const PROGRESS_UPDATE: u8 = 3;
    pub const PROGRESS_RESPONSE: u8 = 4;

    pub const PUBSUB_REGISTER: u8 = 1;
    pub const PUBSUB_REGISTER_ACK: u8 = 2;
    pub const PUBSUB_PUBLISH_REGISTER: u8 = 3;
    pub const PUBSUB_PUBLISH_REGISTER_ACK: u8 = 4;
    pub const PUBSUB_PUBLISH: u8 = 5;
    pub const PUBSUB_NOTIFY: u8 = 6;
    pub const PUBSUB_DEREGISTER: u8 = 7;
    pub const PUBSUB_DEREGISTER_ACK: u8 = 8;
    pub const PUBSUB_PUBLISH_DEREGISTER: u8 = 9;
    pub const PUBSUB_PUBLISH_DEREGISTER_ACK: u8 = 10;
}

/// One MAL message: routing, QoS, scoping, interaction addressing and an
/// opaque body whose interpretation is delegated to `encoding_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub uri_from: Uri,
    pub uri_to: Uri,
    pub authentication_id: Blob,
    pub encoding_id: u8,
    pub timestamp: Time,
    pub qos_level: QosLevel,
    pub priority: u32,
    pub domain: IdentifierList,
    pub network_zone: Identifier,
    pub session: SessionType,
    pub session_name: Identifier,
    pub interaction_type: InteractionType,
    pub interaction_stage: u8,
    pub transaction_id: u64,
    pub service_area: u16,
    pub service: u16,
    pub operation: u16,
    pub area_version: u8,
    pub is_error_message: bool,
    pub body: Bytes,
}

impl Message {
    /// True for messages that open a provider-side transaction: stage 1
    /// of any non-PUB/SUB pattern, or an odd PUB/SUB stage that is not an
    /// error PUBLISH echoed back to the publisher.
    pub fn is_provider_initial(&self) -> bool {
        if self.interaction_type != InteractionType::PubSub {
            return self.interaction_stage == stage::INIT;
        }
        self.interaction_stage & 0x1 != 0
            && !(self.interaction_stage == stage::PUBSUB_PUBLISH && self.is_error_message)
    }
}
