#![forbid(unsafe_code)]

//! CCSDS MAL interaction middleware over the MAL/TCP transport.
//!
//! A [`Context`] owns one transport bound to a local address and routes
//! inbound messages to [`ClientContext`] endpoints by URI. Endpoints run
//! the six MAL interaction patterns: consumer operations on one side,
//! registered provider handlers with per-pattern [`Transaction`] replies
//! on the other. [`Broker`] adds the centralized PUB/SUB routing node.

pub mod api;
pub mod broker;
pub mod codec;
pub mod context;
pub mod error;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::api::{
    ClientContext, InteractionError, InvokeOperation, ProgressOperation, PublisherOperation,
    RequestOperation, SendOperation, SubmitOperation, SubscriberOperation, Transaction,
};
pub use crate::broker::{BlobUpdateHandler, Broker, BrokerError, UpdateValueHandler};
pub use crate::codec::{CodecError, Decoder, ElementRegistry, ElementRegistryBuilder, Encoder};
pub use crate::context::{Context, RoutingError};
pub use crate::transport::{
    FrameError, Network, PresenceFlags, TransportConfig, TransportDefaults, TransportError,
};
pub use crate::types::{
    Blob, EntityKey, EntityRequest, Identifier, IdentifierList, InteractionType, Message, QosLevel,
    SessionType, Subscription, Time, UpdateHeader, UpdateType, Uri, stage,
};
