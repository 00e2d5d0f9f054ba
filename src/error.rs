use thiserror::Error;

use crate::api::InteractionError;
use crate::broker::BrokerError;
use crate::codec::CodecError;
use crate::context::RoutingError;
use crate::transport::{FrameError, TransportError};

/// Crate-level convenience error: a thin wrapper over the subsystem
/// errors, not a replacement for them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Interaction(#[from] InteractionError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
