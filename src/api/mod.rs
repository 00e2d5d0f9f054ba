//! Interaction engine: endpoints, consumer operations and provider
//! transactions for the six MAL interaction patterns.

use thiserror::Error;

use crate::context::RoutingError;
use crate::transport::TransportError;
use crate::types::Message;

pub mod endpoint;
pub mod operations;
pub mod transactions;

pub use endpoint::{ClientContext, ProviderHandler};
pub use operations::{
    InvokeOperation, ProgressOperation, PublisherOperation, RequestOperation, SendOperation,
    SubmitOperation, SubscriberOperation,
};
pub use transactions::{
    InvokeTransaction, ProgressTransaction, PublisherTransaction, RequestTransaction,
    SendTransaction, SubmitTransaction, SubscriberTransaction, Transaction,
};

#[derive(Debug, Error)]
pub enum InteractionError {
    /// The peer answered with `is_error_message` set; terminal for the
    /// operation, the error body travels inside.
    #[error("peer replied with a MAL error message")]
    ErrorReply(Box<Message>),
    #[error("{action} is not legal at the operation's current stage")]
    BadStage { action: &'static str },
    #[error("operation closed")]
    Closed,
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Packs `(area, version, service, operation)` into the provider handler
/// map key.
pub(crate) fn handler_key(area: u16, area_version: u8, service: u16, operation: u16) -> u64 {
    (u64::from(area) << 40)
        | (u64::from(area_version) << 32)
        | (u64::from(service) << 16)
        | u64::from(operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_key_packs_fields() {
        let key = handler_key(200, 1, 1, 1);
        assert_eq!(key, (200u64 << 40) | (1u64 << 32) | (1u64 << 16) | 1);
        assert_ne!(key, handler_key(200, 2, 1, 1));
        assert_ne!(key, handler_key(200, 1, 1, 2));
    }
}
