//! Provider-side transactions: one variant per interaction pattern,
//! each exposing exactly the replies its pattern allows. A transaction
//! is built from the initial message and lives for the handler call
//! (the broker keeps PUB/SUB transactions for later NOTIFYs).

use std::sync::Arc;

use bytes::Bytes;

use crate::api::InteractionError;
use crate::api::endpoint::EndpointShared;
use crate::transport::TransmitHandle;
use crate::types::{
    Blob, Identifier, IdentifierList, InteractionType, Message, QosLevel, SessionType, Time, Uri,
    stage,
};

/// Routing and scoping state shared by every transaction variant,
/// captured from the initial message so replies echo its QoS, scoping
/// and addressing fields.
#[derive(Clone)]
pub struct TransactionCore {
    transmit: TransmitHandle,
    uri: Uri,
    peer: Uri,
    transaction_id: u64,
    authentication_id: Blob,
    encoding_id: u8,
    qos_level: QosLevel,
    priority: u32,
    domain: IdentifierList,
    network_zone: Identifier,
    session: SessionType,
    session_name: Identifier,
    service_area: u16,
    service: u16,
    operation: u16,
    area_version: u8,
}

impl TransactionCore {
    fn from_initial(endpoint: &Arc<EndpointShared>, msg: &Message) -> Self {
        Self {
            transmit: endpoint.transmit_handle(),
            uri: endpoint.uri().clone(),
            peer: msg.uri_from.clone(),
            transaction_id: msg.transaction_id,
            authentication_id: msg.authentication_id.clone(),
            encoding_id: msg.encoding_id,
            qos_level: msg.qos_level,
            priority: msg.priority,
            domain: msg.domain.clone(),
            network_zone: msg.network_zone.clone(),
            session: msg.session,
            session_name: msg.session_name.clone(),
            service_area: msg.service_area,
            service: msg.service,
            operation: msg.operation,
            area_version: msg.area_version,
        }
    }

    fn reply(
        &self,
        interaction_type: InteractionType,
        interaction_stage: u8,
        body: Bytes,
        is_error: bool,
    ) -> Result<(), InteractionError> {
        let msg = Message {
            uri_from: self.uri.clone(),
            uri_to: self.peer.clone(),
            authentication_id: self.authentication_id.clone(),
            encoding_id: self.encoding_id,
            timestamp: Time::now(),
            qos_level: self.qos_level,
            priority: self.priority,
            domain: self.domain.clone(),
            network_zone: self.network_zone.clone(),
            session: self.session,
            session_name: self.session_name.clone(),
            interaction_type,
            interaction_stage,
            transaction_id: self.transaction_id,
            service_area: self.service_area,
            service: self.service,
            operation: self.operation,
            area_version: self.area_version,
            is_error_message: is_error,
            body,
        };
        self.transmit.transmit(msg)?;
        Ok(())
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// URI of the peer that opened this transaction.
    pub fn peer(&self) -> &Uri {
        &self.peer
    }
}

/// Sum of the per-pattern transaction variants handed to provider
/// handlers.
#[derive(Clone)]
pub enum Transaction {
    Send(SendTransaction),
    Submit(SubmitTransaction),
    Request(RequestTransaction),
    Invoke(InvokeTransaction),
    Progress(ProgressTransaction),
    Subscriber(SubscriberTransaction),
    Publisher(PublisherTransaction),
}

impl Transaction {
    /// Builds the variant matching the initial message, or `None` for a
    /// stage no provider-side transaction exists for.
    pub(crate) fn from_initial(endpoint: &Arc<EndpointShared>, msg: &Message) -> Option<Self> {
        let core = TransactionCore::from_initial(endpoint, msg);
        let transaction = match msg.interaction_type {
            InteractionType::Send => Transaction::Send(SendTransaction { _core: core }),
            InteractionType::Submit => Transaction::Submit(SubmitTransaction { core }),
            InteractionType::Request => Transaction::Request(RequestTransaction { core }),
            InteractionType::Invoke => Transaction::Invoke(InvokeTransaction { core }),
            InteractionType::Progress => Transaction::Progress(ProgressTransaction { core }),
            InteractionType::PubSub => match msg.interaction_stage {
                stage::PUBSUB_REGISTER | stage::PUBSUB_DEREGISTER => {
                    Transaction::Subscriber(SubscriberTransaction { core })
                }
                stage::PUBSUB_PUBLISH_REGISTER
                | stage::PUBSUB_PUBLISH
                | stage::PUBSUB_PUBLISH_DEREGISTER => {
                    Transaction::Publisher(PublisherTransaction { core })
                }
                _ => return None,
            },
        };
        Some(transaction)
    }

    pub fn transaction_id(&self) -> u64 {
        self.core().transaction_id()
    }

    pub fn peer(&self) -> &Uri {
        self.core().peer()
    }

    fn core(&self) -> &TransactionCore {
        match self {
            Transaction::Send(t) => &t._core,
            Transaction::Submit(t) => &t.core,
            Transaction::Request(t) => &t.core,
            Transaction::Invoke(t) => &t.core,
            Transaction::Progress(t) => &t.core,
            Transaction::Subscriber(t) => &t.core,
            Transaction::Publisher(t) => &t.core,
        }
    }
}

/// SEND has no reply stage; the transaction only carries context.
#[derive(Clone)]
pub struct SendTransaction {
    _core: TransactionCore,
}

#[derive(Clone)]
pub struct SubmitTransaction {
    core: TransactionCore,
}

impl SubmitTransaction {
    pub fn ack(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core
            .reply(InteractionType::Submit, stage::SUBMIT_ACK, body, is_error)
    }
}

#[derive(Clone)]
pub struct RequestTransaction {
    core: TransactionCore,
}

impl RequestTransaction {
    pub fn reply(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::Request,
            stage::REQUEST_RESPONSE,
            body,
            is_error,
        )
    }
}

#[derive(Clone)]
pub struct InvokeTransaction {
    core: TransactionCore,
}

impl InvokeTransaction {
    pub fn ack(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core
            .reply(InteractionType::Invoke, stage::INVOKE_ACK, body, is_error)
    }

    pub fn reply(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::Invoke,
            stage::INVOKE_RESPONSE,
            body,
            is_error,
        )
    }
}

#[derive(Clone)]
pub struct ProgressTransaction {
    core: TransactionCore,
}

impl ProgressTransaction {
    pub fn ack(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core
            .reply(InteractionType::Progress, stage::PROGRESS_ACK, body, is_error)
    }

    pub fn update(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::Progress,
            stage::PROGRESS_UPDATE,
            body,
            is_error,
        )
    }

    pub fn reply(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::Progress,
            stage::PROGRESS_RESPONSE,
            body,
            is_error,
        )
    }
}

#[derive(Clone)]
pub struct SubscriberTransaction {
    core: TransactionCore,
}

impl SubscriberTransaction {
    pub fn ack_register(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::PubSub,
            stage::PUBSUB_REGISTER_ACK,
            body,
            is_error,
        )
    }

    pub fn notify(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core
            .reply(InteractionType::PubSub, stage::PUBSUB_NOTIFY, body, is_error)
    }

    pub fn ack_deregister(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::PubSub,
            stage::PUBSUB_DEREGISTER_ACK,
            body,
            is_error,
        )
    }
}

#[derive(Clone)]
pub struct PublisherTransaction {
    core: TransactionCore,
}

impl PublisherTransaction {
    pub fn ack_register(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::PubSub,
            stage::PUBSUB_PUBLISH_REGISTER_ACK,
            body,
            is_error,
        )
    }

    pub fn ack_deregister(&self, body: Bytes, is_error: bool) -> Result<(), InteractionError> {
        self.core.reply(
            InteractionType::PubSub,
            stage::PUBSUB_PUBLISH_DEREGISTER_ACK,
            body,
            is_error,
        )
    }
}
