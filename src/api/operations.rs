//! Consumer-side interaction state machines. Each operation owns the
//! receiving half of a channel fed by its endpoint; the sending half is
//! keyed by transaction id in the endpoint's operations map and removed
//! at the pattern's terminal stage.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{Receiver, unbounded};

use crate::api::InteractionError;
use crate::api::endpoint::EndpointShared;
use crate::types::{InteractionType, Message, Time, Uri, stage};

pub(crate) enum OpEvent {
    Message(Box<Message>),
    Closed,
}

struct OperationCore {
    endpoint: Arc<EndpointShared>,
    target: Uri,
    transaction_id: u64,
    area: u16,
    area_version: u8,
    service: u16,
    operation: u16,
    events: Receiver<OpEvent>,
    registered: bool,
}

impl OperationCore {
    fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        let transaction_id = endpoint.next_transaction_id();
        let (sender, events) = unbounded();
        endpoint.register_op(transaction_id, sender)?;
        Ok(Self {
            endpoint,
            target,
            transaction_id,
            area,
            area_version,
            service,
            operation,
            events,
            registered: true,
        })
    }

    fn message(
        &self,
        interaction_type: InteractionType,
        interaction_stage: u8,
        body: Bytes,
    ) -> Result<Message, InteractionError> {
        let stamp = self.endpoint.stamp()?;
        Ok(Message {
            uri_from: self.endpoint.uri().clone(),
            uri_to: self.target.clone(),
            authentication_id: stamp.authentication_id,
            encoding_id: stamp.encoding_id,
            timestamp: Time::now(),
            qos_level: stamp.qos_level,
            priority: stamp.priority,
            domain: stamp.domain,
            network_zone: stamp.network_zone,
            session: stamp.session,
            session_name: stamp.session_name,
            interaction_type,
            interaction_stage,
            transaction_id: self.transaction_id,
            service_area: self.area,
            service: self.service,
            operation: self.operation,
            area_version: self.area_version,
            is_error_message: false,
            body,
        })
    }

    fn initiate(
        &self,
        interaction_type: InteractionType,
        interaction_stage: u8,
        body: Bytes,
    ) -> Result<(), InteractionError> {
        let msg = self.message(interaction_type, interaction_stage, body)?;
        self.endpoint.transmit(msg)
    }

    /// Blocks for the next reply at one of the expected stages. An error
    /// reply is terminal regardless of stage; replies at other stages are
    /// logged and dropped without disturbing the operation.
    fn wait_for(&mut self, expected: &[u8]) -> Result<Message, InteractionError> {
        loop {
            let msg = match self.events.recv() {
                Ok(OpEvent::Message(msg)) => *msg,
                Ok(OpEvent::Closed) | Err(_) => {
                    self.registered = false;
                    return Err(InteractionError::Closed);
                }
            };
            if msg.is_error_message {
                self.finish();
                return Err(InteractionError::ErrorReply(Box::new(msg)));
            }
            if expected.contains(&msg.interaction_stage) {
                return Ok(msg);
            }
            tracing::warn!(
                transaction_id = self.transaction_id,
                stage = msg.interaction_stage,
                "unexpected stage, dropping message"
            );
        }
    }

    /// Surfaces an error reply that already sits in the queue, without
    /// blocking.
    fn poll_error(&mut self) -> Result<(), InteractionError> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                OpEvent::Message(msg) if msg.is_error_message => {
                    self.finish();
                    return Err(InteractionError::ErrorReply(msg));
                }
                OpEvent::Message(msg) => {
                    tracing::warn!(
                        transaction_id = self.transaction_id,
                        stage = msg.interaction_stage,
                        "unexpected stage, dropping message"
                    );
                }
                OpEvent::Closed => {
                    self.registered = false;
                    return Err(InteractionError::Closed);
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.registered {
            self.registered = false;
            let _ = self.endpoint.deregister_op(self.transaction_id);
        }
    }

    fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

impl Drop for OperationCore {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpState {
    Initial,
    Running,
    Done,
}

/// SEND: one message, no reply, terminal on both sides.
pub struct SendOperation {
    core: OperationCore,
}

impl SendOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, target, area, area_version, service, operation)?,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn send(mut self, body: Bytes) -> Result<(), InteractionError> {
        self.core.initiate(InteractionType::Send, stage::INIT, body)?;
        self.core.finish();
        Ok(())
    }
}

/// SUBMIT: stage 1 out, stage 2 SUBMIT_ACK (or error) back.
pub struct SubmitOperation {
    core: OperationCore,
    state: OpState,
}

impl SubmitOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, target, area, area_version, service, operation)?,
            state: OpState::Initial,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn submit(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Initial {
            return Err(InteractionError::BadStage { action: "submit" });
        }
        self.core.initiate(InteractionType::Submit, stage::INIT, body)?;
        let result = self.core.wait_for(&[stage::SUBMIT_ACK]);
        self.state = OpState::Done;
        self.core.finish();
        result
    }
}

/// REQUEST: stage 1 out, stage 2 RESPONSE (or error) back.
pub struct RequestOperation {
    core: OperationCore,
    state: OpState,
}

impl RequestOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, target, area, area_version, service, operation)?,
            state: OpState::Initial,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn request(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Initial {
            return Err(InteractionError::BadStage { action: "request" });
        }
        self.core.initiate(InteractionType::Request, stage::INIT, body)?;
        let result = self.core.wait_for(&[stage::REQUEST_RESPONSE]);
        self.state = OpState::Done;
        self.core.finish();
        result
    }
}

/// INVOKE: stage 1 out, stage 2 ACK, stage 3 RESPONSE; an error at
/// either reply stage is terminal.
pub struct InvokeOperation {
    core: OperationCore,
    state: OpState,
}

impl InvokeOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, target, area, area_version, service, operation)?,
            state: OpState::Initial,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn invoke(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Initial {
            return Err(InteractionError::BadStage { action: "invoke" });
        }
        self.core.initiate(InteractionType::Invoke, stage::INIT, body)?;
        let ack = match self.core.wait_for(&[stage::INVOKE_ACK]) {
            Ok(ack) => ack,
            Err(err) => {
                self.state = OpState::Done;
                return Err(err);
            }
        };
        self.state = OpState::Running;
        Ok(ack)
    }

    pub fn response(&mut self) -> Result<Message, InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "response" });
        }
        let result = self.core.wait_for(&[stage::INVOKE_RESPONSE]);
        self.state = OpState::Done;
        self.core.finish();
        result
    }
}

/// PROGRESS: stage 1 out, stage 2 ACK, zero or more stage 3 UPDATEs,
/// stage 4 RESPONSE.
pub struct ProgressOperation {
    core: OperationCore,
    state: OpState,
    response: Option<Message>,
}

impl ProgressOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, target, area, area_version, service, operation)?,
            state: OpState::Initial,
            response: None,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn progress(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Initial {
            return Err(InteractionError::BadStage { action: "progress" });
        }
        self.core.initiate(InteractionType::Progress, stage::INIT, body)?;
        let ack = match self.core.wait_for(&[stage::PROGRESS_ACK]) {
            Ok(ack) => ack,
            Err(err) => {
                self.state = OpState::Done;
                return Err(err);
            }
        };
        self.state = OpState::Running;
        Ok(ack)
    }

    /// Next UPDATE, or `None` once the RESPONSE has arrived; fetch the
    /// latter with [`ProgressOperation::response`].
    pub fn update(&mut self) -> Result<Option<Message>, InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "update" });
        }
        let msg = match self
            .core
            .wait_for(&[stage::PROGRESS_UPDATE, stage::PROGRESS_RESPONSE])
        {
            Ok(msg) => msg,
            Err(err) => {
                self.state = OpState::Done;
                return Err(err);
            }
        };
        if msg.interaction_stage == stage::PROGRESS_RESPONSE {
            self.response = Some(msg);
            self.state = OpState::Done;
            self.core.finish();
            return Ok(None);
        }
        Ok(Some(msg))
    }

    pub fn response(&mut self) -> Result<Message, InteractionError> {
        self.response
            .take()
            .ok_or(InteractionError::BadStage { action: "response" })
    }
}

/// PUB/SUB subscriber half: REGISTER, repeated NOTIFY, DEREGISTER.
pub struct SubscriberOperation {
    core: OperationCore,
    state: OpState,
}

impl SubscriberOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        broker: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, broker, area, area_version, service, operation)?,
            state: OpState::Initial,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn register(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state == OpState::Done {
            return Err(InteractionError::BadStage { action: "register" });
        }
        self.core
            .initiate(InteractionType::PubSub, stage::PUBSUB_REGISTER, body)?;
        let ack = match self.core.wait_for(&[stage::PUBSUB_REGISTER_ACK]) {
            Ok(ack) => ack,
            Err(err) => {
                self.state = OpState::Done;
                return Err(err);
            }
        };
        self.state = OpState::Running;
        Ok(ack)
    }

    /// Blocks for the next NOTIFY carried by this subscription.
    pub fn notify(&mut self) -> Result<Message, InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "notify" });
        }
        self.core.wait_for(&[stage::PUBSUB_NOTIFY]).inspect_err(|_| {
            self.state = OpState::Done;
        })
    }

    pub fn deregister(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "deregister" });
        }
        self.core
            .initiate(InteractionType::PubSub, stage::PUBSUB_DEREGISTER, body)?;
        let result = self.core.wait_for(&[stage::PUBSUB_DEREGISTER_ACK]);
        self.state = OpState::Done;
        self.core.finish();
        result
    }
}

/// PUB/SUB publisher half: PUBLISH_REGISTER, repeated PUBLISH,
/// PUBLISH_DEREGISTER. A broker echoing an error PUBLISH surfaces it on
/// the next call into this operation.
pub struct PublisherOperation {
    core: OperationCore,
    state: OpState,
}

impl PublisherOperation {
    pub(crate) fn new(
        endpoint: Arc<EndpointShared>,
        broker: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, InteractionError> {
        Ok(Self {
            core: OperationCore::new(endpoint, broker, area, area_version, service, operation)?,
            state: OpState::Initial,
        })
    }

    pub fn transaction_id(&self) -> u64 {
        self.core.transaction_id()
    }

    pub fn register(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state == OpState::Done {
            return Err(InteractionError::BadStage { action: "publish_register" });
        }
        self.core
            .initiate(InteractionType::PubSub, stage::PUBSUB_PUBLISH_REGISTER, body)?;
        let ack = match self.core.wait_for(&[stage::PUBSUB_PUBLISH_REGISTER_ACK]) {
            Ok(ack) => ack,
            Err(err) => {
                self.state = OpState::Done;
                return Err(err);
            }
        };
        self.state = OpState::Running;
        Ok(ack)
    }

    /// Fire-and-forget publication of one update batch.
    pub fn publish(&mut self, body: Bytes) -> Result<(), InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "publish" });
        }
        self.core.poll_error().inspect_err(|_| {
            self.state = OpState::Done;
        })?;
        self.core
            .initiate(InteractionType::PubSub, stage::PUBSUB_PUBLISH, body)
    }

    pub fn deregister(&mut self, body: Bytes) -> Result<Message, InteractionError> {
        if self.state != OpState::Running {
            return Err(InteractionError::BadStage { action: "publish_deregister" });
        }
        self.core.initiate(
            InteractionType::PubSub,
            stage::PUBSUB_PUBLISH_DEREGISTER,
            body,
        )?;
        let result = self.core.wait_for(&[stage::PUBSUB_PUBLISH_DEREGISTER_ACK]);
        self.state = OpState::Done;
        self.core.finish();
        result
    }
}
