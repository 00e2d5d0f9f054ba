//! Endpoint (ClientContext): the per-participant routing table mapping
//! transaction ids to consumer operations and service keys to provider
//! handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use crossbeam::channel::Sender;

use crate::api::operations::{
    InvokeOperation, OpEvent, ProgressOperation, PublisherOperation, RequestOperation,
    SendOperation, SubmitOperation, SubscriberOperation,
};
use crate::api::transactions::Transaction;
use crate::api::{InteractionError, handler_key};
use crate::context::{Context, ContextShared, MessageListener, RoutingError};
use crate::transport::TransmitHandle;
use crate::types::{
    Blob, Identifier, IdentifierList, InteractionType, Message, QosLevel, SessionType, Uri,
};

/// Provider-side dispatch target for one registered operation.
pub type ProviderHandler =
    Arc<dyn Fn(Message, Transaction) -> Result<(), crate::Error> + Send + Sync>;

#[derive(Clone)]
struct HandlerDesc {
    pattern: InteractionType,
    handler: ProviderHandler,
}

/// Fields stamped onto every outbound message of this endpoint unless an
/// operation overrides them.
#[derive(Clone, Debug, Default)]
pub(crate) struct EndpointStamp {
    pub authentication_id: Blob,
    pub encoding_id: u8,
    pub qos_level: QosLevel,
    pub priority: u32,
    pub domain: IdentifierList,
    pub network_zone: Identifier,
    pub session: SessionType,
    pub session_name: Identifier,
}

pub(crate) struct EndpointShared {
    uri: Uri,
    transmit: TransmitHandle,
    stamp: RwLock<EndpointStamp>,
    concurrency: AtomicBool,
    tx_counter: AtomicU64,
    operations: Mutex<HashMap<u64, Sender<OpEvent>>>,
    handlers: Mutex<HashMap<u64, HandlerDesc>>,
}

impl EndpointShared {
    pub(crate) fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn transmit(&self, msg: Message) -> Result<(), InteractionError> {
        self.transmit.transmit(msg)?;
        Ok(())
    }

    pub(crate) fn transmit_handle(&self) -> TransmitHandle {
        self.transmit.clone()
    }

    pub(crate) fn stamp(&self) -> Result<EndpointStamp, InteractionError> {
        self.stamp
            .read()
            .map(|stamp| stamp.clone())
            .map_err(|_| RoutingError::LockPoisoned.into())
    }

    /// Allocates the next transaction id; ids start at 1 and wrap at
    /// 2^64, effectively never for the lifetime of an endpoint.
    pub(crate) fn next_transaction_id(&self) -> u64 {
        self.tx_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn register_op(
        &self,
        transaction_id: u64,
        sender: Sender<OpEvent>,
    ) -> Result<(), RoutingError> {
        let mut operations = self.operations.lock().map_err(|_| RoutingError::LockPoisoned)?;
        if operations.contains_key(&transaction_id) {
            tracing::warn!(transaction_id, "operation already registered for transaction");
            return Err(RoutingError::DuplicateTransaction(transaction_id));
        }
        operations.insert(transaction_id, sender);
        Ok(())
    }

    pub(crate) fn deregister_op(&self, transaction_id: u64) -> Result<(), RoutingError> {
        let mut operations = self.operations.lock().map_err(|_| RoutingError::LockPoisoned)?;
        if operations.remove(&transaction_id).is_none() {
            return Err(RoutingError::UnknownTransaction(transaction_id));
        }
        Ok(())
    }

    fn dispatch_provider(self: &Arc<Self>, msg: Message) {
        let key = handler_key(msg.service_area, msg.area_version, msg.service, msg.operation);
        let desc = {
            let Ok(handlers) = self.handlers.lock() else {
                tracing::error!("handler map lock poisoned, dropping message");
                return;
            };
            handlers.get(&key).cloned()
        };
        let Some(desc) = desc else {
            let err = RoutingError::HandlerNotRegistered { key };
            tracing::warn!("cannot route message: {err}");
            return;
        };
        if desc.pattern != msg.interaction_type {
            let err = RoutingError::HandlerTypeMismatch {
                registered: desc.pattern,
                requested: msg.interaction_type,
            };
            tracing::warn!("cannot route message: {err}");
            return;
        }

        let Some(transaction) = Transaction::from_initial(self, &msg) else {
            tracing::warn!(
                stage = msg.interaction_stage,
                "unknown interaction stage for {}, dropping message",
                msg.interaction_type
            );
            return;
        };

        if self.concurrency.load(Ordering::Relaxed) {
            // One thread per message; ordering becomes the provider's
            // responsibility.
            let handler = desc.handler.clone();
            thread::spawn(move || {
                if let Err(err) = handler(msg, transaction) {
                    tracing::warn!("provider handler failed: {err}");
                }
            });
        } else if let Err(err) = (desc.handler)(msg, transaction) {
            tracing::warn!("provider handler failed: {err}");
        }
    }

    fn dispatch_continuation(&self, msg: Message) {
        let transaction_id = msg.transaction_id;
        let sender = {
            let Ok(operations) = self.operations.lock() else {
                tracing::error!("operations map lock poisoned, dropping message");
                return;
            };
            operations.get(&transaction_id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(OpEvent::Message(Box::new(msg))).is_err() {
                    tracing::warn!(transaction_id, "operation gone, dropping message");
                }
            }
            None => {
                let err = RoutingError::UnknownTransaction(transaction_id);
                tracing::warn!("cannot route message: {err}");
            }
        }
    }

    fn close_ops(&self) {
        if let Ok(mut operations) = self.operations.lock() {
            for (transaction_id, sender) in operations.drain() {
                tracing::debug!(transaction_id, "closing outstanding operation");
                let _ = sender.send(OpEvent::Closed);
            }
        }
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
    }
}

/// Adapter registered with the context; re-borrows the endpoint's `Arc`
/// so provider dispatch can seed transactions with it.
pub(crate) struct ArcListener(pub(crate) Arc<EndpointShared>);

impl MessageListener for ArcListener {
    fn on_message(&self, msg: Message) {
        if msg.is_provider_initial() {
            self.0.dispatch_provider(msg);
        } else {
            self.0.dispatch_continuation(msg);
        }
    }
}

/// A named participant at a context: one URI, the outstanding consumer
/// operations and the registered provider handlers.
pub struct ClientContext {
    shared: Arc<EndpointShared>,
    _listener: Arc<ArcListener>,
    ctx: Arc<ContextShared>,
    closed: bool,
}

impl ClientContext {
    pub fn new(ctx: &Context, service: &str) -> Result<Self, RoutingError> {
        let uri = ctx.new_uri(service);
        let shared = Arc::new(EndpointShared {
            uri: uri.clone(),
            transmit: ctx.transmit_handle(),
            stamp: RwLock::new(EndpointStamp::default()),
            concurrency: AtomicBool::new(false),
            tx_counter: AtomicU64::new(0),
            operations: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        });
        let listener = Arc::new(ArcListener(Arc::clone(&shared)));
        let ctx_shared = ctx.shared_handle();
        let listener_dyn: Arc<dyn MessageListener> = listener.clone();
        let weak: Weak<dyn MessageListener> = Arc::downgrade(&listener_dyn);
        ctx_shared.register_listener(&uri, weak)?;
        Ok(Self {
            shared,
            _listener: listener,
            ctx: ctx_shared,
            closed: false,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.shared.uri
    }

    // Builder-style configuration; stamped on outbound messages unless an
    // operation overrides.

    pub fn set_authentication_id(&self, authentication_id: Blob) -> &Self {
        self.update_stamp(|stamp| stamp.authentication_id = authentication_id);
        self
    }

    pub fn set_encoding_id(&self, encoding_id: u8) -> &Self {
        self.update_stamp(|stamp| stamp.encoding_id = encoding_id);
        self
    }

    pub fn set_qos_level(&self, qos_level: QosLevel) -> &Self {
        self.update_stamp(|stamp| stamp.qos_level = qos_level);
        self
    }

    pub fn set_priority(&self, priority: u32) -> &Self {
        self.update_stamp(|stamp| stamp.priority = priority);
        self
    }

    pub fn set_domain(&self, domain: IdentifierList) -> &Self {
        self.update_stamp(|stamp| stamp.domain = domain);
        self
    }

    pub fn set_network_zone(&self, network_zone: Identifier) -> &Self {
        self.update_stamp(|stamp| stamp.network_zone = network_zone);
        self
    }

    pub fn set_session(&self, session: SessionType) -> &Self {
        self.update_stamp(|stamp| stamp.session = session);
        self
    }

    pub fn set_session_name(&self, session_name: Identifier) -> &Self {
        self.update_stamp(|stamp| stamp.session_name = session_name);
        self
    }

    /// With concurrency on, each inbound provider-side message runs its
    /// handler on its own thread and message ordering is the provider's
    /// problem.
    pub fn set_concurrency(&self, concurrency: bool) -> &Self {
        self.shared.concurrency.store(concurrency, Ordering::Relaxed);
        self
    }

    fn update_stamp(&self, update: impl FnOnce(&mut EndpointStamp)) {
        if let Ok(mut stamp) = self.shared.stamp.write() {
            update(&mut stamp);
        }
    }

    // Consumer-side operation constructors.

    pub fn send_operation(
        &self,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<SendOperation, InteractionError> {
        SendOperation::new(Arc::clone(&self.shared), target, area, area_version, service, operation)
    }

    pub fn submit_operation(
        &self,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<SubmitOperation, InteractionError> {
        SubmitOperation::new(Arc::clone(&self.shared), target, area, area_version, service, operation)
    }

    pub fn request_operation(
        &self,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<RequestOperation, InteractionError> {
        RequestOperation::new(Arc::clone(&self.shared), target, area, area_version, service, operation)
    }

    pub fn invoke_operation(
        &self,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<InvokeOperation, InteractionError> {
        InvokeOperation::new(Arc::clone(&self.shared), target, area, area_version, service, operation)
    }

    pub fn progress_operation(
        &self,
        target: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<ProgressOperation, InteractionError> {
        ProgressOperation::new(Arc::clone(&self.shared), target, area, area_version, service, operation)
    }

    pub fn subscriber_operation(
        &self,
        broker: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<SubscriberOperation, InteractionError> {
        SubscriberOperation::new(Arc::clone(&self.shared), broker, area, area_version, service, operation)
    }

    pub fn publisher_operation(
        &self,
        broker: Uri,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<PublisherOperation, InteractionError> {
        PublisherOperation::new(Arc::clone(&self.shared), broker, area, area_version, service, operation)
    }

    // Provider-side handler registry.

    pub fn register_handler<F>(
        &self,
        pattern: InteractionType,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
        handler: F,
    ) -> Result<(), RoutingError>
    where
        F: Fn(Message, Transaction) -> Result<(), crate::Error> + Send + Sync + 'static,
    {
        let key = handler_key(area, area_version, service, operation);
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .map_err(|_| RoutingError::LockPoisoned)?;
        if handlers.contains_key(&key) {
            tracing::error!(key = %format_args!("{key:#x}"), "handler already registered");
            return Err(RoutingError::HandlerExists { key });
        }
        tracing::debug!(key = %format_args!("{key:#x}"), %pattern, "handler registered");
        handlers.insert(
            key,
            HandlerDesc {
                pattern,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn deregister_handler(
        &self,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<(), RoutingError> {
        let key = handler_key(area, area_version, service, operation);
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .map_err(|_| RoutingError::LockPoisoned)?;
        if handlers.remove(&key).is_none() {
            tracing::warn!(key = %format_args!("{key:#x}"), "no handler registered");
            return Err(RoutingError::HandlerNotRegistered { key });
        }
        Ok(())
    }

    /// Registers a PUB/SUB handler covering every broker-bound stage of
    /// the operation.
    pub fn register_broker_handler<F>(
        &self,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
        handler: F,
    ) -> Result<(), RoutingError>
    where
        F: Fn(Message, Transaction) -> Result<(), crate::Error> + Send + Sync + 'static,
    {
        self.register_handler(InteractionType::PubSub, area, area_version, service, operation, handler)
    }

    /// Unregisters the endpoint and cancels every outstanding operation.
    pub fn close(&mut self) -> Result<(), RoutingError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::debug!(uri = %self.shared.uri, "closing endpoint");
        self.ctx.unregister_listener(&self.shared.uri)?;
        self.shared.close_ops();
        Ok(())
    }
}
