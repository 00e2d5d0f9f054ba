//! Process-wide context: one MAL/TCP transport plus the registry that
//! binds endpoint URIs to their listeners.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;

use crate::codec::ElementRegistry;
use crate::transport::{
    TcpTransport, TransmitHandle, TransportCallback, TransportConfig, TransportError,
};
use crate::types::{Message, Uri};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("endpoint already registered under {0}")]
    EndpointExists(Uri),
    #[error("no endpoint registered under {0}")]
    UnknownEndpoint(Uri),
    #[error("handler already registered for operation {key:#x}")]
    HandlerExists { key: u64 },
    #[error("no handler registered for operation {key:#x}")]
    HandlerNotRegistered { key: u64 },
    #[error("handler registered for {registered}, message is {requested}")]
    HandlerTypeMismatch {
        registered: crate::types::InteractionType,
        requested: crate::types::InteractionType,
    },
    #[error("transaction {0} already has an outstanding operation")]
    DuplicateTransaction(u64),
    #[error("no outstanding operation for transaction {0}")]
    UnknownTransaction(u64),
    #[error("endpoint registry lock poisoned")]
    LockPoisoned,
}

/// Inbound half of an endpoint, registered weakly with its context.
pub(crate) trait MessageListener: Send + Sync {
    fn on_message(&self, msg: Message);
}

pub struct Context {
    shared: Arc<ContextShared>,
    transport: TcpTransport,
}

pub(crate) struct ContextShared {
    base_uri: Uri,
    listeners: RwLock<HashMap<String, Weak<dyn MessageListener>>>,
    elements: Arc<ElementRegistry>,
}

impl ContextShared {
    pub(crate) fn register_listener(
        &self,
        uri: &Uri,
        listener: Weak<dyn MessageListener>,
    ) -> Result<(), RoutingError> {
        let mut listeners = self
            .listeners
            .write()
            .map_err(|_| RoutingError::LockPoisoned)?;
        // A dead weak entry under the same URI is reclaimable.
        if let Some(existing) = listeners.get(uri.as_str())
            && existing.upgrade().is_some()
        {
            return Err(RoutingError::EndpointExists(uri.clone()));
        }
        listeners.insert(uri.as_str().to_string(), listener);
        Ok(())
    }

    pub(crate) fn unregister_listener(&self, uri: &Uri) -> Result<(), RoutingError> {
        let mut listeners = self
            .listeners
            .write()
            .map_err(|_| RoutingError::LockPoisoned)?;
        if listeners.remove(uri.as_str()).is_none() {
            return Err(RoutingError::UnknownEndpoint(uri.clone()));
        }
        Ok(())
    }
}

impl TransportCallback for ContextShared {
    fn receive(&self, msg: Message) {
        let listener = {
            let Ok(listeners) = self.listeners.read() else {
                tracing::error!("endpoint registry lock poisoned, dropping message");
                return;
            };
            listeners.get(msg.uri_to.as_str()).and_then(Weak::upgrade)
        };
        match listener {
            Some(listener) => listener.on_message(msg),
            None => {
                tracing::warn!(uri_to = %msg.uri_to, "no endpoint for destination, dropping message");
            }
        }
    }
}

impl Context {
    /// Binds a transport for `maltcp://host:port` with the default
    /// element registry.
    pub fn bind(host: &str, port: u16, config: TransportConfig) -> Result<Self, TransportError> {
        Self::bind_with_elements(host, port, config, ElementRegistry::with_mal_elements())
    }

    /// Binds with an application-supplied element table (built once, at
    /// startup; there is no process-global registration).
    pub fn bind_with_elements(
        host: &str,
        port: u16,
        config: TransportConfig,
        elements: ElementRegistry,
    ) -> Result<Self, TransportError> {
        let shared = Arc::new(ContextShared {
            base_uri: Uri::new(format!("{}{host}:{port}", crate::types::MALTCP_PREFIX)),
            listeners: RwLock::new(HashMap::new()),
            elements: Arc::new(elements),
        });
        let callback: Arc<dyn TransportCallback> = shared.clone();
        let transport = TcpTransport::bind(host, port, config, callback)?;
        Ok(Self { shared, transport })
    }

    /// Base URI of this context, `maltcp://host:port`.
    pub fn uri(&self) -> &Uri {
        &self.shared.base_uri
    }

    /// Builds the URI of a service endpoint at this context.
    pub fn new_uri(&self, service: &str) -> Uri {
        Uri::new(format!("{}/{service}", self.shared.base_uri))
    }

    pub fn elements(&self) -> Arc<ElementRegistry> {
        Arc::clone(&self.shared.elements)
    }

    pub(crate) fn transmit_handle(&self) -> TransmitHandle {
        self.transport.handle()
    }

    pub(crate) fn shared_handle(&self) -> Arc<ContextShared> {
        Arc::clone(&self.shared)
    }

    /// Shuts the transport down; endpoints learn of the closure through
    /// their own `close`.
    pub fn close(&mut self) {
        self.transport.close();
    }
}
