//! PUB/SUB broker: subscription store, matching engine and NOTIFY
//! fan-out. Generic over the update value slot so the broker stays
//! agnostic of the element type travelling next to the update headers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::api::{ClientContext, PublisherTransaction, SubscriberTransaction, Transaction};
use crate::codec::{CodecError, Decoder, Encoder};
use crate::context::Context;
use crate::types::composites::{
    decode_blob_list, decode_entity_key_list, decode_identifier_list, decode_update_header_list,
    encode_blob_list, encode_update_header_list,
};
use crate::types::{
    BlobList, EntityKey, EntityKeyList, EntityRequestList, Identifier, IdentifierList, Message,
    SessionType, Subscription, UpdateHeaderList, Uri, stage,
};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("update header and value lists have different lengths ({headers} != {values})")]
    BadHeaderAndValueListLengths { headers: usize, values: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("stage {stage} reached the broker with the wrong transaction kind")]
    WrongTransaction { stage: u8 },
    #[error("broker state lock poisoned")]
    LockPoisoned,
}

/// The polymorphic update value slot of a publication. The broker
/// decodes one value list per PUBLISH, filters it per subscription in
/// lock-step with the header list, and re-encodes the filtered values
/// into each NOTIFY.
pub trait UpdateValueHandler: Send + 'static {
    fn decode_values(&mut self, decoder: &mut Decoder<'_>) -> Result<(), CodecError>;
    fn value_count(&self) -> usize;
    /// Moves value `idx` of the decoded list into the filter buffer.
    fn append_value(&mut self, idx: usize);
    /// Encodes and drains the filter buffer.
    fn encode_values(&mut self, encoder: &mut Encoder) -> Result<(), CodecError>;
    fn reset_values(&mut self);
}

/// `UpdateValueHandler` for Blob update values.
#[derive(Default)]
pub struct BlobUpdateHandler {
    list: BlobList,
    values: BlobList,
}

impl BlobUpdateHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpdateValueHandler for BlobUpdateHandler {
    fn decode_values(&mut self, decoder: &mut Decoder<'_>) -> Result<(), CodecError> {
        self.list = decode_blob_list(decoder)?;
        self.values = Vec::with_capacity(self.list.len());
        Ok(())
    }

    fn value_count(&self) -> usize {
        self.list.len()
    }

    fn append_value(&mut self, idx: usize) {
        self.values.push(self.list[idx].clone());
    }

    fn encode_values(&mut self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encode_blob_list(&self.values, encoder)?;
        self.values.clear();
        Ok(())
    }

    fn reset_values(&mut self) {
        self.values.clear();
    }
}

/// Scoping and entity filters of one stored subscription, captured from
/// the REGISTER message.
#[derive(Clone, Debug)]
pub struct SubscriptionFilter {
    pub domain: IdentifierList,
    pub session: SessionType,
    pub session_name: Identifier,
    pub service_area: u16,
    pub service: u16,
    pub operation: u16,
    pub entities: EntityRequestList,
}

impl SubscriptionFilter {
    fn from_register(msg: &Message, entities: EntityRequestList) -> Self {
        Self {
            domain: msg.domain.clone(),
            session: msg.session,
            session_name: msg.session_name.clone(),
            service_area: msg.service_area,
            service: msg.service,
            operation: msg.operation,
            entities,
        }
    }

    fn domain_matches(
        &self,
        msg_domain: &IdentifierList,
        sub_domain: Option<&IdentifierList>,
    ) -> bool {
        let mut required: Vec<&Identifier> = self.domain.iter().collect();
        let mut prefix_only = false;
        if let Some(tail) = sub_domain {
            required.extend(tail.iter());
            // A trailing '*' opens the domain to any extension of the
            // prefix.
            if required.last().is_some_and(|name| name.as_str() == "*") {
                prefix_only = true;
                required.pop();
            }
        }
        if msg_domain.len() < required.len() {
            return false;
        }
        if required
            .iter()
            .zip(msg_domain.iter())
            .any(|(required, actual)| *required != actual)
        {
            return false;
        }
        if msg_domain.len() > required.len() {
            return prefix_only;
        }
        true
    }

    /// True when at least one entity request of the subscription covers
    /// the publication and the update key.
    pub fn matches(&self, msg: &Message, key: &EntityKey) -> bool {
        if msg.session != self.session || msg.session_name != self.session_name {
            return false;
        }
        for request in &self.entities {
            if !self.domain_matches(&msg.domain, request.sub_domain.as_ref()) {
                continue;
            }
            if !request.all_areas && msg.service_area != self.service_area {
                continue;
            }
            if !request.all_services && msg.service != self.service {
                continue;
            }
            if !request.all_operations && msg.operation != self.operation {
                continue;
            }
            if request.entity_keys.iter().any(|rkey| rkey.matches(key)) {
                return true;
            }
        }
        false
    }
}

/// Stored subscriber registration. `(subscriber uri, subscription id)`
/// is the primary key.
struct BrokerSub {
    subscription_id: Identifier,
    filter: SubscriptionFilter,
    transaction: SubscriberTransaction,
}

/// The URI of the consumer and the subscription identifier form the
/// unique identifier of the subscription.
fn subkey(uri_from: &Uri, subscription_id: &Identifier) -> String {
    format!("{uri_from}/{subscription_id}")
}

/// Stored publisher registration, keyed by publisher URI. The advertised
/// keys are retained for publication validity checks.
struct BrokerPub {
    #[allow(dead_code)]
    keys: EntityKeyList,
    #[allow(dead_code)]
    transaction: PublisherTransaction,
}

struct BrokerState<H> {
    subs: HashMap<String, BrokerSub>,
    pubs: HashMap<String, BrokerPub>,
    values: H,
}

/// A centralized PUB/SUB routing node backed by one endpoint.
pub struct Broker<H: UpdateValueHandler> {
    cctx: ClientContext,
    state: Arc<Mutex<BrokerState<H>>>,
}

impl<H: UpdateValueHandler> Broker<H> {
    /// Creates the broker endpoint `name` at `ctx` and registers its
    /// PUB/SUB handler for the given operation.
    pub fn new(
        ctx: &Context,
        name: &str,
        values: H,
        area: u16,
        area_version: u8,
        service: u16,
        operation: u16,
    ) -> Result<Self, crate::Error> {
        let cctx = ClientContext::new(ctx, name)?;
        let state = Arc::new(Mutex::new(BrokerState {
            subs: HashMap::new(),
            pubs: HashMap::new(),
            values,
        }));

        let handler_state = Arc::clone(&state);
        cctx.register_broker_handler(
            area,
            area_version,
            service,
            operation,
            move |msg, transaction| {
                on_broker_message(&handler_state, msg, transaction).map_err(crate::Error::from)
            },
        )?;

        Ok(Self { cctx, state })
    }

    pub fn uri(&self) -> &Uri {
        self.cctx.uri()
    }

    /// The endpoint the broker listens on.
    pub fn client_context(&self) -> &ClientContext {
        &self.cctx
    }

    pub fn subscriber_count(&self) -> Result<usize, BrokerError> {
        let state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(state.subs.len())
    }

    pub fn publisher_count(&self) -> Result<usize, BrokerError> {
        let state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(state.pubs.len())
    }

    /// Closes the broker endpoint; remaining registrations die with it.
    pub fn close(&mut self) -> Result<(), crate::Error> {
        self.cctx.close()?;
        Ok(())
    }
}

fn on_broker_message<H: UpdateValueHandler>(
    state: &Arc<Mutex<BrokerState<H>>>,
    msg: Message,
    transaction: Transaction,
) -> Result<(), BrokerError> {
    let mut state = state.lock().map_err(|_| BrokerError::LockPoisoned)?;
    match (msg.interaction_stage, transaction) {
        (stage::PUBSUB_REGISTER, Transaction::Subscriber(transaction)) => {
            on_register(&mut state, &msg, transaction)
        }
        (stage::PUBSUB_DEREGISTER, Transaction::Subscriber(transaction)) => {
            on_deregister(&mut state, &msg, transaction)
        }
        (stage::PUBSUB_PUBLISH_REGISTER, Transaction::Publisher(transaction)) => {
            on_publish_register(&mut state, &msg, transaction)
        }
        (stage::PUBSUB_PUBLISH, Transaction::Publisher(_)) => on_publish(&mut state, &msg),
        (stage::PUBSUB_PUBLISH_DEREGISTER, Transaction::Publisher(transaction)) => {
            on_publish_deregister(&mut state, &msg, transaction)
        }
        (stage, _) => Err(BrokerError::WrongTransaction { stage }),
    }
}

fn on_register<H: UpdateValueHandler>(
    state: &mut BrokerState<H>,
    msg: &Message,
    transaction: SubscriberTransaction,
) -> Result<(), BrokerError> {
    let mut decoder = Decoder::new(&msg.body);
    let subscription = match Subscription::decode(&mut decoder) {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::warn!(uri_from = %msg.uri_from, "bad REGISTER body: {err}");
            transaction.ack_register(Bytes::new(), true).ok();
            return Ok(());
        }
    };

    let key = subkey(&msg.uri_from, &subscription.subscription_id);
    tracing::debug!(%key, "subscriber registered");
    // Replacement of a prior subscription under the same key is atomic:
    // one map insert under the state lock.
    state.subs.insert(
        key,
        BrokerSub {
            subscription_id: subscription.subscription_id,
            filter: SubscriptionFilter::from_register(msg, subscription.entities),
            transaction: transaction.clone(),
        },
    );
    transaction.ack_register(Bytes::new(), false).ok();
    Ok(())
}

fn on_deregister<H: UpdateValueHandler>(
    state: &mut BrokerState<H>,
    msg: &Message,
    transaction: SubscriberTransaction,
) -> Result<(), BrokerError> {
    let mut decoder = Decoder::new(&msg.body);
    match decode_identifier_list(&mut decoder) {
        Ok(ids) => {
            for id in &ids {
                let key = subkey(&msg.uri_from, id);
                tracing::debug!(%key, "subscriber deregistered");
                state.subs.remove(&key);
            }
        }
        Err(err) => {
            tracing::warn!(uri_from = %msg.uri_from, "bad DEREGISTER body: {err}");
        }
    }
    // Always acked, even for unknown subscription ids.
    transaction.ack_deregister(Bytes::new(), false).ok();
    Ok(())
}

fn on_publish_register<H: UpdateValueHandler>(
    state: &mut BrokerState<H>,
    msg: &Message,
    transaction: PublisherTransaction,
) -> Result<(), BrokerError> {
    let mut decoder = Decoder::new(&msg.body);
    let keys = match decode_entity_key_list(&mut decoder) {
        Ok(keys) => keys,
        Err(err) => {
            tracing::warn!(uri_from = %msg.uri_from, "bad PUBLISH_REGISTER body: {err}");
            transaction.ack_register(Bytes::new(), true).ok();
            return Ok(());
        }
    };

    tracing::debug!(uri_from = %msg.uri_from, "publisher registered");
    state.pubs.insert(
        msg.uri_from.as_str().to_string(),
        BrokerPub {
            keys,
            transaction: transaction.clone(),
        },
    );
    transaction.ack_register(Bytes::new(), false).ok();
    Ok(())
}

fn on_publish_deregister<H: UpdateValueHandler>(
    state: &mut BrokerState<H>,
    msg: &Message,
    transaction: PublisherTransaction,
) -> Result<(), BrokerError> {
    tracing::debug!(uri_from = %msg.uri_from, "publisher deregistered");
    state.pubs.remove(msg.uri_from.as_str());
    transaction.ack_deregister(Bytes::new(), false).ok();
    Ok(())
}

fn on_publish<H: UpdateValueHandler>(
    state: &mut BrokerState<H>,
    msg: &Message,
) -> Result<(), BrokerError> {
    let mut decoder = Decoder::new(&msg.body);
    // TODO: on a decode failure, return a PUBLISH error message to the
    // publisher instead of only failing towards the engine.
    let headers = decode_update_header_list(&mut decoder)?;
    let BrokerState { subs, values, .. } = state;
    values.decode_values(&mut decoder)?;

    if headers.len() != values.value_count() {
        return Err(BrokerError::BadHeaderAndValueListLengths {
            headers: headers.len(),
            values: values.value_count(),
        });
    }

    for sub in subs.values() {
        let mut filtered = UpdateHeaderList::new();
        for (idx, header) in headers.iter().enumerate() {
            if sub.filter.matches(msg, &header.key) {
                filtered.push(header.clone());
                values.append_value(idx);
            }
        }
        if filtered.is_empty() {
            values.reset_values();
            continue;
        }

        let mut encoder = Encoder::new();
        encoder.encode_identifier(&sub.subscription_id);
        encode_update_header_list(&filtered, &mut encoder)?;
        values.encode_values(&mut encoder)?;
        if let Err(err) = sub.transaction.notify(encoder.into_bytes(), false) {
            // One slow or dead subscriber must not break the others.
            tracing::warn!(subscription = %sub.subscription_id, "notify failed: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::composites::EntityRequest;
    use crate::types::{InteractionType, Time, identifier_list};

    fn filter(domain: &[&str], entities: EntityRequestList) -> SubscriptionFilter {
        SubscriptionFilter {
            domain: identifier_list(domain),
            session: SessionType::Live,
            session_name: Identifier::from("ops"),
            service_area: 200,
            service: 1,
            operation: 1,
            entities,
        }
    }

    fn publication(domain: &[&str], session: SessionType, session_name: &str) -> Message {
        Message {
            uri_from: Uri::from("maltcp://127.0.0.1:16002/publisher"),
            uri_to: Uri::from("maltcp://127.0.0.1:16000/broker"),
            authentication_id: Default::default(),
            encoding_id: 0,
            timestamp: Time(0),
            qos_level: Default::default(),
            priority: 0,
            domain: identifier_list(domain),
            network_zone: Identifier::from("zone"),
            session,
            session_name: Identifier::from(session_name),
            interaction_type: InteractionType::PubSub,
            interaction_stage: stage::PUBSUB_PUBLISH,
            transaction_id: 1,
            service_area: 200,
            service: 1,
            operation: 1,
            area_version: 1,
            is_error_message: false,
            body: Bytes::new(),
        }
    }

    fn wildcard_request(sub_domain: Option<&[&str]>, keys: EntityKeyList) -> EntityRequest {
        EntityRequest {
            sub_domain: sub_domain.map(|names| identifier_list(names)),
            all_areas: true,
            all_services: true,
            all_operations: true,
            only_on_change: false,
            entity_keys: keys,
        }
    }

    fn key(first: &str) -> EntityKey {
        EntityKey::new(Some(Identifier::from(first)), Some(0), Some(0), Some(0))
    }

    #[test]
    fn session_mismatch_never_matches() {
        let filter = filter(&["sc1"], vec![wildcard_request(None, vec![key("*")])]);
        let msg = publication(&["sc1"], SessionType::Simulation, "ops");
        assert!(!filter.matches(&msg, &key("anything")));

        let msg = publication(&["sc1"], SessionType::Live, "other");
        assert!(!filter.matches(&msg, &key("anything")));
    }

    #[test]
    fn wildcard_key_matches_every_key_in_scope() {
        let filter = filter(&["sc1"], vec![wildcard_request(None, vec![key("*")])]);
        let msg = publication(&["sc1"], SessionType::Live, "ops");
        assert!(filter.matches(&msg, &key("key1")));
        assert!(filter.matches(&msg, &EntityKey::default()));
    }

    #[test]
    fn sub_domain_star_allows_extensions() {
        // Subscriber domain [sc1, payload] + sub-domain ["*"] must match
        // a publication under [sc1, payload, camera].
        let filter = filter(
            &["sc1", "payload"],
            vec![wildcard_request(Some(&["*"]), vec![key("key1")])],
        );
        let msg = publication(&["sc1", "payload", "camera"], SessionType::Live, "ops");
        assert!(filter.matches(&msg, &key("key1")));
        assert!(!filter.matches(&msg, &key("key2")));
    }

    #[test]
    fn domain_mismatch_never_matches() {
        let filter = filter(&["sc2"], vec![wildcard_request(Some(&["*"]), vec![key("*")])]);
        let msg = publication(&["sc1", "payload", "camera"], SessionType::Live, "ops");
        assert!(!filter.matches(&msg, &key("key1")));
    }

    #[test]
    fn exact_domain_requires_equal_length() {
        // Without a trailing '*', the publication domain must equal the
        // required domain elementwise.
        let filter = filter(
            &["sc1", "payload"],
            vec![wildcard_request(None, vec![key("*")])],
        );
        assert!(filter.matches(
            &publication(&["sc1", "payload"], SessionType::Live, "ops"),
            &key("k")
        ));
        assert!(!filter.matches(
            &publication(&["sc1", "payload", "camera"], SessionType::Live, "ops"),
            &key("k")
        ));
        assert!(!filter.matches(&publication(&["sc1"], SessionType::Live, "ops"), &key("k")));
    }

    #[test]
    fn scope_flags_gate_matching() {
        let mut request = wildcard_request(None, vec![key("*")]);
        request.all_areas = false;
        let filter = filter(&["sc1"], vec![request]);

        let mut msg = publication(&["sc1"], SessionType::Live, "ops");
        assert!(filter.matches(&msg, &key("k")));
        msg.service_area = 201;
        assert!(!filter.matches(&msg, &key("k")));
    }

    #[test]
    fn blob_handler_filters_in_lock_step() {
        let mut handler = BlobUpdateHandler::new();
        let blobs = vec![
            crate::types::Blob::new(vec![1]),
            crate::types::Blob::new(vec![2]),
            crate::types::Blob::new(vec![3]),
        ];
        let mut encoder = Encoder::new();
        encode_blob_list(&blobs, &mut encoder).unwrap();
        let bytes = encoder.into_vec();
        let mut decoder = Decoder::new(&bytes);
        handler.decode_values(&mut decoder).unwrap();
        assert_eq!(handler.value_count(), 3);

        handler.append_value(0);
        handler.append_value(2);
        let mut out = Encoder::new();
        handler.encode_values(&mut out).unwrap();
        let out = out.into_vec();
        let mut decoder = Decoder::new(&out);
        let filtered = decode_blob_list(&mut decoder).unwrap();
        assert_eq!(filtered, vec![blobs[0].clone(), blobs[2].clone()]);

        // The filter buffer drains with encode_values.
        let mut again = Encoder::new();
        handler.encode_values(&mut again).unwrap();
        let again = again.into_vec();
        let mut decoder = Decoder::new(&again);
        assert!(decode_blob_list(&mut decoder).unwrap().is_empty());
    }
}
