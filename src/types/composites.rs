//! MAL composite types used by the PUB/SUB subscription algebra.

use crate::codec::{CodecError, Decoder, Encoder};
use crate::types::{Identifier, IdentifierList, Time, Uri};

/// 4-tuple identifying the scope of a publish/subscribe update.
///
/// `None` models the MAL NULL sub-key: it matches only `None`. The
/// wildcards (`*` for the first sub-key, `0` for the others) match any
/// value including NULL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityKey {
    pub first_sub_key: Option<Identifier>,
    pub second_sub_key: Option<i64>,
    pub third_sub_key: Option<i64>,
    pub fourth_sub_key: Option<i64>,
}

impl EntityKey {
    pub fn new(
        first: Option<Identifier>,
        second: Option<i64>,
        third: Option<i64>,
        fourth: Option<i64>,
    ) -> Self {
        Self {
            first_sub_key: first,
            second_sub_key: second,
            third_sub_key: third,
            fourth_sub_key: fourth,
        }
    }

    /// Sub-key matching rule with `self` as the request pattern.
    pub fn matches(&self, key: &EntityKey) -> bool {
        first_sub_key_matches(&self.first_sub_key, &key.first_sub_key)
            && numeric_sub_key_matches(&self.second_sub_key, &key.second_sub_key)
            && numeric_sub_key_matches(&self.third_sub_key, &key.third_sub_key)
            && numeric_sub_key_matches(&self.fourth_sub_key, &key.fourth_sub_key)
    }

    pub fn encode(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.encode_nullable_identifier(self.first_sub_key.as_ref());
        encoder.encode_nullable_long(self.second_sub_key);
        encoder.encode_nullable_long(self.third_sub_key);
        encoder.encode_nullable_long(self.fourth_sub_key);
        Ok(())
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            first_sub_key: decoder.decode_nullable_identifier()?,
            second_sub_key: decoder.decode_nullable_long()?,
            third_sub_key: decoder.decode_nullable_long()?,
            fourth_sub_key: decoder.decode_nullable_long()?,
        })
    }
}

fn first_sub_key_matches(pattern: &Option<Identifier>, key: &Option<Identifier>) -> bool {
    match (pattern, key) {
        (Some(pattern), _) if pattern.as_str() == "*" => true,
        (Some(pattern), Some(key)) => pattern == key,
        (None, None) => true,
        _ => false,
    }
}

fn numeric_sub_key_matches(pattern: &Option<i64>, key: &Option<i64>) -> bool {
    match (pattern, key) {
        (Some(0), _) => true,
        (Some(pattern), Some(key)) => pattern == key,
        (None, None) => true,
        _ => false,
    }
}

pub type EntityKeyList = Vec<EntityKey>;

/// One subscription filter: an optional sub-domain tail appended to the
/// subscription domain, area/service/operation wildcard flags and the
/// entity key patterns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityRequest {
    pub sub_domain: Option<IdentifierList>,
    pub all_areas: bool,
    pub all_services: bool,
    pub all_operations: bool,
    pub only_on_change: bool,
    pub entity_keys: EntityKeyList,
}

impl EntityRequest {
    pub fn encode(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        match &self.sub_domain {
            Some(sub_domain) => {
                encoder.encode_not_null();
                encode_identifier_list(sub_domain, encoder)?;
            }
            None => encoder.encode_null(),
        }
        encoder.encode_boolean(self.all_areas);
        encoder.encode_boolean(self.all_services);
        encoder.encode_boolean(self.all_operations);
        encoder.encode_boolean(self.only_on_change);
        encode_entity_key_list(&self.entity_keys, encoder)
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let sub_domain = if decoder.decode_is_null()? {
            None
        } else {
            Some(decode_identifier_list(decoder)?)
        };
        Ok(Self {
            sub_domain,
            all_areas: decoder.decode_boolean()?,
            all_services: decoder.decode_boolean()?,
            all_operations: decoder.decode_boolean()?,
            only_on_change: decoder.decode_boolean()?,
            entity_keys: decode_entity_key_list(decoder)?,
        })
    }
}

pub type EntityRequestList = Vec<EntityRequest>;

/// Subscriber registration payload of a PUB/SUB REGISTER.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subscription {
    pub subscription_id: Identifier,
    pub entities: EntityRequestList,
}

impl Subscription {
    pub fn encode(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.encode_identifier(&self.subscription_id);
        encode_entity_request_list(&self.entities, encoder)
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            subscription_id: decoder.decode_identifier()?,
            entities: decode_entity_request_list(decoder)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateType {
    #[default]
    Creation,
    Update,
    Modification,
    Deletion,
}

impl UpdateType {
    pub fn ordinal(self) -> u8 {
        match self {
            UpdateType::Creation => 0,
            UpdateType::Update => 1,
            UpdateType::Modification => 2,
            UpdateType::Deletion => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(UpdateType::Creation),
            1 => Some(UpdateType::Update),
            2 => Some(UpdateType::Modification),
            3 => Some(UpdateType::Deletion),
            _ => None,
        }
    }
}

/// Header of one published update; the value travels in a parallel list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateHeader {
    pub timestamp: Time,
    pub source_uri: Uri,
    pub update_type: UpdateType,
    pub key: EntityKey,
}

impl UpdateHeader {
    pub fn encode(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.encode_time(self.timestamp);
        encoder.encode_uri(&self.source_uri);
        encoder.encode_uoctet(self.update_type.ordinal());
        self.key.encode(encoder)
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let timestamp = decoder.decode_time()?;
        let source_uri = decoder.decode_uri()?;
        let ordinal = decoder.decode_uoctet()?;
        let update_type = UpdateType::from_ordinal(ordinal).ok_or(CodecError::UnknownOrdinal {
            what: "UpdateType",
            ordinal,
        })?;
        Ok(Self {
            timestamp,
            source_uri,
            update_type,
            key: EntityKey::decode(decoder)?,
        })
    }
}

pub type UpdateHeaderList = Vec<UpdateHeader>;

// List encodings: element count then one nullable element each. Decoding
// rejects NULL entries since the engine never produces them.

pub fn encode_identifier_list(
    list: &IdentifierList,
    encoder: &mut Encoder,
) -> Result<(), CodecError> {
    encoder.encode_uinteger(list.len() as u32);
    for identifier in list {
        encoder.encode_not_null();
        encoder.encode_identifier(identifier);
    }
    Ok(())
}

pub fn decode_identifier_list(decoder: &mut Decoder<'_>) -> Result<IdentifierList, CodecError> {
    let count = decoder.decode_uinteger()? as usize;
    let mut list = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if decoder.decode_is_null()? {
            return Err(CodecError::UnexpectedNull);
        }
        list.push(decoder.decode_identifier()?);
    }
    Ok(list)
}

pub fn encode_entity_key_list(
    list: &EntityKeyList,
    encoder: &mut Encoder,
) -> Result<(), CodecError> {
    encoder.encode_uinteger(list.len() as u32);
    for key in list {
        encoder.encode_not_null();
        key.encode(encoder)?;
    }
    Ok(())
}

pub fn decode_entity_key_list(decoder: &mut Decoder<'_>) -> Result<EntityKeyList, CodecError> {
    let count = decoder.decode_uinteger()? as usize;
    let mut list = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if decoder.decode_is_null()? {
            return Err(CodecError::UnexpectedNull);
        }
        list.push(EntityKey::decode(decoder)?);
    }
    Ok(list)
}

pub fn encode_entity_request_list(
    list: &EntityRequestList,
    encoder: &mut Encoder,
) -> Result<(), CodecError> {
    encoder.encode_uinteger(list.len() as u32);
    for request in list {
        encoder.encode_not_null();
        request.encode(encoder)?;
    }
    Ok(())
}

pub fn decode_entity_request_list(
    decoder: &mut Decoder<'_>,
) -> Result<EntityRequestList, CodecError> {
    let count = decoder.decode_uinteger()? as usize;
    let mut list = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if decoder.decode_is_null()? {
            return Err(CodecError::UnexpectedNull);
        }
        list.push(EntityRequest::decode(decoder)?);
    }
    Ok(list)
}

pub fn encode_update_header_list(
    list: &UpdateHeaderList,
    encoder: &mut Encoder,
) -> Result<(), CodecError> {
    encoder.encode_uinteger(list.len() as u32);
    for header in list {
        encoder.encode_not_null();
        header.encode(encoder)?;
    }
    Ok(())
}

pub fn decode_update_header_list(
    decoder: &mut Decoder<'_>,
) -> Result<UpdateHeaderList, CodecError> {
    let count = decoder.decode_uinteger()? as usize;
    let mut list = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if decoder.decode_is_null()? {
            return Err(CodecError::UnexpectedNull);
        }
        list.push(UpdateHeader::decode(decoder)?);
    }
    Ok(list)
}

pub fn encode_blob_list(list: &crate::types::BlobList, encoder: &mut Encoder) -> Result<(), CodecError> {
    encoder.encode_uinteger(list.len() as u32);
    for blob in list {
        encoder.encode_not_null();
        encoder.encode_blob(blob);
    }
    Ok(())
}

pub fn decode_blob_list(decoder: &mut Decoder<'_>) -> Result<crate::types::BlobList, CodecError> {
    let count = decoder.decode_uinteger()? as usize;
    let mut list = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if decoder.decode_is_null()? {
            return Err(CodecError::UnexpectedNull);
        }
        list.push(decoder.decode_blob()?);
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::identifier_list;

    fn key(first: &str, second: i64, third: i64, fourth: i64) -> EntityKey {
        EntityKey::new(
            Some(Identifier::from(first)),
            Some(second),
            Some(third),
            Some(fourth),
        )
    }

    #[test]
    fn wildcard_pattern_matches_every_key() {
        let pattern = key("*", 0, 0, 0);
        assert!(pattern.matches(&key("key1", 1, 1, 1)));
        assert!(pattern.matches(&key("", 42, -7, 9)));
        assert!(pattern.matches(&EntityKey::default()));
    }

    #[test]
    fn specific_pattern_requires_equality() {
        let pattern = key("key1", 0, 0, 0);
        assert!(pattern.matches(&key("key1", 5, 6, 7)));
        assert!(!pattern.matches(&key("key2", 5, 6, 7)));
    }

    #[test]
    fn null_matches_only_null() {
        let pattern = EntityKey::new(None, Some(0), Some(0), Some(0));
        assert!(pattern.matches(&EntityKey::new(None, Some(1), None, Some(2))));
        assert!(!pattern.matches(&key("x", 1, 1, 1)));

        // NULL on the key side does not satisfy a specific pattern.
        let specific = key("x", 3, 0, 0);
        assert!(!specific.matches(&EntityKey::new(Some(Identifier::from("x")), None, Some(0), Some(0))));
    }

    #[test]
    fn subscription_round_trip() {
        let subscription = Subscription {
            subscription_id: Identifier::from("MySubscription"),
            entities: vec![EntityRequest {
                sub_domain: Some(identifier_list(&["camera", "*"])),
                all_areas: true,
                all_services: true,
                all_operations: true,
                only_on_change: false,
                entity_keys: vec![key("key1", 0, 0, 0), EntityKey::default()],
            }],
        };

        let mut encoder = Encoder::new();
        subscription.encode(&mut encoder).unwrap();
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes);
        let decoded = Subscription::decode(&mut decoder).unwrap();
        assert_eq!(decoded, subscription);
        assert!(decoder.remaining().is_empty());
    }

    #[test]
    fn update_header_round_trip() {
        let header = UpdateHeader {
            timestamp: Time(1_600_000_000_000),
            source_uri: Uri::from("maltcp://127.0.0.1:16002/publisher"),
            update_type: UpdateType::Update,
            key: key("key2", 2, 3, 4),
        };

        let mut encoder = Encoder::new();
        header.encode(&mut encoder).unwrap();
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(UpdateHeader::decode(&mut decoder).unwrap(), header);
    }
}
