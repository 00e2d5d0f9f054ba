//! Polymorphic element registry: absolute short form to decoder table.
//!
//! Built explicitly at context startup instead of through process-wide
//! registration side effects. The short form packs
//! `area(16) | service(16) | version(8) | type(24)`; list types carry the
//! negated type code in 24-bit two's complement.

use std::collections::HashMap;

use crate::codec::{CodecError, Decoder};
use crate::types::composites::{
    decode_blob_list, decode_entity_key_list, decode_entity_request_list, decode_identifier_list,
    decode_update_header_list,
};
use crate::types::{
    Blob, BlobList, EntityKey, EntityKeyList, EntityRequest, EntityRequestList, Identifier,
    IdentifierList, Subscription, UpdateHeader, UpdateHeaderList,
};

const MAL_AREA_VERSION_BASE: u64 = 0x1000001000000;

pub const fn short_form(type_code: u32) -> u64 {
    MAL_AREA_VERSION_BASE | (type_code as u64 & 0xFFFFFF)
}

pub const fn list_short_form(type_code: u32) -> u64 {
    MAL_AREA_VERSION_BASE | ((type_code as u64).wrapping_neg() & 0xFFFFFF)
}

pub const BLOB_SHORT_FORM: u64 = short_form(1);
pub const IDENTIFIER_SHORT_FORM: u64 = short_form(6);
pub const SUBSCRIPTION_SHORT_FORM: u64 = short_form(23);
pub const ENTITY_REQUEST_SHORT_FORM: u64 = short_form(24);
pub const ENTITY_KEY_SHORT_FORM: u64 = short_form(25);
pub const UPDATE_HEADER_SHORT_FORM: u64 = short_form(26);
pub const BLOB_LIST_SHORT_FORM: u64 = list_short_form(1);
pub const IDENTIFIER_LIST_SHORT_FORM: u64 = list_short_form(6);
pub const ENTITY_REQUEST_LIST_SHORT_FORM: u64 = list_short_form(24);
pub const ENTITY_KEY_LIST_SHORT_FORM: u64 = list_short_form(25);
pub const UPDATE_HEADER_LIST_SHORT_FORM: u64 = list_short_form(26);

/// A decoded polymorphic element.
#[derive(Clone, Debug, PartialEq)]
pub enum MalElement {
    Blob(Blob),
    Identifier(Identifier),
    Subscription(Subscription),
    EntityRequest(EntityRequest),
    EntityKey(EntityKey),
    UpdateHeader(UpdateHeader),
    BlobList(BlobList),
    IdentifierList(IdentifierList),
    EntityRequestList(EntityRequestList),
    EntityKeyList(EntityKeyList),
    UpdateHeaderList(UpdateHeaderList),
}

type ElementDecoder = Box<dyn Fn(&mut Decoder<'_>) -> Result<MalElement, CodecError> + Send + Sync>;

#[derive(Default)]
pub struct ElementRegistryBuilder {
    decoders: HashMap<u64, ElementDecoder>,
}

impl ElementRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder for a short form; re-registration replaces.
    pub fn register<F>(mut self, short_form: u64, decoder: F) -> Self
    where
        F: Fn(&mut Decoder<'_>) -> Result<MalElement, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(short_form, Box::new(decoder));
        self
    }

    /// Seeds the MAL area elements used by the PUB/SUB machinery.
    pub fn with_mal_elements(self) -> Self {
        self.register(BLOB_SHORT_FORM, |d| Ok(MalElement::Blob(d.decode_blob()?)))
            .register(IDENTIFIER_SHORT_FORM, |d| {
                Ok(MalElement::Identifier(d.decode_identifier()?))
            })
            .register(SUBSCRIPTION_SHORT_FORM, |d| {
                Ok(MalElement::Subscription(Subscription::decode(d)?))
            })
            .register(ENTITY_REQUEST_SHORT_FORM, |d| {
                Ok(MalElement::EntityRequest(EntityRequest::decode(d)?))
            })
            .register(ENTITY_KEY_SHORT_FORM, |d| {
                Ok(MalElement::EntityKey(EntityKey::decode(d)?))
            })
            .register(UPDATE_HEADER_SHORT_FORM, |d| {
                Ok(MalElement::UpdateHeader(UpdateHeader::decode(d)?))
            })
            .register(BLOB_LIST_SHORT_FORM, |d| {
                Ok(MalElement::BlobList(decode_blob_list(d)?))
            })
            .register(IDENTIFIER_LIST_SHORT_FORM, |d| {
                Ok(MalElement::IdentifierList(decode_identifier_list(d)?))
            })
            .register(ENTITY_REQUEST_LIST_SHORT_FORM, |d| {
                Ok(MalElement::EntityRequestList(decode_entity_request_list(d)?))
            })
            .register(ENTITY_KEY_LIST_SHORT_FORM, |d| {
                Ok(MalElement::EntityKeyList(decode_entity_key_list(d)?))
            })
            .register(UPDATE_HEADER_LIST_SHORT_FORM, |d| {
                Ok(MalElement::UpdateHeaderList(decode_update_header_list(d)?))
            })
    }

    pub fn build(self) -> ElementRegistry {
        ElementRegistry {
            decoders: self.decoders,
        }
    }
}

pub struct ElementRegistry {
    decoders: HashMap<u64, ElementDecoder>,
}

impl ElementRegistry {
    pub fn with_mal_elements() -> Self {
        ElementRegistryBuilder::new().with_mal_elements().build()
    }

    pub fn contains(&self, short_form: u64) -> bool {
        self.decoders.contains_key(&short_form)
    }

    pub fn decode(
        &self,
        short_form: u64,
        decoder: &mut Decoder<'_>,
    ) -> Result<MalElement, CodecError> {
        let decode = self
            .decoders
            .get(&short_form)
            .ok_or(CodecError::UnknownShortForm(short_form))?;
        decode(decoder)
    }

    /// Decodes an element prefixed by its own short form.
    pub fn decode_abstract(&self, decoder: &mut Decoder<'_>) -> Result<MalElement, CodecError> {
        let short_form = decoder.decode_ulong()?;
        self.decode(short_form, decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    #[test]
    fn entity_key_short_form_value() {
        // Area 1 (MAL), version 1, type 25.
        assert_eq!(ENTITY_KEY_SHORT_FORM, 0x1000001000019);
    }

    #[test]
    fn decode_abstract_entity_key() {
        let key = EntityKey::new(Some(Identifier::from("key1")), Some(1), Some(2), Some(3));
        let mut encoder = Encoder::new();
        encoder.encode_ulong(ENTITY_KEY_SHORT_FORM);
        key.encode(&mut encoder).unwrap();
        let bytes = encoder.into_vec();

        let registry = ElementRegistry::with_mal_elements();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            registry.decode_abstract(&mut decoder).unwrap(),
            MalElement::EntityKey(key)
        );
    }

    #[test]
    fn unknown_short_form_is_rejected() {
        let registry = ElementRegistry::with_mal_elements();
        let bytes = Vec::new();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            registry.decode(0xDEAD, &mut decoder),
            Err(CodecError::UnknownShortForm(0xDEAD))
        );
    }
}
