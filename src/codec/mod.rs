//! Varint binary encoding of MAL attributes with explicit null markers.
//!
//! This is the trailer/body encoding of MAL/TCP: unsigned scalars as
//! LEB128 varints, signed scalars zigzag-encoded, strings and blobs
//! length-prefixed. A nullable element is a one-byte marker (0 = NULL)
//! followed by the element when present. The fixed message header is
//! written separately by the transport frame codec.

use bytes::Bytes;
use thiserror::Error;

use crate::types::{Blob, Identifier, Time, Uri};

pub mod registry;

pub use registry::{ElementRegistry, ElementRegistryBuilder, MalElement};

const NULL: u8 = 0;
const NOT_NULL: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated")]
    Truncated,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("invalid utf-8 in string attribute")]
    Utf8,
    #[error("unknown {what} ordinal {ordinal}")]
    UnknownOrdinal { what: &'static str, ordinal: u8 },
    #[error("null element where a value is required")]
    UnexpectedNull,
    #[error("invalid null marker {marker}")]
    BadNullMarker { marker: u8 },
    #[error("unknown element short form {0:#x}")]
    UnknownShortForm(u64),
}

pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn encode_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn encode_boolean(&mut self, value: bool) {
        self.buf.push(if value { NOT_NULL } else { NULL });
    }

    pub fn encode_uoctet(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn encode_ushort(&mut self, value: u16) {
        self.encode_varint(u64::from(value));
    }

    pub fn encode_uinteger(&mut self, value: u32) {
        self.encode_varint(u64::from(value));
    }

    pub fn encode_ulong(&mut self, value: u64) {
        self.encode_varint(value);
    }

    pub fn encode_long(&mut self, value: i64) {
        self.encode_varint(zigzag(value));
    }

    pub fn encode_time(&mut self, value: Time) {
        self.encode_varint(value.0);
    }

    pub fn encode_string(&mut self, value: &str) {
        self.encode_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn encode_identifier(&mut self, value: &Identifier) {
        self.encode_string(value.as_str());
    }

    pub fn encode_uri(&mut self, value: &Uri) {
        self.encode_string(value.as_str());
    }

    pub fn encode_blob(&mut self, value: &Blob) {
        self.encode_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_slice());
    }

    pub fn encode_null(&mut self) {
        self.buf.push(NULL);
    }

    pub fn encode_not_null(&mut self) {
        self.buf.push(NOT_NULL);
    }

    pub fn encode_nullable_identifier(&mut self, value: Option<&Identifier>) {
        match value {
            Some(value) => {
                self.encode_not_null();
                self.encode_identifier(value);
            }
            None => self.encode_null(),
        }
    }

    pub fn encode_nullable_long(&mut self, value: Option<i64>) {
        match value {
            Some(value) => {
                self.encode_not_null();
                self.encode_long(value);
            }
            None => self.encode_null(),
        }
    }

    pub fn encode_nullable_uri(&mut self, value: Option<&Uri>) {
        match value {
            Some(value) => {
                self.encode_not_null();
                self.encode_uri(value);
            }
            None => self.encode_null(),
        }
    }

    pub fn encode_nullable_blob(&mut self, value: Option<&Blob>) {
        match value {
            Some(value) => {
                self.encode_not_null();
                self.encode_blob(value);
            }
            None => self.encode_null(),
        }
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Hands the undecoded tail over as the opaque message body.
    pub fn take_remaining(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(&self.buf[self.pos..]);
        self.pos = self.buf.len();
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < len {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn decode_varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    pub fn decode_boolean(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            NULL => Ok(false),
            NOT_NULL => Ok(true),
            marker => Err(CodecError::BadNullMarker { marker }),
        }
    }

    pub fn decode_uoctet(&mut self) -> Result<u8, CodecError> {
        self.read_u8()
    }

    pub fn decode_ushort(&mut self) -> Result<u16, CodecError> {
        Ok(self.decode_varint()? as u16)
    }

    pub fn decode_uinteger(&mut self) -> Result<u32, CodecError> {
        Ok(self.decode_varint()? as u32)
    }

    pub fn decode_ulong(&mut self) -> Result<u64, CodecError> {
        self.decode_varint()
    }

    pub fn decode_long(&mut self) -> Result<i64, CodecError> {
        Ok(unzigzag(self.decode_varint()?))
    }

    pub fn decode_time(&mut self) -> Result<Time, CodecError> {
        Ok(Time(self.decode_varint()?))
    }

    pub fn decode_string(&mut self) -> Result<String, CodecError> {
        let len = self.decode_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8)
    }

    pub fn decode_identifier(&mut self) -> Result<Identifier, CodecError> {
        Ok(Identifier(self.decode_string()?))
    }

    pub fn decode_uri(&mut self) -> Result<Uri, CodecError> {
        Ok(Uri(self.decode_string()?))
    }

    pub fn decode_blob(&mut self) -> Result<Blob, CodecError> {
        let len = self.decode_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(Blob::new(bytes.to_vec()))
    }

    /// Reads a null marker; `true` means the element is NULL.
    pub fn decode_is_null(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            NULL => Ok(true),
            NOT_NULL => Ok(false),
            marker => Err(CodecError::BadNullMarker { marker }),
        }
    }

    pub fn decode_nullable_identifier(&mut self) -> Result<Option<Identifier>, CodecError> {
        if self.decode_is_null()? {
            Ok(None)
        } else {
            Ok(Some(self.decode_identifier()?))
        }
    }

    pub fn decode_nullable_long(&mut self) -> Result<Option<i64>, CodecError> {
        if self.decode_is_null()? {
            Ok(None)
        } else {
            Ok(Some(self.decode_long()?))
        }
    }

    pub fn decode_nullable_uri(&mut self) -> Result<Option<Uri>, CodecError> {
        if self.decode_is_null()? {
            Ok(None)
        } else {
            Ok(Some(self.decode_uri()?))
        }
    }

    pub fn decode_nullable_blob(&mut self) -> Result<Option<Blob>, CodecError> {
        if self.decode_is_null()? {
            Ok(None)
        } else {
            Ok(Some(self.decode_blob()?))
        }
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut encoder = Encoder::new();
            encoder.encode_varint(value);
            let bytes = encoder.into_vec();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.decode_varint().unwrap(), value);
            assert!(decoder.remaining().is_empty());
        }
    }

    #[test]
    fn varint_rejects_overflow() {
        // 11 continuation bytes encode more than 64 bits.
        let bytes = [0xFFu8; 11];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_varint(), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn long_zigzag_round_trip() {
        for value in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            let mut encoder = Encoder::new();
            encoder.encode_long(value);
            let bytes = encoder.into_vec();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.decode_long().unwrap(), value);
        }
    }

    #[test]
    fn string_and_blob_round_trip() {
        let mut encoder = Encoder::new();
        encoder.encode_string("maltcp://host:1/svc");
        encoder.encode_blob(&Blob::new(vec![0xDE, 0xAD]));
        encoder.encode_nullable_identifier(None);
        let bytes = encoder.into_vec();

        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_string().unwrap(), "maltcp://host:1/svc");
        assert_eq!(decoder.decode_blob().unwrap(), Blob::new(vec![0xDE, 0xAD]));
        assert_eq!(decoder.decode_nullable_identifier().unwrap(), None);
    }

    #[test]
    fn truncated_string_fails() {
        let mut encoder = Encoder::new();
        encoder.encode_string("hello");
        let mut bytes = encoder.into_vec();
        bytes.truncate(3);
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_string(), Err(CodecError::Truncated));
    }

    #[test]
    fn bad_null_marker_is_rejected() {
        let bytes = [7u8];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            decoder.decode_is_null(),
            Err(CodecError::BadNullMarker { marker: 7 })
        );
    }
}
