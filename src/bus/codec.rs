//! Envelope Codec — transport-safe payloads
//!
//! Hosts cap message sizes and cannot reliably clone raw binary into every
//! context, so binary never travels in-band. Before sending, every top-level
//! payload field holding a binary value is replaced with `null` and a
//! short-lived handle is minted for it in a [`BlobStore`]. The receiver resolves
//! each handle exactly once and puts the bytes back.
//!
//! ```text
//! { "data": <bytes>, "n": 1 }   ──encode──▶   bm      = { "data": null, "n": 1 }
//!                                             objUrls = { "data": "blob:ctxbus/…" }
//! ```
//!
//! Only the top level is scanned. Binary nested deeper stays in place and is
//! rejected by the transport as uncloneable.
//!
//! Handles whose receiver fails before decoding are never consumed and stay in
//! the store until it is dropped.

use crate::address::Address;
use crate::bus::envelope::{Envelope, HandleMap, RawResponse};
use ciborium::Value;
use parking_lot::Mutex;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Prefix of every handle minted by [`MemoryBlobStore`].
pub const BLOB_HANDLE_PREFIX: &str = "blob:ctxbus/";

/// Errors that can occur encoding or decoding payloads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown or already consumed binary handle '{handle}' for field '{field}'")]
    UnknownHandle { field: String, handle: String },

    #[error("Binary handles present for fields {fields:?} but payload is not an object")]
    NotAnObject { fields: Vec<String> },
}

/// Store of dereferenceable, consume-once binary handles.
///
/// Shared by all contexts of one host, the way object URLs are visible to
/// every page of an extension.
pub trait BlobStore: Send + Sync {
    /// Take ownership of `bytes` and return a handle for them.
    fn mint(&self, bytes: Vec<u8>) -> String;

    /// Resolve a handle, invalidating it. `None` if unknown or already consumed.
    fn consume(&self, handle: &str) -> Option<Vec<u8>>;
}

/// In-memory [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of minted handles not yet consumed.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn mint(&self, bytes: Vec<u8>) -> String {
        let handle = format!("{}{}", BLOB_HANDLE_PREFIX, uuid::Uuid::new_v4());
        self.blobs.lock().insert(handle.clone(), bytes);
        handle
    }

    fn consume(&self, handle: &str) -> Option<Vec<u8>> {
        self.blobs.lock().remove(handle)
    }
}

/// Binary buffer that serializes as a native binary value.
///
/// Use it for binary fields of typed requests and responses so the codec
/// externalizes them (a plain `Vec<u8>` serializes as an array of integers).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Buf(pub Vec<u8>);

impl Buf {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Buf {
    fn from(bytes: Vec<u8>) -> Self {
        Buf(bytes)
    }
}

impl From<&[u8]> for Buf {
    fn from(bytes: &[u8]) -> Self {
        Buf(bytes.to_vec())
    }
}

impl Serialize for Buf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Buf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BufVisitor;

        impl<'de> Visitor<'de> for BufVisitor {
            type Value = Buf;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Buf, E> {
                Ok(Buf(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Buf, E> {
                Ok(Buf(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Buf, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(Buf(bytes))
            }
        }

        deserializer.deserialize_byte_buf(BufVisitor)
    }
}

/// Replace every top-level binary field of `payload` with `null` and return
/// the minted handles by field name. Non-object payloads are left untouched.
pub fn externalize(payload: &mut Value, blobs: &dyn BlobStore) -> HandleMap {
    let mut handles = HandleMap::new();
    if let Value::Map(entries) = payload {
        for (key, value) in entries.iter_mut() {
            let Value::Text(field) = key else { continue };
            if matches!(value, Value::Bytes(_)) {
                if let Value::Bytes(bytes) = std::mem::replace(value, Value::Null) {
                    handles.insert(field.clone(), blobs.mint(bytes));
                }
            }
        }
    }
    handles
}

/// Resolve every handle in `handles` back into `payload`, consuming each once.
pub fn internalize(payload: &mut Value, handles: &HandleMap, blobs: &dyn BlobStore) -> Result<(), CodecError> {
    if handles.is_empty() {
        return Ok(());
    }
    let Value::Map(entries) = payload else {
        return Err(CodecError::NotAnObject {
            fields: handles.keys().cloned().collect(),
        });
    };
    for (field, handle) in handles {
        let bytes = blobs.consume(handle).ok_or_else(|| CodecError::UnknownHandle {
            field: field.clone(),
            handle: handle.clone(),
        })?;
        let slot = entries
            .iter_mut()
            .find(|(k, _)| matches!(k, Value::Text(t) if t == field));
        match slot {
            Some((_, value)) => *value = Value::Bytes(bytes),
            None => entries.push((Value::Text(field.clone()), Value::Bytes(bytes))),
        }
    }
    Ok(())
}

/// Build the envelope for one call, externalizing binary fields.
pub fn encode(kind: &str, mut payload: Value, destination: &Address, stack: String, blobs: &dyn BlobStore) -> Envelope {
    let handles = externalize(&mut payload, blobs);
    Envelope::new(kind, payload, handles, destination, stack)
}

/// Recover the payload of an envelope, resolving its binary handles.
pub fn decode(envelope: Envelope, blobs: &dyn BlobStore) -> Result<Value, CodecError> {
    let mut payload = envelope.data.bm;
    internalize(&mut payload, &envelope.data.obj_urls, blobs)?;
    Ok(payload)
}

/// Build a success response, externalizing binary fields of the result.
pub fn encode_response(mut result: Value, blobs: &dyn BlobStore) -> RawResponse {
    let handles = externalize(&mut result, blobs);
    RawResponse::ok(result, handles)
}

/// Recover the result of a success response.
pub fn decode_response(response: RawResponse, blobs: &dyn BlobStore) -> Result<Value, CodecError> {
    let mut result = response.result;
    internalize(&mut result, &response.obj_urls, blobs)?;
    Ok(result)
}

/// Path of the first binary value anywhere in `value`, if any.
///
/// The transport uses this to refuse values it cannot clone.
pub fn find_binary(value: &Value) -> Option<String> {
    fn walk(value: &Value, path: &mut Vec<String>) -> bool {
        match value {
            Value::Bytes(_) => true,
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(i.to_string());
                    if walk(item, path) {
                        return true;
                    }
                    path.pop();
                }
                false
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    path.push(match k {
                        Value::Text(t) => t.clone(),
                        other => format!("{:?}", other),
                    });
                    if walk(v, path) {
                        return true;
                    }
                    path.pop();
                }
                false
            }
            Value::Tag(_, inner) => walk(inner, path),
            _ => false,
        }
    }

    let mut path = Vec::new();
    if walk(value, &mut path) {
        Some(if path.is_empty() { "<root>".to_string() } else { path.join(".") })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (Value::Text(k.to_string()), v)).collect())
    }

    fn get<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
        match value {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Text(t) if t == field))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    // TEST030: Test binary fields are replaced by null and recorded as handles
    #[test]
    fn test_externalize_replaces_binary() {
        let store = MemoryBlobStore::new();
        let mut payload = map(vec![
            ("data", Value::Bytes(vec![1, 2, 3])),
            ("n", Value::Integer(1.into())),
        ]);
        let handles = externalize(&mut payload, &store);

        assert_eq!(handles.len(), 1);
        assert!(handles["data"].starts_with(BLOB_HANDLE_PREFIX));
        assert_eq!(get(&payload, "data"), Some(&Value::Null));
        assert_eq!(get(&payload, "n"), Some(&Value::Integer(1.into())));
        assert_eq!(store.len(), 1);
        assert!(find_binary(&payload).is_none());
    }

    // TEST031: Test payloads with zero, one and several binary fields survive encode → decode
    #[test]
    fn test_encode_decode_roundtrip() {
        let store = MemoryBlobStore::new();
        let payloads = vec![
            map(vec![]),
            map(vec![("v", Value::Integer(7.into()))]),
            map(vec![("key", Value::Bytes(vec![0xde, 0xad])), ("name", Value::Text("k".into()))]),
            map(vec![
                ("a", Value::Bytes(vec![])),
                ("b", Value::Bytes(vec![0xff; 4096])),
                ("c", Value::Array(vec![Value::Bool(true)])),
            ]),
            Value::Null,
            Value::Text("scalar".into()),
        ];
        for p in payloads {
            let env = encode("k", p.clone(), &Address::Background, String::new(), &store);
            let decoded = decode(env, &store).unwrap();
            assert_eq!(decoded, p);
        }
        assert!(store.is_empty(), "every handle must be consumed exactly once");
    }

    // TEST032: Test a handle cannot be consumed twice
    #[test]
    fn test_handle_consumed_once() {
        let store = MemoryBlobStore::new();
        let env = encode("k", map(vec![("data", Value::Bytes(vec![9]))]), &Address::Background, String::new(), &store);
        let copy = env.clone();
        decode(env, &store).unwrap();
        match decode(copy, &store) {
            Err(CodecError::UnknownHandle { field, .. }) => assert_eq!(field, "data"),
            other => panic!("expected UnknownHandle, got {:?}", other),
        }
    }

    // TEST033: Test nested binary is left in place and reported by find_binary
    #[test]
    fn test_nested_binary_not_externalized() {
        let store = MemoryBlobStore::new();
        let mut payload = map(vec![("outer", map(vec![("inner", Value::Bytes(vec![1]))]))]);
        let handles = externalize(&mut payload, &store);
        assert!(handles.is_empty());
        assert_eq!(find_binary(&payload).as_deref(), Some("outer.inner"));
    }

    // TEST034: Test Buf serializes to a native binary value and back
    #[test]
    fn test_buf_serde() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Req {
            #[serde(rename = "binaryKeysData")]
            binary_keys_data: Buf,
        }
        let req = Req { binary_keys_data: Buf(vec![1, 2, 3]) };
        let value = Value::serialized(&req).unwrap();
        assert_eq!(get(&value, "binaryKeysData"), Some(&Value::Bytes(vec![1, 2, 3])));
        let back: Req = value.deserialized().unwrap();
        assert_eq!(back, req);
    }

    // TEST035: Test responses externalize and restore binary results
    #[test]
    fn test_response_roundtrip() {
        let store = MemoryBlobStore::new();
        let result = map(vec![("chunk", Value::Bytes(b"attachment".to_vec()))]);
        let raw = encode_response(result.clone(), &store);
        assert!(raw.obj_urls.contains_key("chunk"));
        assert_eq!(decode_response(raw, &store).unwrap(), result);
    }

    // TEST036: Test handles against a non-object payload are rejected
    #[test]
    fn test_internalize_non_object() {
        let store = MemoryBlobStore::new();
        let mut handles = HandleMap::new();
        handles.insert("data".to_string(), store.mint(vec![1]));
        let mut payload = Value::Text("x".into());
        assert!(matches!(
            internalize(&mut payload, &handles, &store),
            Err(CodecError::NotAnObject { .. })
        ));
    }
}
