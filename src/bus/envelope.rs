//! Wire types for the message bus
//!
//! The envelope is the unit placed on the transport. Its JSON shape is fixed so
//! that independently built contexts interoperate:
//!
//! ```text
//! {
//!   "name":  kind of the message (tstr)
//!   "data":  { "bm": payload (object), "objUrls": { field: handle } }
//!   "to":    destination address (tstr or null = background)
//!   "uid":   per-call unique id (tstr)
//!   "stack": call site of the original caller (tstr)
//! }
//! ```
//!
//! A response is `{ "result": any, "objUrls": { field: handle }, "exception"?: error }`.

use crate::address::{Address, AddressError};
use crate::bus::marshal::MarshalledError;
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;

/// Field name → binary handle, for payload fields externalized by the codec.
pub type HandleMap = BTreeMap<String, String>;

/// Per-call unique id. Random rather than a counter because every context
/// mints ids independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(String);

impl UniqueId {
    /// Create a new random id
    pub fn new() -> Self {
        UniqueId(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an id received from another context
    pub fn from_string(s: impl Into<String>) -> Self {
        UniqueId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::new()
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capture the caller's location as an origin stack.
///
/// `#[track_caller]` makes this report the first non-tracked frame, so public
/// call APIs that are themselves `#[track_caller]` record the application's call site.
#[track_caller]
pub fn capture_stack(with_backtrace: bool) -> String {
    let location = std::panic::Location::caller();
    let mut stack = format!("at {}:{}:{}", location.file(), location.line(), location.column());
    if with_backtrace {
        stack.push('\n');
        stack.push_str(&Backtrace::force_capture().to_string());
    }
    stack
}

/// Payload plus the handles of its externalized binary fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub bm: Value,
    #[serde(rename = "objUrls", default)]
    pub obj_urls: HandleMap,
}

/// The unit of one logical call on the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    pub name: String,
    pub data: EnvelopeData,
    /// Destination in wire form; kept raw so a malformed address is reported
    /// by whoever routes the message instead of failing deserialization
    #[serde(default)]
    pub to: Option<String>,
    /// Key for deduplication and response correlation
    pub uid: UniqueId,
    /// Call site of the original caller
    #[serde(default)]
    pub stack: String,
}

impl Envelope {
    pub fn new(name: &str, bm: Value, obj_urls: HandleMap, destination: &Address, stack: String) -> Self {
        Self {
            name: name.to_string(),
            data: EnvelopeData { bm, obj_urls },
            to: destination.to_wire(),
            uid: UniqueId::new(),
            stack,
        }
    }

    /// Parsed destination
    pub fn destination(&self) -> Result<Address, AddressError> {
        Address::from_wire(self.to.as_deref())
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.as_deref() == Some(crate::address::BROADCAST)
    }

    /// Human-readable destination for log lines
    pub fn to_display(&self) -> &str {
        self.to.as_deref().unwrap_or("background")
    }
}

/// Answer to an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default = "null_value")]
    pub result: Value,
    #[serde(rename = "objUrls", default)]
    pub obj_urls: HandleMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<MarshalledError>,
}

fn null_value() -> Value {
    Value::Null
}

impl RawResponse {
    pub fn ok(result: Value, obj_urls: HandleMap) -> Self {
        Self { result, obj_urls, exception: None }
    }

    pub fn err(exception: MarshalledError) -> Self {
        Self {
            result: Value::Null,
            obj_urls: HandleMap::new(),
            exception: Some(exception),
        }
    }

    pub fn is_err(&self) -> bool {
        self.exception.is_some()
    }
}
