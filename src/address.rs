//! Context addressing
//!
//! Every context on the bus is reachable through an [`Address`]:
//!
//! - [`Address::Background`]: the privileged broker context. On the wire this is `null`.
//! - [`Address::Frame`]: a `(major, minor)` pair. `major` names a top-level unit (a tab),
//!   `minor` a frame inside it; minor `0` is reserved for the top-level unit itself.
//!   On the wire this is the string `"<major>:<minor>"`.
//! - [`Address::Broadcast`]: the reserved literal `"broadcast"`.
//!
//! `parse(format(a)) == a` for every address.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Wire literal for the broadcast destination.
pub const BROADCAST: &str = "broadcast";

/// Minor id reserved for the top-level unit itself.
pub const TOP_LEVEL_MINOR: u64 = 0;

/// Errors that can occur when parsing an address string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Error code 1: empty address string
    #[error("Address cannot be empty")]
    Empty,
    /// Error code 2: not in `<major>:<minor>` form
    #[error("Address must be '<major>:<minor>' or 'broadcast', got '{0}'")]
    InvalidFormat(String),
    /// Error code 3: a component is not an unsigned integer
    #[error("Address component '{component}' in '{address}' is not an unsigned integer")]
    InvalidComponent { address: String, component: String },
}

/// A `(major, minor)` pair naming one non-background context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameAddress {
    pub major: u64,
    pub minor: u64,
}

impl FrameAddress {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Address of the top-level unit this frame lives in.
    pub fn top_level(&self) -> FrameAddress {
        FrameAddress::new(self.major, TOP_LEVEL_MINOR)
    }

    pub fn is_top_level(&self) -> bool {
        self.minor == TOP_LEVEL_MINOR
    }

    /// Parse a `"<major>:<minor>"` string.
    pub fn from_string(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| AddressError::InvalidFormat(s.to_string()))?;
        if minor.contains(':') {
            return Err(AddressError::InvalidFormat(s.to_string()));
        }
        Ok(Self {
            major: parse_component(s, major)?,
            minor: parse_component(s, minor)?,
        })
    }
}

fn parse_component(address: &str, component: &str) -> Result<u64, AddressError> {
    // u64::from_str accepts a leading '+', which would break round-tripping
    if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidComponent {
            address: address.to_string(),
            component: component.to_string(),
        });
    }
    component.parse().map_err(|_| AddressError::InvalidComponent {
        address: address.to_string(),
        component: component.to_string(),
    })
}

impl fmt::Display for FrameAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for FrameAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FrameAddress::from_string(s)
    }
}

/// Destination or origin of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// The privileged broker context
    Background,
    /// A specific non-background context
    Frame(FrameAddress),
    /// Every listening context
    Broadcast,
}

impl Address {
    pub fn frame(major: u64, minor: u64) -> Self {
        Address::Frame(FrameAddress::new(major, minor))
    }

    /// Parse the wire form: `None` is the background, anything else must be
    /// `"broadcast"` or `"<major>:<minor>"`.
    pub fn from_wire(to: Option<&str>) -> Result<Self, AddressError> {
        match to {
            None => Ok(Address::Background),
            Some(s) => s.parse(),
        }
    }

    /// Wire form of this address (`None` for the background).
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Address::Background => None,
            other => Some(other.to_string()),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Broadcast)
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Address::Background)
    }

    pub fn as_frame(&self) -> Option<FrameAddress> {
        match self {
            Address::Frame(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Background => write!(f, "background"),
            Address::Frame(frame) => write!(f, "{}", frame),
            Address::Broadcast => write!(f, "{}", BROADCAST),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parses a non-null wire address. The background has no string form and
    /// is only produced by [`Address::from_wire`] with `None`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BROADCAST {
            return Ok(Address::Broadcast);
        }
        FrameAddress::from_string(s).map(Address::Frame)
    }
}

impl From<FrameAddress> for Address {
    fn from(frame: FrameAddress) -> Self {
        Address::Frame(frame)
    }
}

// Serde support: the wire form, `null` for the background
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.to_wire() {
            Some(s) => serializer.serialize_some(&s),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = Option::<String>::deserialize(deserializer)?;
        Address::from_wire(wire.as_deref()).map_err(serde::de::Error::custom)
    }
}
