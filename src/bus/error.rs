//! Error taxonomy of the call API
//!
//! Every call either resolves with a result or fails with one of these. Raw
//! transport failures never reach callers; the correlator classifies them first.

use crate::address::AddressError;
use crate::bus::codec::CodecError;
use crate::bus::marshal::RemoteError;

/// Errors returned by calls on the bus
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    /// No handler for `kind` in the registry the message reached. Recoverable.
    #[error("No handler registered for '{kind}'")]
    HandlerNotFound { kind: String },

    /// Nothing accepted the connection; the target context is not up yet. Recoverable.
    #[error("BusMsg({kind}) context not ready: {diagnostic}")]
    ContextNotReady { kind: String, diagnostic: String },

    /// The payload cannot cross the context boundary. Fix the call site.
    #[error("BusMsg({kind}) could not serialize message: {diagnostic}")]
    Serialization { kind: String, diagnostic: String },

    /// The remote handler failed; reconstructed from its marshalled error
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The context could not learn its own address from the broker
    #[error("Own address unavailable after {attempts} attempt(s){}", last.as_ref().map(|l| format!(": {}", l)).unwrap_or_default())]
    AddressUnavailable { attempts: u32, last: Option<String> },

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    /// Any other delivery failure
    #[error("BusMsg({kind}) delivery failed: {diagnostic}")]
    Transport { kind: String, diagnostic: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Typed request or response did not match its `Message` definition
    #[error("Payload error: {0}")]
    Payload(String),
}

impl BusError {
    /// True for failures a caller may retry, possibly at another address.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::HandlerNotFound { .. } | BusError::ContextNotReady { .. })
    }

    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            BusError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}
