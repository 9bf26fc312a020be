//! Transport seam
//!
//! The bus runs over any host platform that can move envelopes between
//! contexts. A [`Transport`] is one context's end of that platform; a
//! [`Listener`] is what the runtime installs to receive envelopes.
//!
//! Delivery semantics the bus relies on:
//!
//! - Every delivery is a structured clone. Values the host cannot clone fail
//!   the send; they never arrive altered.
//! - A listener decides synchronously whether it will answer
//!   ([`Disposition`]). The first answer from any recipient wins.
//! - If no recipient answers, the delivery resolves with no response as soon
//!   as the last pending answer is settled. Absorbing recipients are not waited on.
//! - If nothing is listening at all, the delivery fails with
//!   [`TransportFailure::NoReceiver`].

use crate::address::FrameAddress;
use crate::bus::codec::BlobStore;
use crate::bus::envelope::{Envelope, RawResponse};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Who sent an envelope, as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderInfo {
    Background,
    Context {
        /// `None` for a context outside any top-level unit
        frame: Option<FrameAddress>,
        url: String,
        /// URL of the top-level unit the sender lives in
        top_url: Option<String>,
    },
}

impl SenderInfo {
    pub fn frame(&self) -> Option<FrameAddress> {
        match self {
            SenderInfo::Context { frame, .. } => *frame,
            SenderInfo::Background => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            SenderInfo::Context { url, .. } => Some(url),
            SenderInfo::Background => None,
        }
    }

    pub fn top_url(&self) -> Option<&str> {
        match self {
            SenderInfo::Context { top_url, .. } => top_url.as_deref(),
            SenderInfo::Background => None,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, SenderInfo::Background)
    }
}

/// Raw failure reported by the host. Converted to `BusError` by the correlator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    #[error("The message port closed before a response was received.")]
    PortClosed,

    #[error("The object could not be cloned: {0}")]
    NotCloneable(String),

    #[error("Message length exceeded maximum allowed length ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("{0}")]
    Other(String),
}

/// A listener's answer to one delivered envelope.
pub enum Disposition {
    /// Will answer with the future's response
    Respond(BoxFuture<'static, RawResponse>),
    /// May answer on behalf of another context; `None` withdraws without an answer
    Forward(BoxFuture<'static, Option<RawResponse>>),
    /// Recognized, but another delivery of the same envelope answers it
    Absorb,
    /// Has no opinion on this envelope
    Decline,
}

impl std::fmt::Debug for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Respond(_) => write!(f, "Respond"),
            Disposition::Forward(_) => write!(f, "Forward"),
            Disposition::Absorb => write!(f, "Absorb"),
            Disposition::Decline => write!(f, "Decline"),
        }
    }
}

/// Receives envelopes delivered to one context.
pub trait Listener: Send + Sync {
    fn on_message(&self, envelope: Envelope, sender: SenderInfo) -> Disposition;
}

/// Outcome of one send: the winning response, or none if every recipient declined.
pub type Delivery = BoxFuture<'static, Result<Option<RawResponse>, TransportFailure>>;

/// Which non-background contexts a directed send reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTarget {
    /// One frame
    Frame(FrameAddress),
    /// Every frame of a top-level unit
    Unit(u64),
}

/// One context's end of the host platform.
pub trait Transport: Send + Sync {
    /// How this context appears to recipients of its messages.
    fn sender_info(&self) -> SenderInfo;

    /// Store used for binary handles. Shared by every context of the host.
    fn blobs(&self) -> Arc<dyn BlobStore>;

    /// Send to the background broker.
    fn send_to_broker(&self, envelope: Envelope) -> Delivery;

    /// Send to specific non-background contexts. Only the background may do this.
    fn send_to_context(&self, target: ContextTarget, envelope: Envelope) -> Delivery;

    /// Send to every non-background context. Only the background may do this.
    fn fan_out(&self, envelope: Envelope) -> Delivery;

    /// Install the listener for envelopes delivered to this context, replacing any previous one.
    fn listen(&self, listener: Arc<dyn Listener>);
}
