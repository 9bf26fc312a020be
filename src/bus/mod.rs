//! Bus — request/response messaging between isolated contexts
//!
//! Layers, bottom up:
//! - **Wire** (`envelope`, `codec`, `marshal`): envelopes, binary handles, errors as records
//! - **Host seam** (`transport`, `host`): moving envelopes between contexts
//! - **Broker** (`router`): the background's relay decision per envelope
//! - **Context** (`runtime`): registry + pending calls + dedup + identity for one context
//!
//! ```text
//!   frame 5:1 ──▶ background (router) ──relay──▶ frame 5:2
//!       ▲                                           │
//!       └────────────── response ◀──────────────────┘
//! ```

pub mod codec;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod host;
pub mod identity;
pub mod kinds;
pub mod marshal;
pub mod pending;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod transport;
