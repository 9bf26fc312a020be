//! ctxbus - Message bus between isolated execution contexts
//!
//! A background context brokers request/response calls between many frame
//! contexts that cannot reach each other directly. Callers address a frame,
//! the background, or every context at once; binary payloads travel as
//! handles; handler failures come back as typed errors carrying both the
//! caller's and the responder's stack.

pub mod address;
pub mod bus;
pub mod config;

pub use address::{Address, AddressError, FrameAddress, BROADCAST};
pub use bus::codec::{BlobStore, Buf, MemoryBlobStore};
pub use bus::error::BusError;
pub use bus::host::{HostFlavor, HostPort, MemoryHost};
pub use bus::kinds::{Kind, Message};
pub use bus::marshal::{HttpError, RemoteError};
pub use bus::router::{AlwaysRelay, ChromiumRelayPolicy, RelayPolicy};
pub use bus::runtime::{ContextRuntime, ErrorReport};
pub use bus::transport::{SenderInfo, Transport};
pub use config::{BusConfig, ConfigError, RelayMode};
