//! MemoryHost — in-process host platform
//!
//! Models the extension host the bus was built for, entirely in memory:
//!
//! ```text
//!                    ┌──────────────┐
//!                    │  background  │  (one slot, address = null)
//!                    └──────┬───────┘
//!          ┌────────────────┼────────────────┐
//!     unit 1 (1:0)     unit 2 (2:0)     page (no unit)
//!      ├─ 1:1           ├─ 2:1
//!      └─ 1:2           └─ 2:2
//! ```
//!
//! ## Flavors
//!
//! - `Chromium`: a message sent to the broker is also delivered directly to
//!   every open extension page except the sender. This is what makes skipping
//!   the relay correct, and what makes duplicate delivery possible.
//! - `Gecko`: messages to the broker reach the background only.
//!
//! Every delivery is a structured clone: a CBOR round trip that enforces the
//! size limit and refuses binary values nested below the payload's top level.
//! Every recipient that chose to answer runs to completion; the first answer
//! wins and the rest are discarded. Absorbing recipients are not waited on.

use crate::address::{FrameAddress, TOP_LEVEL_MINOR};
use crate::bus::codec::{find_binary, BlobStore, MemoryBlobStore};
use crate::bus::envelope::{Envelope, RawResponse};
use crate::bus::transport::{ContextTarget, Delivery, Disposition, Listener, SenderInfo, Transport, TransportFailure};
use crate::config::BusConfig;
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Which host delivery behavior to model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFlavor {
    Chromium,
    Gecko,
}

type PortId = u64;

const BACKGROUND_PORT: PortId = 0;

struct ContextSlot {
    info: SenderInfo,
    listener: Option<Arc<dyn Listener>>,
    closed: CancellationToken,
    extension_page: bool,
}

struct BackgroundSlot {
    listener: Option<Arc<dyn Listener>>,
    closed: CancellationToken,
}

struct HostState {
    background: BackgroundSlot,
    contexts: BTreeMap<PortId, ContextSlot>,
    next_port: PortId,
    next_major: u64,
    next_minor: HashMap<u64, u64>,
}

/// One recipient of a delivery
struct Recipient {
    listener: Arc<dyn Listener>,
    closed: CancellationToken,
}

pub struct MemoryHost {
    flavor: HostFlavor,
    max_message_bytes: usize,
    extension_origin: String,
    blobs: Arc<MemoryBlobStore>,
    state: Mutex<HostState>,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHost")
            .field("flavor", &self.flavor)
            .field("contexts", &state.contexts.len())
            .field("background_listening", &state.background.listener.is_some())
            .finish()
    }
}

impl MemoryHost {
    /// Create a host. Size limit and extension origin come from `config`.
    pub fn new(flavor: HostFlavor, config: &BusConfig) -> Arc<Self> {
        Arc::new(Self {
            flavor,
            max_message_bytes: config.max_message_bytes,
            extension_origin: config.extension_origin.clone(),
            blobs: Arc::new(MemoryBlobStore::new()),
            state: Mutex::new(HostState {
                background: BackgroundSlot {
                    listener: None,
                    closed: CancellationToken::new(),
                },
                contexts: BTreeMap::new(),
                next_port: BACKGROUND_PORT + 1,
                next_major: 1,
                next_minor: HashMap::new(),
            }),
        })
    }

    pub fn flavor(&self) -> HostFlavor {
        self.flavor
    }

    /// The shared handle store, for inspecting outstanding handles.
    pub fn blob_store(&self) -> &Arc<MemoryBlobStore> {
        &self.blobs
    }

    pub fn background_port(self: &Arc<Self>) -> HostPort {
        let closed = self.state.lock().background.closed.clone();
        HostPort {
            host: Arc::clone(self),
            id: BACKGROUND_PORT,
            info: SenderInfo::Background,
            closed,
        }
    }

    /// Open a new top-level unit (minor 0) showing `url`.
    pub fn open_unit(self: &Arc<Self>, url: &str) -> HostPort {
        let major = {
            let mut state = self.state.lock();
            let major = state.next_major;
            state.next_major += 1;
            state.next_minor.insert(major, 1);
            major
        };
        self.attach(Some(FrameAddress::new(major, TOP_LEVEL_MINOR)), url, Some(url.to_string()))
    }

    /// Open a context outside any top-level unit, such as a popup page.
    pub fn open_page(self: &Arc<Self>, url: &str) -> HostPort {
        self.attach(None, url, None)
    }

    fn open_frame_in(self: &Arc<Self>, major: u64, url: &str, top_url: Option<String>) -> HostPort {
        let minor = {
            let mut state = self.state.lock();
            let next = state.next_minor.entry(major).or_insert(1);
            let minor = *next;
            *next += 1;
            minor
        };
        self.attach(Some(FrameAddress::new(major, minor)), url, top_url)
    }

    fn attach(self: &Arc<Self>, frame: Option<FrameAddress>, url: &str, top_url: Option<String>) -> HostPort {
        let info = SenderInfo::Context {
            frame,
            url: url.to_string(),
            top_url,
        };
        let closed = CancellationToken::new();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_port;
            state.next_port += 1;
            state.contexts.insert(
                id,
                ContextSlot {
                    info: info.clone(),
                    listener: None,
                    closed: closed.clone(),
                    extension_page: url.starts_with(&self.extension_origin),
                },
            );
            id
        };
        tracing::debug!("[MemoryHost] Opened context {:?} at {}", frame, url);
        HostPort {
            host: Arc::clone(self),
            id,
            info,
            closed,
        }
    }

    fn close(&self, id: PortId) {
        let mut state = self.state.lock();
        if id == BACKGROUND_PORT {
            state.background.listener = None;
            state.background.closed.cancel();
            state.background.closed = CancellationToken::new();
        } else if let Some(slot) = state.contexts.remove(&id) {
            tracing::debug!("[MemoryHost] Closed context {:?}", slot.info.frame());
            slot.closed.cancel();
        }
    }

    fn set_listener(&self, id: PortId, listener: Arc<dyn Listener>) {
        let mut state = self.state.lock();
        if id == BACKGROUND_PORT {
            state.background.listener = Some(listener);
        } else if let Some(slot) = state.contexts.get_mut(&id) {
            slot.listener = Some(listener);
        }
    }

    fn listening_contexts<'a>(
        state: &'a HostState,
        filter: impl Fn(PortId, &ContextSlot) -> bool + 'a,
    ) -> impl Iterator<Item = Recipient> + 'a {
        state.contexts.iter().filter(move |(id, slot)| filter(**id, slot)).filter_map(|(_, slot)| {
            slot.listener.as_ref().map(|listener| Recipient {
                listener: Arc::clone(listener),
                closed: slot.closed.clone(),
            })
        })
    }

    fn broker_recipients(&self, from: PortId) -> Vec<Recipient> {
        let state = self.state.lock();
        let mut recipients = Vec::new();
        if from != BACKGROUND_PORT {
            if let Some(listener) = &state.background.listener {
                recipients.push(Recipient {
                    listener: Arc::clone(listener),
                    closed: state.background.closed.clone(),
                });
            }
        }
        if self.flavor == HostFlavor::Chromium {
            recipients.extend(Self::listening_contexts(&state, |id, slot| id != from && slot.extension_page));
        }
        recipients
    }

    fn context_recipients(&self, target: ContextTarget) -> Vec<Recipient> {
        let state = self.state.lock();
        Self::listening_contexts(&state, |_, slot| match (target, slot.info.frame()) {
            (ContextTarget::Frame(want), Some(have)) => want == have,
            (ContextTarget::Unit(major), Some(have)) => have.major == major,
            _ => false,
        })
        .collect()
    }

    fn all_context_recipients(&self) -> Vec<Recipient> {
        let state = self.state.lock();
        Self::listening_contexts(&state, |_, _| true).collect()
    }

    /// Clone `envelope` the way the host would and hand it to every recipient.
    ///
    /// A response that arrives after the sending context closed is dropped.
    fn deliver(&self, envelope: Envelope, from: &HostPort, recipients: Vec<Recipient>) -> Delivery {
        let sender = from.info.clone();
        let sender_closed = from.closed.clone();
        let envelope = match structured_clone(&envelope, &envelope.data.bm, self.max_message_bytes) {
            Ok(cloned) => cloned,
            Err(failure) => return future::ready(Err(failure)).boxed(),
        };
        if recipients.is_empty() {
            return future::ready(Err(TransportFailure::NoReceiver)).boxed();
        }
        let max = self.max_message_bytes;
        let (mut tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut outcomes: FuturesUnordered<BoxFuture<'static, Result<Option<RawResponse>, TransportFailure>>> =
                FuturesUnordered::new();
            for recipient in recipients {
                let closed = recipient.closed;
                // Every answering recipient runs to completion, answer used or not
                let answer = match recipient.listener.on_message(envelope.clone(), sender.clone()) {
                    Disposition::Decline => continue,
                    Disposition::Absorb => {
                        tracing::trace!("[MemoryHost] '{}' absorbed by a recipient", envelope.name);
                        continue;
                    }
                    Disposition::Respond(response) => tokio::spawn(response.map(Some)),
                    Disposition::Forward(response) => tokio::spawn(response),
                };
                outcomes.push(
                    async move {
                        tokio::select! {
                            answer = answer => match answer {
                                Ok(Some(answer)) => structured_clone(&answer, &answer.result, max).map(Some),
                                Ok(None) => Ok(None),
                                Err(e) => Err(TransportFailure::Other(format!("recipient failed: {}", e))),
                            },
                            _ = closed.cancelled() => Err(TransportFailure::PortClosed),
                        }
                    }
                    .boxed(),
                );
            }

            let mut result = Ok(None);
            loop {
                tokio::select! {
                    next = outcomes.next() => match next {
                        Some(Ok(Some(response))) => {
                            result = Ok(Some(response));
                            break;
                        }
                        Some(Ok(None)) => {}
                        Some(Err(failure)) => result = Err(failure),
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            if sender_closed.is_cancelled() {
                if let Ok(Some(response)) = &result {
                    tracing::warn!(
                        "[MemoryHost] Dropping {} for {:?}: sender closed",
                        if response.is_err() { "error response" } else { "response" },
                        sender.frame()
                    );
                }
                result = Err(TransportFailure::PortClosed);
            }
            let _ = tx.send(result);
        });

        async move { rx.await.unwrap_or(Err(TransportFailure::PortClosed)) }.boxed()
    }
}

/// CBOR round trip of `value`, refusing oversized messages and nested binary in `payload`.
fn structured_clone<T>(value: &T, payload: &ciborium::Value, max: usize) -> Result<T, TransportFailure>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    if let Some(path) = find_binary(payload) {
        return Err(TransportFailure::NotCloneable(format!("binary value at '{}'", path)));
    }
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| TransportFailure::NotCloneable(e.to_string()))?;
    if bytes.len() > max {
        return Err(TransportFailure::TooLarge { size: bytes.len(), max });
    }
    ciborium::de::from_reader(bytes.as_slice()).map_err(|e| TransportFailure::NotCloneable(e.to_string()))
}

/// One context's connection to a [`MemoryHost`].
#[derive(Clone)]
pub struct HostPort {
    host: Arc<MemoryHost>,
    id: PortId,
    info: SenderInfo,
    closed: CancellationToken,
}

impl std::fmt::Debug for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPort").field("id", &self.id).field("info", &self.info).finish()
    }
}

impl HostPort {
    /// Address of this context, if it lives in a top-level unit.
    pub fn frame(&self) -> Option<FrameAddress> {
        self.info.frame()
    }

    /// Open a sub-frame inside this context's top-level unit.
    ///
    /// A context outside any unit gets a new page instead.
    pub fn open_frame(&self, url: &str) -> HostPort {
        match self.info.frame() {
            Some(frame) => self
                .host
                .open_frame_in(frame.major, url, self.info.top_url().map(str::to_string)),
            None => self.host.open_page(url),
        }
    }

    /// Close this context. Its outstanding deliveries fail with "port closed"
    /// and it receives nothing further.
    pub fn close(&self) {
        self.host.close(self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn require_background(&self, what: &str) -> Result<(), TransportFailure> {
        if self.id == BACKGROUND_PORT {
            Ok(())
        } else {
            Err(TransportFailure::Other(format!("only the background can {}", what)))
        }
    }
}

impl Transport for HostPort {
    fn sender_info(&self) -> SenderInfo {
        self.info.clone()
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        self.host.blobs.clone()
    }

    fn send_to_broker(&self, envelope: Envelope) -> Delivery {
        let recipients = self.host.broker_recipients(self.id);
        self.host.deliver(envelope, self, recipients)
    }

    fn send_to_context(&self, target: ContextTarget, envelope: Envelope) -> Delivery {
        if let Err(failure) = self.require_background("address contexts directly") {
            return future::ready(Err(failure)).boxed();
        }
        let recipients = self.host.context_recipients(target);
        self.host.deliver(envelope, self, recipients)
    }

    fn fan_out(&self, envelope: Envelope) -> Delivery {
        if let Err(failure) = self.require_background("fan out") {
            return future::ready(Err(failure)).boxed();
        }
        let recipients = self.host.all_context_recipients();
        self.host.deliver(envelope, self, recipients)
    }

    fn listen(&self, listener: Arc<dyn Listener>) {
        self.host.set_listener(self.id, listener);
    }
}
