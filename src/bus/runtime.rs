//! ContextRuntime — one context's end of the bus
//!
//! A runtime owns everything the bus keeps per context: the handler registry,
//! the pending-call table, the seen-id cache and the context's own address.
//! There are no globals; each context constructs exactly one runtime.
//!
//! ## Roles
//!
//! - **Background**: the broker. Listens from construction, routes every
//!   envelope it observes (see [`crate::bus::router`]), answers `_tab_` and
//!   calls itself without the transport.
//! - **Frame**: any other context. Receives only envelopes addressed to its
//!   own address or to `broadcast`, once it [`listen`](ContextRuntime::listen)s.
//!
//! ## Call flow
//!
//! ```text
//! call ──▶ encode ──▶ pending[uid] ──▶ transport ──▶ … ──▶ response
//!                          ▲                                  │
//!                          └──────── settle(uid) ◀── classify ┘
//! ```

use crate::address::{Address, FrameAddress};
use crate::bus::codec::{self, BlobStore};
use crate::bus::dedup::SeenIdCache;
use crate::bus::envelope::{self, Envelope, RawResponse, UniqueId};
use crate::bus::error::BusError;
use crate::bus::identity;
use crate::bus::kinds::{from_payload, to_payload, Empty, Message, TabId, TabIdResponse};
use crate::bus::marshal::{self, MarshalledError};
use crate::bus::pending::PendingCalls;
use crate::bus::registry::{Dispatch, HandlerFuture, HandlerRegistry, RegistryScope};
use crate::bus::router::{self, RelayPolicy, Route};
use crate::bus::transport::{ContextTarget, Delivery, Disposition, Listener, SenderInfo, Transport, TransportFailure};
use crate::config::BusConfig;
use ciborium::Value;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

// =============================================================================
// ERROR REPORTS
// =============================================================================

/// Failure of a fire-and-forget call, delivered out of band.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: String,
    pub error: BusError,
}

// =============================================================================
// RUNTIME
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Background,
    Frame,
}

/// A message on its way out: handled in-process or handed to the transport.
enum Outbound {
    Local { future: HandlerFuture, responder: String },
    Remote { delivery: Delivery, uid: UniqueId },
}

struct RuntimeInner {
    role: Role,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    blobs: Arc<dyn BlobStore>,
    policy: Arc<dyn RelayPolicy>,
    registry: HandlerRegistry,
    pending: PendingCalls,
    seen: Mutex<SeenIdCache>,
    own_address: Mutex<Option<FrameAddress>>,
    /// Undrained reports, oldest first, at most `config.report_capacity`
    reports: Mutex<VecDeque<ErrorReport>>,
    report_ready: Notify,
}

/// Per-context owner of the bus state. Cheap to clone.
#[derive(Clone)]
pub struct ContextRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for ContextRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRuntime")
            .field("role", &self.inner.role)
            .field("own_address", &*self.inner.own_address.lock())
            .field("pending", &self.inner.pending.len())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl ContextRuntime {
    /// Create the background runtime and start brokering.
    ///
    /// The relay heuristic follows `config.relay_mode`.
    pub fn background<T: Transport + 'static>(transport: T, config: BusConfig) -> Self {
        let policy = router::policy_for(&config);
        Self::background_with_policy(transport, config, policy)
    }

    /// Create the background runtime with an explicit relay policy.
    pub fn background_with_policy<T: Transport + 'static>(
        transport: T,
        config: BusConfig,
        policy: Arc<dyn RelayPolicy>,
    ) -> Self {
        let runtime = Self::build(Role::Background, Arc::new(transport), config, policy);
        runtime.inner.registry.register::<TabId, _, _>(|_: Empty, sender: SenderInfo| async move {
            Ok(TabIdResponse {
                tab_id: sender.frame().map(|f| f.to_string()),
            })
        });
        let listener = BrokerListener {
            inner: Arc::downgrade(&runtime.inner),
        };
        runtime.inner.transport.listen(Arc::new(listener));
        tracing::debug!("[Broker] Listening");
        runtime
    }

    /// Create the runtime of a non-background context. It receives nothing
    /// until [`listen`](Self::listen) is called.
    pub fn frame<T: Transport + 'static>(transport: T, config: BusConfig) -> Self {
        let policy = router::policy_for(&config);
        Self::build(Role::Frame, Arc::new(transport), config, policy)
    }

    fn build(role: Role, transport: Arc<dyn Transport>, config: BusConfig, policy: Arc<dyn RelayPolicy>) -> Self {
        let scope = match role {
            Role::Background => RegistryScope::Background,
            Role::Frame => RegistryScope::Local,
        };
        Self {
            inner: Arc::new(RuntimeInner {
                role,
                blobs: transport.blobs(),
                transport,
                policy,
                registry: HandlerRegistry::new(scope),
                pending: PendingCalls::new(),
                seen: Mutex::new(SeenIdCache::new(config.seen_capacity, config.seen_ttl())),
                own_address: Mutex::new(None),
                reports: Mutex::new(VecDeque::with_capacity(config.report_capacity.min(64))),
                report_ready: Notify::new(),
                config,
            }),
        }
    }

    pub fn is_background(&self) -> bool {
        self.inner.role == Role::Background
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Address this context listens on, once known.
    pub fn own_address(&self) -> Option<FrameAddress> {
        *self.inner.own_address.lock()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register the handler for `M`, replacing any previous one.
    #[track_caller]
    pub fn register<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(M::Request, SenderInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Response>> + Send + 'static,
    {
        self.inner.registry.register::<M, F, Fut>(handler);
    }

    /// Register a handler for a dynamic kind, replacing any previous one.
    #[track_caller]
    pub fn register_raw<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value, SenderInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.registry.register_raw(kind, handler);
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.inner.registry.remove(kind)
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Call `M` at `destination` and await its response.
    ///
    /// The message is sent when this is called, not when the returned future
    /// is first polled. The caller's location becomes the envelope's origin stack.
    #[track_caller]
    pub fn call<M: Message>(
        &self,
        destination: Address,
        request: &M::Request,
    ) -> impl Future<Output = Result<M::Response, BusError>> + Send + 'static {
        let stack = self.inner.capture_stack();
        let sent = to_payload(M::NAME, request).map(|payload| self.inner.start(destination, M::NAME, payload, &stack));
        let inner = Arc::clone(&self.inner);
        async move {
            let value = inner.complete(sent??, destination, M::NAME.to_string(), stack).await?;
            from_payload(M::NAME, value)
        }
    }

    /// Call a dynamic kind at `destination` and await its raw response.
    #[track_caller]
    pub fn call_raw(
        &self,
        destination: Address,
        kind: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, BusError>> + Send + 'static {
        let stack = self.inner.capture_stack();
        let sent = self.inner.start(destination, kind, payload, &stack);
        let inner = Arc::clone(&self.inner);
        let kind = kind.to_string();
        async move { inner.complete(sent?, destination, kind, stack).await }
    }

    /// Send `M` without waiting for the handler. Failures, including the
    /// handler's own, arrive as [`ErrorReport`]s.
    #[track_caller]
    pub fn notify<M: Message>(&self, destination: Address, request: &M::Request) {
        let stack = self.inner.capture_stack();
        match to_payload(M::NAME, request) {
            Ok(payload) => self.inner.fire(destination, M::NAME, payload, stack),
            Err(error) => self.inner.report(M::NAME, error),
        }
    }

    /// Send a dynamic kind without waiting for the handler.
    #[track_caller]
    pub fn notify_raw(&self, destination: Address, kind: &str, payload: Value) {
        let stack = self.inner.capture_stack();
        self.inner.fire(destination, kind, payload, stack);
    }

    /// Drain the fire-and-forget failures reported so far, oldest first.
    ///
    /// Only the latest `report_capacity` undrained reports are kept.
    pub fn take_error_reports(&self) -> Vec<ErrorReport> {
        self.inner.reports.lock().drain(..).collect()
    }

    /// Wait for the next fire-and-forget failure and remove it.
    pub async fn next_error_report(&self) -> ErrorReport {
        loop {
            let ready = self.inner.report_ready.notified();
            if let Some(report) = self.inner.reports.lock().pop_front() {
                return report;
            }
            ready.await;
        }
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Start receiving envelopes addressed to `address` or to `broadcast`.
    pub fn listen(&self, address: FrameAddress) {
        *self.inner.own_address.lock() = Some(address);
        if self.is_background() {
            return;
        }
        let listener = FrameListener {
            inner: Arc::downgrade(&self.inner),
        };
        self.inner.transport.listen(Arc::new(listener));
        tracing::debug!("[FrameListener] Listening as {}", address);
    }

    /// Ask the broker for this context's address, retrying while it is not up.
    pub async fn resolve_own_address(&self) -> Result<FrameAddress, BusError> {
        let attempts = self.inner.config.identity_attempts;
        let delay = self.inner.config.identity_delay();
        identity::resolve_own_address(attempts, delay, || {
            let call = self.call::<TabId>(Address::Background, &Empty {});
            async move {
                let response = call.await?;
                let address = response.tab_id.map(|t| FrameAddress::from_string(&t)).transpose()?;
                Ok::<_, BusError>(address)
            }
        })
        .await
    }

    /// Resolve this context's address and listen on it.
    pub async fn resolve_and_listen(&self) -> Result<FrameAddress, BusError> {
        let address = self.resolve_own_address().await?;
        self.listen(address);
        Ok(address)
    }
}

impl RuntimeInner {
    #[track_caller]
    fn capture_stack(&self) -> String {
        envelope::capture_stack(self.config.capture_backtraces)
    }

    fn context_name(&self) -> String {
        match self.role {
            Role::Background => "background".to_string(),
            Role::Frame => match *self.own_address.lock() {
                Some(address) => format!("context {}", address),
                None => "context (unresolved)".to_string(),
            },
        }
    }

    /// Description of the handler side, used as the responder stack.
    fn responder(&self, kind: &str, registered_at: &str) -> String {
        format!("{} (handler '{}' in {})", registered_at, kind, self.context_name())
    }

    fn report(&self, kind: &str, error: BusError) {
        tracing::warn!("[Correlator] Fire-and-forget '{}' failed: {}", kind, error);
        {
            let mut reports = self.reports.lock();
            if reports.len() >= self.config.report_capacity {
                if let Some(dropped) = reports.pop_front() {
                    tracing::warn!("[Correlator] Report queue full; dropping oldest ('{}')", dropped.kind);
                }
            }
            reports.push_back(ErrorReport {
                kind: kind.to_string(),
                error,
            });
        }
        self.report_ready.notify_one();
    }

    /// Hand a call to the transport, or to the own registry when the background calls itself.
    fn start(&self, destination: Address, kind: &str, payload: Value, stack: &str) -> Result<Outbound, BusError> {
        if self.role == Role::Background && destination.is_background() {
            let dispatch = self
                .registry
                .find(kind)
                .ok_or_else(|| BusError::HandlerNotFound { kind: kind.to_string() })?;
            return Ok(Outbound::Local {
                future: dispatch.invoke(payload, SenderInfo::Background),
                responder: self.responder(kind, &dispatch.registered_at),
            });
        }

        let envelope = codec::encode(kind, payload, &destination, stack.to_string(), &*self.blobs);
        let uid = envelope.uid.clone();
        tracing::debug!("[Correlator] Sending '{}' uid={} to {}", kind, uid, envelope.to_display());
        let delivery = match (self.role, destination) {
            (Role::Background, Address::Frame(frame)) => {
                self.transport.send_to_context(ContextTarget::Frame(frame), envelope)
            }
            (Role::Background, _) => self.transport.fan_out(envelope),
            (Role::Frame, _) => self.transport.send_to_broker(envelope),
        };
        Ok(Outbound::Remote { delivery, uid })
    }

    /// Wait for the outcome of a started call.
    async fn complete(
        self: Arc<Self>,
        outbound: Outbound,
        destination: Address,
        kind: String,
        stack: String,
    ) -> Result<Value, BusError> {
        match outbound {
            Outbound::Local { future, responder } => future
                .await
                .map_err(|e| marshal::from_wire(marshal::to_wire(&e, &responder), &kind, &stack)),
            Outbound::Remote { delivery, uid } => {
                let rx = self.pending.insert(uid.clone());
                let _abandon = self.pending.abandon_on_drop(uid.clone());
                let inner = Arc::clone(&self);
                let call_kind = kind.clone();
                tokio::spawn(async move {
                    let outcome = delivery.await;
                    let result = inner.classify(&call_kind, destination, &stack, outcome);
                    inner.pending.settle(&uid, result);
                });
                rx.await.unwrap_or_else(|_| {
                    Err(BusError::Transport {
                        kind,
                        diagnostic: "call dropped before settling".to_string(),
                    })
                })
            }
        }
    }

    fn fire(self: &Arc<Self>, destination: Address, kind: &str, payload: Value, stack: String) {
        let sent = self.start(destination, kind, payload, &stack);
        let inner = Arc::clone(self);
        let kind = kind.to_string();
        tokio::spawn(async move {
            let result = match sent {
                Ok(outbound) => Arc::clone(&inner).complete(outbound, destination, kind.clone(), stack).await,
                Err(e) => Err(e),
            };
            if let Err(error) = result {
                inner.report(&kind, error);
            }
        });
    }

    /// Turn a delivery outcome into the call's result.
    fn classify(
        &self,
        kind: &str,
        destination: Address,
        stack: &str,
        outcome: Result<Option<RawResponse>, TransportFailure>,
    ) -> Result<Value, BusError> {
        match outcome {
            Err(failure @ (TransportFailure::NotCloneable(_) | TransportFailure::TooLarge { .. })) => {
                Err(BusError::Serialization {
                    kind: kind.to_string(),
                    diagnostic: failure.to_string(),
                })
            }
            // Nobody listening is the same as nobody answering for a broadcast
            Err(TransportFailure::NoReceiver) if destination.is_broadcast() => Ok(Value::Null),
            Err(failure)
                if failure == TransportFailure::NoReceiver
                    || (failure == TransportFailure::PortClosed && destination.is_background()) =>
            {
                Err(BusError::ContextNotReady {
                    kind: kind.to_string(),
                    diagnostic: failure.to_string(),
                })
            }
            Err(failure) => Err(BusError::Transport {
                kind: kind.to_string(),
                diagnostic: failure.to_string(),
            }),
            Ok(None) if destination.is_broadcast() => Ok(Value::Null),
            Ok(None) => Err(BusError::Transport {
                kind: kind.to_string(),
                diagnostic: format!("no context answered at {}", destination),
            }),
            Ok(Some(mut raw)) => match raw.exception.take() {
                Some(exception) => Err(marshal::from_wire(exception, kind, stack)),
                None => Ok(codec::decode_response(raw, &*self.blobs)?),
            },
        }
    }

    /// Decode, run the handler and encode its outcome.
    fn handle(self: &Arc<Self>, dispatch: Dispatch, envelope: Envelope, sender: SenderInfo) -> BoxFuture<'static, RawResponse> {
        let inner = Arc::clone(self);
        async move {
            let responder = inner.responder(&envelope.name, &dispatch.registered_at);
            let payload = match codec::decode(envelope, &*inner.blobs) {
                Ok(payload) => payload,
                Err(e) => return RawResponse::err(marshal::to_wire(&anyhow::Error::new(e), &responder)),
            };
            match dispatch.invoke(payload, sender).await {
                Ok(result) => codec::encode_response(result, &*inner.blobs),
                Err(e) => RawResponse::err(marshal::to_wire(&e, &responder)),
            }
        }
        .boxed()
    }

    fn failed(exception: MarshalledError) -> Disposition {
        Disposition::Respond(future::ready(RawResponse::err(exception)).boxed())
    }
}

// =============================================================================
// LISTENERS
// =============================================================================

/// Receives envelopes for a non-background context.
struct FrameListener {
    inner: Weak<RuntimeInner>,
}

impl Listener for FrameListener {
    fn on_message(&self, envelope: Envelope, sender: SenderInfo) -> Disposition {
        let Some(inner) = self.inner.upgrade() else {
            return Disposition::Decline;
        };
        let Some(own) = *inner.own_address.lock() else {
            return Disposition::Decline;
        };
        let broadcast = envelope.is_broadcast();
        let to_me = matches!(envelope.destination(), Ok(Address::Frame(frame)) if frame == own);
        if !to_me && !broadcast {
            return Disposition::Decline;
        }
        if !inner.seen.lock().check_and_record(&envelope.uid) {
            tracing::warn!(
                "[FrameListener] {} absorbed duplicate '{}' uid={}",
                own,
                envelope.name,
                envelope.uid
            );
            return Disposition::Absorb;
        }
        if let Some(dispatch) = inner.registry.find(&envelope.name) {
            tracing::debug!("[FrameListener] {} handling '{}' uid={}", own, envelope.name, envelope.uid);
            return Disposition::Respond(inner.handle(dispatch, envelope, sender));
        }
        if !broadcast && !inner.config.is_silent_kind(&envelope.name) {
            return RuntimeInner::failed(MarshalledError::handler_not_found(&envelope.name, &inner.context_name()));
        }
        Disposition::Decline
    }
}

/// The background's listener: routes every envelope it observes.
struct BrokerListener {
    inner: Weak<RuntimeInner>,
}

impl Listener for BrokerListener {
    fn on_message(&self, envelope: Envelope, sender: SenderInfo) -> Disposition {
        let Some(inner) = self.inner.upgrade() else {
            return Disposition::Decline;
        };
        let has_handler = inner.registry.contains(&envelope.name);
        let route = router::route(envelope.to.as_deref(), &sender, &*inner.policy, has_handler);
        tracing::debug!(
            "[Broker] '{}' uid={} from {:?} to {} → {:?}",
            envelope.name,
            envelope.uid,
            sender.frame(),
            envelope.to_display(),
            route
        );
        match route {
            Route::Relay(frame) => {
                let delivery = inner.transport.send_to_context(ContextTarget::Frame(frame), envelope);
                let responder = format!("relay to {} in background", frame);
                Disposition::Forward(
                    async move {
                        match delivery.await {
                            Ok(answer) => answer,
                            Err(failure) => Some(RawResponse::err(MarshalledError::undeliverable(
                                failure.to_string(),
                                failure == TransportFailure::NoReceiver,
                                &responder,
                            ))),
                        }
                    }
                    .boxed(),
                )
            }
            Route::Bounce { major } => {
                let delivery = inner.transport.send_to_context(ContextTarget::Unit(major), envelope);
                let responder = format!("broadcast bounce to unit {} in background", major);
                Disposition::Forward(
                    async move {
                        match delivery.await {
                            Ok(answer) => answer,
                            // A unit with no listening frame answers like a silent broadcast
                            Err(TransportFailure::NoReceiver) => None,
                            Err(failure) => {
                                Some(RawResponse::err(MarshalledError::undeliverable(failure.to_string(), false, &responder)))
                            }
                        }
                    }
                    .boxed(),
                )
            }
            Route::Local => {
                if !inner.seen.lock().check_and_record(&envelope.uid) {
                    tracing::warn!("[Broker] Absorbed duplicate '{}' uid={}", envelope.name, envelope.uid);
                    return Disposition::Absorb;
                }
                match inner.registry.find(&envelope.name) {
                    Some(dispatch) => Disposition::Respond(inner.handle(dispatch, envelope, sender)),
                    None => RuntimeInner::failed(MarshalledError::handler_not_found(&envelope.name, "background")),
                }
            }
            Route::NoSuchHandler => {
                RuntimeInner::failed(MarshalledError::handler_not_found(&envelope.name, "background"))
            }
            Route::Unroutable(reason) => {
                RuntimeInner::failed(MarshalledError::generic(format!("{}: {}", envelope.name, reason), "background"))
            }
            Route::Ignore => Disposition::Decline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::host::{HostFlavor, MemoryHost};

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (Value::Text(k.to_string()), v)).collect())
    }

    fn gecko() -> (Arc<MemoryHost>, BusConfig) {
        let config = BusConfig {
            relay_mode: crate::config::RelayMode::Always,
            ..BusConfig::default()
        };
        (MemoryHost::new(HostFlavor::Gecko, &config), config)
    }

    // TEST140: Test the background calling itself bypasses the transport
    #[tokio::test]
    async fn test_background_self_call() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config);
        bg.register_raw("echo", |payload, sender| async move {
            anyhow::ensure!(sender.is_background(), "expected in-process sender");
            Ok(payload)
        });
        let out = bg.call_raw(Address::Background, "echo", map(vec![("v", Value::Integer(7.into()))])).await.unwrap();
        assert_eq!(out, map(vec![("v", Value::Integer(7.into()))]));
        assert_eq!(bg.pending_calls(), 0);

        match bg.call_raw(Address::Background, "missing", Value::Null).await {
            Err(BusError::HandlerNotFound { kind }) => assert_eq!(kind, "missing"),
            other => panic!("expected HandlerNotFound, got {:?}", other),
        }
    }

    // TEST141: Test a background self-call failure keeps both stacks
    #[tokio::test]
    async fn test_background_self_call_error() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config);
        bg.register_raw("fail", |_, _| async { Err(anyhow::anyhow!("nope")) });
        let err = bg.call_raw(Address::Background, "fail", Value::Null).await.unwrap_err();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.message(), "BusMsg(fail) nope");
        assert!(remote.stack().contains("runtime.rs"));
        assert!(remote.stack().contains("handler 'fail' in background"));
    }

    // TEST142: Test the background answers _tab_ with the sender's address
    #[tokio::test]
    async fn test_tab_id_builtin() {
        let (host, config) = gecko();
        let _bg = ContextRuntime::background(host.background_port(), config.clone());
        let unit = host.open_unit("https://a.example/");
        let frame_port = unit.open_frame("https://a.example/f");
        let frame = ContextRuntime::frame(frame_port, config.clone());
        let response = frame.call::<TabId>(Address::Background, &Empty {}).await.unwrap();
        assert_eq!(response.tab_id.as_deref(), Some("1:1"));

        let popup = ContextRuntime::frame(host.open_page("ctxbus-extension://popup.htm"), config);
        let response = popup.call::<TabId>(Address::Background, &Empty {}).await.unwrap();
        assert_eq!(response.tab_id, None);
    }

    // TEST143: Test a frame only answers envelopes for its own address or broadcast
    #[tokio::test]
    async fn test_frame_listener_filters() {
        let (host, config) = gecko();
        let unit = host.open_unit("https://a.example/");
        let frame = ContextRuntime::frame(unit.clone(), config);
        frame.listen(FrameAddress::new(1, 0));
        frame.register_raw("k", |_, _| async { Ok(Value::Bool(true)) });
        let listener = FrameListener {
            inner: Arc::downgrade(&frame.inner),
        };

        let other = Envelope::new("k", Value::Null, Default::default(), &Address::frame(2, 0), String::new());
        assert!(matches!(listener.on_message(other, SenderInfo::Background), Disposition::Decline));

        let mine = Envelope::new("k", Value::Null, Default::default(), &Address::frame(1, 0), String::new());
        assert!(matches!(listener.on_message(mine.clone(), SenderInfo::Background), Disposition::Respond(_)));
        assert!(matches!(listener.on_message(mine, SenderInfo::Background), Disposition::Absorb));

        let unhandled = Envelope::new("other", Value::Null, Default::default(), &Address::frame(1, 0), String::new());
        assert!(matches!(listener.on_message(unhandled, SenderInfo::Background), Disposition::Respond(_)));

        let silent = Envelope::new("_tab_", Value::Null, Default::default(), &Address::frame(1, 0), String::new());
        assert!(matches!(listener.on_message(silent, SenderInfo::Background), Disposition::Decline));

        let unhandled_broadcast = Envelope::new("other", Value::Null, Default::default(), &Address::Broadcast, String::new());
        assert!(matches!(
            listener.on_message(unhandled_broadcast, SenderInfo::Background),
            Disposition::Decline
        ));
    }

    // TEST144: Test fire-and-forget failures arrive on the report channel, never the caller
    #[tokio::test]
    async fn test_notify_reports_failures() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config.clone());
        bg.register_raw("fail", |_, _| async { Err(anyhow::anyhow!("handler broke")) });
        let frame = ContextRuntime::frame(host.open_unit("https://a.example/"), config);

        frame.notify_raw(Address::Background, "fail", Value::Null);
        let report = tokio::time::timeout(std::time::Duration::from_secs(5), frame.next_error_report())
            .await
            .unwrap();
        assert_eq!(report.kind, "fail");
        assert!(report.error.to_string().contains("handler broke"));
        assert!(frame.take_error_reports().is_empty());
    }

    // TEST145: Test calling the broker before it exists is ContextNotReady and retryable
    #[tokio::test]
    async fn test_context_not_ready() {
        let (host, config) = gecko();
        let frame = ContextRuntime::frame(host.open_unit("https://a.example/"), config);
        let err = frame.call_raw(Address::Background, "anything", Value::Null).await.unwrap_err();
        assert!(matches!(err, BusError::ContextNotReady { .. }), "got {:?}", err);
        assert!(err.is_retryable());
        assert_eq!(frame.pending_calls(), 0);
    }

    // TEST146: Test the report queue keeps the newest failures and wakes a waiting reader
    #[tokio::test]
    async fn test_report_queue_bounded() {
        let (host, mut config) = gecko();
        config.report_capacity = 2;
        let frame = ContextRuntime::frame(host.open_unit("https://a.example/"), config);

        let waiter = {
            let frame = frame.clone();
            tokio::spawn(async move { frame.next_error_report().await })
        };
        tokio::task::yield_now().await;
        // Draining never blocks on a waiting reader
        assert!(frame.take_error_reports().is_empty());
        frame.inner.report("first", BusError::Payload("1".into()));
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(first.kind, "first");

        for kind in ["a", "b", "c"] {
            frame.inner.report(kind, BusError::Payload(kind.into()));
        }
        let kinds: Vec<String> = frame.take_error_reports().into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec!["b".to_string(), "c".to_string()]);
        assert!(frame.take_error_reports().is_empty());
    }

    // TEST147: Test the broker runs a locally handled envelope once and absorbs its duplicate
    #[tokio::test]
    async fn test_broker_absorbs_duplicate_local() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bg.register_raw("count", move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok(Value::Bool(true)) }
        });
        let listener = BrokerListener {
            inner: Arc::downgrade(&bg.inner),
        };
        let sender = SenderInfo::Context {
            frame: Some(FrameAddress::new(1, 0)),
            url: "https://a.example/".into(),
            top_url: Some("https://a.example/".into()),
        };

        let envelope = Envelope::new("count", Value::Null, Default::default(), &Address::Background, String::new());
        match listener.on_message(envelope.clone(), sender.clone()) {
            Disposition::Respond(answer) => assert_eq!(answer.await.result, Value::Bool(true)),
            other => panic!("expected Respond, got {:?}", other),
        }
        assert!(matches!(listener.on_message(envelope, sender), Disposition::Absorb));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // TEST148: Test a background broadcast nobody receives resolves empty and reports nothing
    #[tokio::test]
    async fn test_background_broadcast_without_listeners() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config);
        let out = bg.call_raw(Address::Broadcast, "nobody", Value::Map(vec![])).await;
        assert_eq!(out, Ok(Value::Null));

        bg.notify_raw(Address::Broadcast, "nobody", Value::Map(vec![]));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(bg.take_error_reports().is_empty());

        // A directed call to a frame nobody listens on is retryable
        let err = bg.call_raw(Address::frame(4, 0), "nobody", Value::Null).await.unwrap_err();
        assert!(matches!(err, BusError::ContextNotReady { .. }), "got {:?}", err);
    }

    // TEST149: Test a caller that stops waiting leaves no pending entry behind
    #[tokio::test]
    async fn test_dropped_call_is_abandoned() {
        let (host, config) = gecko();
        let bg = ContextRuntime::background(host.background_port(), config.clone());
        bg.register_raw("hang", |_, _| future::pending::<anyhow::Result<Value>>());
        let frame = ContextRuntime::frame(host.open_unit("https://a.example/"), config);

        let mut call = Box::pin(frame.call_raw(Address::Background, "hang", Value::Null));
        tokio::select! {
            _ = &mut call => panic!("hang must not answer"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        assert_eq!(frame.pending_calls(), 1);
        drop(call);
        assert_eq!(frame.pending_calls(), 0);
    }
}
