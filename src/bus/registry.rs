//! Handler Registry
//!
//! Maps a message kind to the handler that serves it in one context. Exactly one
//! handler per kind; registering again replaces the previous one.

use crate::bus::error::BusError;
use crate::bus::kinds::{from_payload, to_payload, Kind, Message};
use crate::bus::transport::SenderInfo;
use ciborium::Value;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Handler over raw payload values
pub type HandlerFn = Arc<dyn Fn(Value, SenderInfo) -> HandlerFuture + Send + Sync>;

/// Which kind of context a registry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScope {
    /// The privileged broker context
    Background,
    /// A page or frame
    Local,
}

#[derive(Clone)]
struct HandlerEntry {
    handler: HandlerFn,
    /// Where the handler was registered; used as the responder stack
    registered_at: String,
}

/// A handler looked up for dispatch.
#[derive(Clone)]
pub struct Dispatch {
    pub handler: HandlerFn,
    pub registered_at: String,
}

impl Dispatch {
    pub fn invoke(&self, payload: Value, sender: SenderInfo) -> HandlerFuture {
        (self.handler)(payload, sender)
    }
}

pub struct HandlerRegistry {
    scope: RegistryScope,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry")
            .field("scope", &self.scope)
            .field("kinds", &kinds)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(scope: RegistryScope) -> Self {
        Self {
            scope,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> RegistryScope {
        self.scope
    }

    /// Register a typed handler for `M`. The request is decoded before the
    /// handler runs and the response encoded after.
    #[track_caller]
    pub fn register<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(M::Request, SenderInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw = move |payload: Value, sender: SenderInfo| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            async move {
                let request: M::Request = from_payload(M::NAME, payload)?;
                let response = handler(request, sender).await?;
                Ok(to_payload(M::NAME, &response)?)
            }
            .boxed()
        };
        self.insert(M::NAME, Arc::new(raw), crate::bus::envelope::capture_stack(false));
    }

    /// Register a handler over raw payload values for `kind`.
    #[track_caller]
    pub fn register_raw<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value, SenderInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let raw = move |payload: Value, sender: SenderInfo| -> HandlerFuture { handler(payload, sender).boxed() };
        self.insert(kind, Arc::new(raw), crate::bus::envelope::capture_stack(false));
    }

    fn insert(&self, kind: &str, handler: HandlerFn, registered_at: String) {
        if self.is_misplaced(kind) {
            tracing::warn!(
                "[HandlerRegistry] '{}' registered in a {:?} registry; its callers address the other side",
                kind,
                self.scope
            );
        }
        let replaced = self
            .handlers
            .write()
            .insert(kind.to_string(), HandlerEntry { handler, registered_at })
            .is_some();
        if replaced {
            tracing::debug!("[HandlerRegistry] Replaced handler for '{}' ({:?})", kind, self.scope);
        }
    }

    /// Remove the handler for `kind`. Returns whether one was registered.
    pub fn remove(&self, kind: &str) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    /// True for a known kind whose callers address the other scope.
    ///
    /// Background-bound kinds belong in the broker; the rest in frames. Dynamic
    /// kinds are never misplaced.
    pub fn is_misplaced(&self, kind: &str) -> bool {
        match kind.parse::<Kind>() {
            Ok(known) => known.is_background_bound() != (self.scope == RegistryScope::Background),
            Err(_) => false,
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    pub fn find(&self, kind: &str) -> Option<Dispatch> {
        self.handlers.read().get(kind).map(|entry| Dispatch {
            handler: Arc::clone(&entry.handler),
            registered_at: entry.registered_at.clone(),
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Run the handler for `kind`, failing with `HandlerNotFound` if there is none.
    pub fn dispatch(&self, kind: &str, payload: Value, sender: SenderInfo) -> Result<HandlerFuture, BusError> {
        let dispatch = self.find(kind).ok_or_else(|| BusError::HandlerNotFound { kind: kind.to_string() })?;
        Ok(dispatch.invoke(payload, sender))
    }
}
