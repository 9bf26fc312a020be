//! Pending-call table
//!
//! Outstanding requests keyed by unique id. Each entry settles at most once:
//! the first matching response or terminal failure removes it, later ones find
//! nothing and are dropped.

use crate::bus::envelope::UniqueId;
use crate::bus::error::BusError;
use ciborium::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub type CallResult = Result<Value, BusError>;

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<UniqueId, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and return the receiver its result arrives on.
    pub fn insert(&self, uid: UniqueId) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(uid, tx);
        rx
    }

    /// Settle the call `uid`. Returns false if it was already settled or unknown.
    pub fn settle(&self, uid: &UniqueId, result: CallResult) -> bool {
        let Some(tx) = self.calls.lock().remove(uid) else {
            return false;
        };
        // A dropped receiver means the caller stopped waiting
        if tx.send(result).is_err() {
            tracing::debug!("[PendingCalls] Caller abandoned {}", uid);
        }
        true
    }

    /// Forget a call without settling it.
    pub fn abandon(&self, uid: &UniqueId) -> bool {
        self.calls.lock().remove(uid).is_some()
    }

    /// Guard that abandons `uid` if dropped before the call settles.
    pub fn abandon_on_drop(&self, uid: UniqueId) -> AbandonOnDrop<'_> {
        AbandonOnDrop { calls: self, uid }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// Drops the pending entry of a caller that stopped waiting.
pub struct AbandonOnDrop<'a> {
    calls: &'a PendingCalls,
    uid: UniqueId,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.calls.abandon(&self.uid) {
            tracing::debug!("[PendingCalls] Caller dropped {} before it settled", self.uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // TEST080: Test a call settles exactly once
    #[tokio::test]
    async fn test_settle_once() {
        let pending = PendingCalls::new();
        let uid = UniqueId::new();
        let rx = pending.insert(uid.clone());
        assert_eq!(pending.len(), 1);

        assert!(pending.settle(&uid, Ok(Value::Bool(true))));
        assert!(!pending.settle(&uid, Err(BusError::Payload("late".into()))));
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), Value::Bool(true));
    }

    // TEST081: Test concurrent calls settle independently of order
    #[tokio::test]
    async fn test_independent_settlement() {
        let pending = PendingCalls::new();
        let a = UniqueId::new();
        let b = UniqueId::new();
        let rx_a = pending.insert(a.clone());
        let rx_b = pending.insert(b.clone());
        pending.settle(&b, Ok(Value::Text("b".into())));
        pending.settle(&a, Ok(Value::Text("a".into())));
        assert_eq!(rx_a.await.unwrap().unwrap(), Value::Text("a".into()));
        assert_eq!(rx_b.await.unwrap().unwrap(), Value::Text("b".into()));
    }

    // TEST082: Test settling an abandoned call still consumes the entry
    #[test]
    fn test_abandoned_receiver() {
        let pending = PendingCalls::new();
        let uid = UniqueId::new();
        drop(pending.insert(uid.clone()));
        assert!(pending.settle(&uid, Ok(Value::Null)));
        assert!(pending.is_empty());
        assert!(!pending.abandon(&uid));
    }

    // TEST083: Test the drop guard removes only unsettled calls
    #[test]
    fn test_abandon_on_drop() {
        let pending = PendingCalls::new();
        let waiting = UniqueId::new();
        let _rx = pending.insert(waiting.clone());
        drop(pending.abandon_on_drop(waiting.clone()));
        assert!(pending.is_empty());
        assert!(!pending.settle(&waiting, Ok(Value::Null)));

        let settled = UniqueId::new();
        let rx = pending.insert(settled.clone());
        let guard = pending.abandon_on_drop(settled.clone());
        assert!(pending.settle(&settled, Ok(Value::Bool(true))));
        drop(guard);
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), Value::Bool(true));
    }
}
