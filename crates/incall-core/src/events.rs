//! Listener fan-out
//!
//! Two observer surfaces exist side by side:
//!
//! - Synchronous listeners ([`CallListListener`] on the registry,
//!   [`CallEntityListener`] on each call) are invoked on the owner task with
//!   borrowed access to the registry or entity. Each callback is isolated: a
//!   panicking observer is logged and the remaining observers still run.
//! - A `tokio::sync::broadcast` channel carries serializable
//!   [`CallListEvent`]s for observers living on other tasks. Publishing never
//!   blocks; lagging receivers lose the oldest events.
//!
//! ```rust,no_run
//! use incall_core::{CallListListener, CallRegistry, RegistryConfig};
//! use std::sync::Arc;
//!
//! struct ScreenRefresher;
//!
//! impl CallListListener for ScreenRefresher {
//!     fn on_call_list_change(&self, registry: &CallRegistry) {
//!         println!("{} calls", registry.len());
//!     }
//! }
//!
//! let mut registry = CallRegistry::builder(RegistryConfig::default()).build().unwrap();
//! registry.add_listener(Arc::new(ScreenRefresher));
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use crate::entity::CallEntity;
use crate::registry::CallRegistry;
use crate::state::CallState;
use crate::types::{CallHandle, CallId, DisconnectCode};
use crate::video::SessionModificationState;

/// Observer of registry-wide call events
///
/// Only [`on_call_list_change`](Self::on_call_list_change) is required. It is
/// the generic update channel and also fires once, synthetically, when the
/// listener is added.
pub trait CallListListener: Send + Sync {
    /// A new call arrived ringing. Generic updates are not guaranteed for it.
    fn on_incoming_call(&self, _call: &CallEntity) {}

    fn on_upgrade_to_video(&self, _call: &CallEntity) {}

    fn on_session_modification_state_change(&self, _call: &CallEntity) {}

    fn on_call_list_change(&self, registry: &CallRegistry);

    fn on_disconnect(&self, _call: &CallEntity) {}

    fn on_wifi_to_lte_handover(&self, _call: &CallEntity) {}

    fn on_handover_to_wifi_failed(&self, _call: &CallEntity) {}

    fn on_international_call_on_wifi(&self, _call: &CallEntity) {}
}

/// Observer of a single call
pub trait CallEntityListener: Send + Sync {
    fn on_call_update(&self, _call: &CallEntity) {}

    /// Fired instead of `on_call_update` when the call becomes disconnected
    fn on_call_disconnect(&self, _call: &CallEntity) {}

    fn on_child_number_change(&self, _call: &CallEntity) {}

    fn on_last_forwarded_number_change(&self, _call: &CallEntity) {}

    fn on_canned_responses_loaded(&self, _call: &CallEntity) {}

    fn on_upgrade_to_video(&self, _call: &CallEntity) {}

    fn on_session_modification_state_change(&self, _call: &CallEntity) {}

    fn on_wifi_to_lte_handover(&self, _call: &CallEntity) {}

    fn on_handover_to_wifi_failed(&self, _call: &CallEntity) {}

    fn on_international_call_on_wifi(&self, _call: &CallEntity) {}
}

/// Set of shared observers with identity-based, idempotent registration
pub struct ListenerSet<L: ?Sized> {
    listeners: Vec<Arc<L>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Add a listener; returns `false` if this exact listener is already present
    pub fn add(&mut self, listener: Arc<L>) -> bool {
        if self.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    pub fn remove(&mut self, listener: &Arc<L>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|existing| !same_listener(existing, listener));
        self.listeners.len() != before
    }

    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.listeners
            .iter()
            .any(|existing| same_listener(existing, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invoke `f` on a snapshot of the listeners, isolating each call
    pub fn for_each(&self, event: &str, f: impl Fn(&L)) {
        let snapshot = self.listeners.clone();
        for listener in snapshot {
            invoke_isolated(event, || f(listener.as_ref()));
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.len())
            .finish()
    }
}

/// Run one observer callback; a panic is logged instead of unwinding further
pub(crate) fn invoke_isolated(event: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            "Listener panicked while handling {}: {}",
            event,
            panic_message(payload.as_ref())
        );
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Serializable view of one call, carried by [`CallListEvent`]s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    pub id: CallId,
    pub unique_id: Uuid,
    pub handle: CallHandle,
    pub state: CallState,
    pub number: Option<String>,
    pub disconnect_cause: DisconnectCode,
    pub is_spam: Option<bool>,
    pub is_blocked: Option<bool>,
    pub is_emergency: Option<bool>,
    pub is_conference: bool,
    pub parent: Option<CallId>,
    pub children: Vec<CallId>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl From<&CallEntity> for CallSummary {
    fn from(call: &CallEntity) -> Self {
        let flags = call.classification();
        Self {
            id: call.id(),
            unique_id: call.unique_id(),
            handle: call.handle().clone(),
            state: call.current_state(),
            number: call.number().map(str::to_string),
            disconnect_cause: call.disconnect_cause().code,
            is_spam: flags.spam,
            is_blocked: flags.blocked,
            is_emergency: call.is_emergency(),
            is_conference: call.is_conference(),
            parent: call.parent_id(),
            children: call.child_ids().to_vec(),
            created_at: call.created_at(),
            connected_at: call.connected_at(),
        }
    }
}

/// Registry events for observers on other tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallListEvent {
    IncomingCall { call: CallSummary },
    /// Generic update; carries every call currently in the registry
    CallListChanged { calls: Vec<CallSummary> },
    Disconnected { call: CallSummary },
    /// The call left the registry for good
    Retired { call_id: CallId, handle: CallHandle },
    UpgradeToVideo { call: CallSummary },
    SessionModificationStateChanged {
        call: CallSummary,
        state: SessionModificationState,
    },
    WifiToLteHandover { call: CallSummary },
    HandoverToWifiFailed { call: CallSummary },
    InternationalCallOnWifi { call: CallSummary },
}

/// Registry-side observers plus the broadcast channel
#[derive(Debug)]
pub struct EventBus {
    listeners: ListenerSet<dyn CallListListener>,
    sender: broadcast::Sender<CallListEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: ListenerSet::new(),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallListEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<CallListEvent> {
        self.sender.clone()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CallListListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn CallListListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Call every registry listener, isolating failures
    pub fn notify(&self, event: &str, f: impl Fn(&dyn CallListListener)) {
        self.listeners.for_each(event, |listener| f(listener));
    }

    /// Publish to broadcast subscribers; having none is not an error
    pub fn publish(&self, event: CallListEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("No subscribers for call list event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    struct Counter(AtomicUsize);

    impl Ping for Counter {
        fn ping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploder;

    impl Ping for Exploder {
        fn ping(&self) {
            panic!("observer bug");
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut set: ListenerSet<dyn Ping> = ListenerSet::new();
        let counter: Arc<dyn Ping> = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(set.add(counter.clone()));
        assert!(!set.add(counter.clone()));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&counter));
        assert!(!set.remove(&counter));
        assert!(set.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_fan_out() {
        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let last = Arc::new(Counter(AtomicUsize::new(0)));
        let mut set: ListenerSet<dyn Ping> = ListenerSet::new();
        set.add(first.clone());
        set.add(Arc::new(Exploder));
        set.add(last.clone());

        set.for_each("ping", |listener| listener.ping());

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(last.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(CallListEvent::CallListChanged { calls: Vec::new() });

        let mut receiver = bus.subscribe();
        bus.publish(CallListEvent::CallListChanged { calls: Vec::new() });
        assert_eq!(
            receiver.try_recv().unwrap(),
            CallListEvent::CallListChanged { calls: Vec::new() }
        );
    }
}
