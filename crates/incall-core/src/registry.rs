//! The call table
//!
//! [`CallRegistry`] keeps every tracked [`CallEntity`] under two indices, by
//! [`CallId`] and by telephony [`CallHandle`], and keeps them in step. It admits
//! calls as telephony reports them, keeps disconnected calls around for their
//! retention grace period, and answers the "which call matters right now"
//! queries the in-call screen is built on.
//!
//! The registry is not thread-safe by construction: every mutating method takes
//! `&mut self` and is meant to run on a single owner task (see
//! [`crate::driver::RegistryDriver`]). Asynchronous classification lookups hand
//! their results back through a channel whose receiving end the owner drains.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classification::{
    BlockedNumberChecker, ClassificationDispatcher, ClassificationResult, SpamChecker,
};
use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::entity::{CallEntity, ConferenceLinks, EntityChange};
use crate::error::{RegistryError, Result};
use crate::events::{
    CallEntityListener, CallListEvent, CallListListener, CallSummary, EventBus, invoke_isolated,
};
use crate::retention::RetentionScheduler;
use crate::state::CallState;
use crate::telephony::{
    CallLogSink, ConnectionEvent, EnrichedCallRegistrar, TelephonyCommands, TelephonyEvent,
};
use crate::types::{CallHandle, CallId, CallSnapshot, DisconnectCause, DisconnectCode};
use crate::video::{
    SessionModificationState, VideoCapabilityResolver, VideoEvent, VideoStrategy,
    VideoStrategyFactory,
};

/// What [`CallRegistry::on_call_disappeared`] did with the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalOutcome {
    /// The call was terminal and left the registry
    Removed,
    /// The call is disconnected and stays until its retention expires
    Retained,
    /// The call is still live; it was left in place
    NotTerminal,
    /// A removal for this call was already processed
    Duplicate,
    /// No call is tracked under the handle
    Unknown,
}

/// Effect of re-evaluating one call's table membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Untracked,
    Kept,
    Retained { immediate: bool },
    Removed,
}

/// Builder for [`CallRegistry`]
pub struct CallRegistryBuilder {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    telephony: Option<Arc<dyn TelephonyCommands>>,
    spam: Option<Arc<dyn SpamChecker>>,
    blocked: Option<Arc<dyn BlockedNumberChecker>>,
    call_log: Option<Arc<dyn CallLogSink>>,
    enriched: Option<Arc<dyn EnrichedCallRegistrar>>,
    video_factories: Vec<Arc<dyn VideoStrategyFactory>>,
}

impl CallRegistryBuilder {
    fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            telephony: None,
            spam: None,
            blocked: None,
            call_log: None,
            enriched: None,
            video_factories: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sink for commands issued on calls; entities only keep a weak reference
    pub fn with_telephony(mut self, telephony: Arc<dyn TelephonyCommands>) -> Self {
        self.telephony = Some(telephony);
        self
    }

    pub fn with_spam_checker(mut self, checker: Arc<dyn SpamChecker>) -> Self {
        self.spam = Some(checker);
        self
    }

    pub fn with_blocked_number_checker(mut self, checker: Arc<dyn BlockedNumberChecker>) -> Self {
        self.blocked = Some(checker);
        self
    }

    pub fn with_call_log(mut self, sink: Arc<dyn CallLogSink>) -> Self {
        self.call_log = Some(sink);
        self
    }

    pub fn with_enriched_calls(mut self, registrar: Arc<dyn EnrichedCallRegistrar>) -> Self {
        self.enriched = Some(registrar);
        self
    }

    /// Add a video transport; earlier registrations win
    pub fn with_video_strategy(mut self, factory: Arc<dyn VideoStrategyFactory>) -> Self {
        self.video_factories.push(factory);
        self
    }

    pub fn build(self) -> Result<CallRegistry> {
        self.config.validate()?;

        let spam = self.spam.filter(|_| self.config.spam_check_enabled);
        let blocked = self.blocked.filter(|_| self.config.block_check_enabled);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Ok(CallRegistry {
            retention: RetentionScheduler::new(self.config.retention.clone()),
            bus: EventBus::new(self.config.event_channel_capacity),
            config: self.config,
            clock: self.clock,
            calls: IndexMap::new(),
            by_handle: HashMap::new(),
            telephony: self.telephony,
            video_factories: self.video_factories,
            classifier: ClassificationDispatcher::new(spam, blocked, results_tx),
            classification_rx: Some(results_rx),
            call_log: self.call_log,
            enriched: self.enriched,
            last_outgoing_emergency_at: None,
            hidden_counter: 0,
        })
    }
}

/// The table of every call the in-call UI knows about
pub struct CallRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    calls: IndexMap<CallId, CallEntity>,
    by_handle: HashMap<CallHandle, CallId>,
    retention: RetentionScheduler,
    bus: EventBus,
    telephony: Option<Arc<dyn TelephonyCommands>>,
    video_factories: Vec<Arc<dyn VideoStrategyFactory>>,
    classifier: ClassificationDispatcher,
    classification_rx: Option<mpsc::UnboundedReceiver<ClassificationResult>>,
    call_log: Option<Arc<dyn CallLogSink>>,
    enriched: Option<Arc<dyn EnrichedCallRegistrar>>,
    last_outgoing_emergency_at: Option<DateTime<Utc>>,
    hidden_counter: u32,
}

impl CallRegistry {
    pub fn builder(config: RegistryConfig) -> CallRegistryBuilder {
        CallRegistryBuilder::new(config)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn now(&self) -> (Instant, DateTime<Utc>) {
        (self.clock.now(), self.clock.wall_clock())
    }

    // ---- telephony input ----

    /// Route one telephony notification to the matching handler
    pub fn handle_telephony_event(&mut self, event: TelephonyEvent) {
        match event {
            TelephonyEvent::CallAdded { handle, snapshot } => {
                self.on_call_appeared(handle, &snapshot);
            }
            TelephonyEvent::CallUpdated { handle, snapshot } => {
                self.on_call_updated(&handle, &snapshot);
            }
            TelephonyEvent::CallRemoved { handle } => {
                self.on_call_disappeared(&handle);
            }
            TelephonyEvent::CallMadeExternal { handle } => {
                self.on_call_made_external(&handle);
            }
            TelephonyEvent::Connection { handle, event } => {
                self.on_connection_event(&handle, event);
            }
            TelephonyEvent::CannedResponsesLoaded { handle, responses } => {
                self.on_canned_responses_loaded(&handle, responses);
            }
            TelephonyEvent::Video { handle, event } => {
                self.on_video_event(&handle, event);
            }
            TelephonyEvent::ServiceLost => self.clear_on_telephony_service_lost(),
        }
    }

    /// Admit a call telephony has just reported
    ///
    /// Returns `None` if the first snapshot is already terminal; such calls are
    /// never admitted. A handle that is already tracked is treated as an update.
    pub fn on_call_appeared(
        &mut self,
        handle: CallHandle,
        snapshot: &CallSnapshot,
    ) -> Option<&CallEntity> {
        if let Some(id) = self.by_handle.get(&handle).copied() {
            warn!("{} appeared twice; treating as an update of {}", handle, id);
            self.on_call_updated(&handle, snapshot);
            return self.calls.get(&id);
        }

        let (now, wall) = self.now();
        let id = CallId::next();
        let strategies: Vec<Arc<dyn VideoStrategy>> = self
            .video_factories
            .iter()
            .map(|factory| factory.create(id, &handle))
            .collect();
        let mut call = CallEntity::new(
            id,
            handle.clone(),
            self.telephony.as_ref().map(Arc::downgrade),
            VideoCapabilityResolver::new(strategies),
            wall,
            now,
        );
        let links = self.resolve_links(snapshot);
        let change = call.apply_snapshot(snapshot, links, now, wall);
        if change.metadata_rejected {
            debug!("{} admitted without its metadata", id);
        }

        let state = call.state();
        if state == CallState::Disconnected || state.is_dead() {
            info!("Not admitting {} in state {}", handle, state);
            return None;
        }

        if call.is_hidden_number() {
            self.hidden_counter += 1;
            call.set_hidden_id(self.hidden_counter);
        }

        info!("Admitting {} as {} ({})", handle, id, state);
        self.calls.insert(id, call);
        self.by_handle.insert(handle, id);
        self.debug_check_indices();

        self.record_outgoing_emergency(id, wall);
        self.start_classification(id);
        if let (Some(enriched), Some(call)) = (&self.enriched, self.calls.get(&id)) {
            enriched.register(id, call.number());
        }

        if state.is_incoming() {
            self.notify_call(
                id,
                "incoming call",
                |listener, call| listener.on_incoming_call(call),
                |call| CallListEvent::IncomingCall { call },
            );
        } else {
            self.notify_generic();
        }
        self.calls.get(&id)
    }

    /// Apply a new snapshot for a tracked call
    pub fn on_call_updated(&mut self, handle: &CallHandle, snapshot: &CallSnapshot) {
        let Some(id) = self.by_handle.get(handle).copied() else {
            warn!("Update for unknown call {}; already retired or never admitted", handle);
            return;
        };
        let links = self.resolve_links(snapshot);
        let (now, wall) = self.now();
        let Some(call) = self.calls.get_mut(&id) else {
            return;
        };
        let change = call.apply_snapshot(snapshot, links, now, wall);
        self.record_outgoing_emergency(id, wall);
        self.after_entity_change(id, change);
    }

    fn after_entity_change(&mut self, id: CallId, change: EntityChange) {
        if let Some(call) = self.calls.get(&id) {
            call.notify_change(&change);
        }

        if change.became_disconnected() {
            if let Some(enriched) = &self.enriched {
                enriched.unregister(id);
            }
            let membership = self.update_call_in_map(id);
            if membership != Membership::Untracked {
                self.notify_call(
                    id,
                    "disconnect",
                    |listener, call| listener.on_disconnect(call),
                    |call| CallListEvent::Disconnected { call },
                );
            }
            if membership == (Membership::Retained { immediate: true }) {
                self.finish_disconnected(id);
            }
        } else {
            if !change.state_held {
                self.update_call_in_map(id);
            }
            self.notify_generic();
        }
    }

    /// Telephony no longer tracks the call
    pub fn on_call_disappeared(&mut self, handle: &CallHandle) -> RemovalOutcome {
        let Some(id) = self.by_handle.get(handle).copied() else {
            warn!("Removal for unknown call {}; already retired", handle);
            return RemovalOutcome::Unknown;
        };
        if !self.log_call_once(id) {
            warn!("Duplicate removal for {}; ignoring", id);
            return RemovalOutcome::Duplicate;
        }
        if let Some(enriched) = &self.enriched {
            enriched.unregister(id);
        }

        let state = self.calls.get(&id).map(CallEntity::state).unwrap_or_default();
        let outcome = match state {
            CallState::Disconnected => {
                if !self.retention.is_pending(id) {
                    self.update_call_in_map(id);
                }
                RemovalOutcome::Retained
            }
            state if state.is_terminal() => {
                self.remove_entity(id);
                self.notify_generic();
                RemovalOutcome::Removed
            }
            state => {
                warn!("Removing call not previously disconnected: {} in {}", id, state);
                RemovalOutcome::NotTerminal
            }
        };

        if !self.has_live_call() {
            self.hidden_counter = 0;
        }
        outcome
    }

    /// The call moved to another device; drop it without a state change
    pub fn on_call_made_external(&mut self, handle: &CallHandle) {
        let Some(id) = self.by_handle.get(handle).copied() else {
            warn!("{} made external but not tracked", handle);
            return;
        };
        info!("{} moved to another device", id);
        self.log_call_once(id);
        if let Some(enriched) = &self.enriched {
            enriched.unregister(id);
        }
        self.remove_entity(id);
    }

    pub fn on_connection_event(&mut self, handle: &CallHandle, event: ConnectionEvent) {
        let Some(id) = self.by_handle.get(handle).copied() else {
            debug!("{:?} for unknown call {}", event, handle);
            return;
        };
        debug!("{} connection event {:?}", id, event);
        match event {
            ConnectionEvent::MergeStart
            | ConnectionEvent::MergeComplete
            | ConnectionEvent::MergeFailed => {
                if let Some(call) = self.calls.get_mut(&id) {
                    call.set_merge_in_process(event == ConnectionEvent::MergeStart);
                }
                self.on_entity_updated(id);
            }
            ConnectionEvent::RemotelyHeld | ConnectionEvent::RemotelyUnheld => {
                if let Some(call) = self.calls.get_mut(&id) {
                    call.set_remotely_held(event == ConnectionEvent::RemotelyHeld);
                }
                self.on_entity_updated(id);
            }
            ConnectionEvent::CallForwarded => {
                if let Some(call) = self.calls.get_mut(&id) {
                    call.mark_forwarded();
                }
                self.on_entity_updated(id);
            }
            ConnectionEvent::HandoverFromLteToWifi => {
                if self.calls.get_mut(&id).is_some_and(CallEntity::mark_lte_to_wifi_logged) {
                    info!("{} handed over from LTE to WiFi", id);
                }
            }
            ConnectionEvent::HandoverFromWifiToLte => {
                if let Some(call) = self.calls.get(&id) {
                    call.notify("wifi to lte handover", |listener| {
                        listener.on_wifi_to_lte_handover(call)
                    });
                }
                self.notify_call(
                    id,
                    "wifi to lte handover",
                    |listener, call| listener.on_wifi_to_lte_handover(call),
                    |call| CallListEvent::WifiToLteHandover { call },
                );
            }
            ConnectionEvent::HandoverToWifiFailed => {
                if let Some(call) = self.calls.get(&id) {
                    call.notify("handover to wifi failed", |listener| {
                        listener.on_handover_to_wifi_failed(call)
                    });
                }
                self.notify_call(
                    id,
                    "handover to wifi failed",
                    |listener, call| listener.on_handover_to_wifi_failed(call),
                    |call| CallListEvent::HandoverToWifiFailed { call },
                );
            }
            ConnectionEvent::InternationalCallOnWifi => {
                if let Some(call) = self.calls.get(&id) {
                    call.notify("international call on wifi", |listener| {
                        listener.on_international_call_on_wifi(call)
                    });
                }
                self.notify_call(
                    id,
                    "international call on wifi",
                    |listener, call| listener.on_international_call_on_wifi(call),
                    |call| CallListEvent::InternationalCallOnWifi { call },
                );
            }
        }
    }

    pub fn on_canned_responses_loaded(&mut self, handle: &CallHandle, responses: Vec<String>) {
        let Some(id) = self.by_handle.get(handle).copied() else {
            debug!("Canned responses for unknown call {}", handle);
            return;
        };
        if let Some(call) = self.calls.get_mut(&id) {
            call.set_canned_responses(responses);
        }
        if let Some(call) = self.calls.get(&id) {
            call.notify("canned responses loaded", |listener| {
                listener.on_canned_responses_loaded(call)
            });
        }
    }

    pub fn on_video_event(&mut self, handle: &CallHandle, event: VideoEvent) {
        let Some(id) = self.by_handle.get(handle).copied() else {
            debug!("{:?} for unknown call {}", event, handle);
            return;
        };
        match event {
            VideoEvent::TechStateChanged => self.on_entity_updated(id),
            VideoEvent::SessionModificationChanged { state } => {
                debug!("{} session modification {:?}", id, state);
                if let Some(call) = self.calls.get(&id) {
                    call.notify("session modification state change", |listener| {
                        listener.on_session_modification_state_change(call)
                    });
                }
                self.notify_call(
                    id,
                    "session modification state change",
                    |listener, call| listener.on_session_modification_state_change(call),
                    |call| CallListEvent::SessionModificationStateChanged { call, state },
                );
            }
            VideoEvent::UpgradeRequestReceived => {
                info!("{} received an upgrade to video request", id);
                self.on_entity_updated(id);
                if let Some(call) = self.calls.get(&id) {
                    call.notify("upgrade to video", |listener| listener.on_upgrade_to_video(call));
                }
                self.notify_call(
                    id,
                    "upgrade to video",
                    |listener, call| listener.on_upgrade_to_video(call),
                    |call| CallListEvent::UpgradeToVideo { call },
                );
            }
        }
    }

    /// Telephony went away; nothing it tracked can still be live
    pub fn clear_on_telephony_service_lost(&mut self) {
        let (now, wall) = self.now();
        let ids: Vec<CallId> = self.calls.keys().copied().collect();
        for id in ids {
            let Some(call) = self.calls.get_mut(&id) else {
                continue;
            };
            if matches!(
                call.state(),
                CallState::Idle | CallState::Invalid | CallState::Disconnected
            ) {
                continue;
            }
            call.force_state(CallState::Disconnected, now, wall);
            call.set_disconnect_cause(
                DisconnectCause::new(DisconnectCode::Unknown).with_reason("telephony service lost"),
            );
            if let Some(enriched) = &self.enriched {
                enriched.unregister(id);
            }
            self.update_call_in_map(id);
        }
        warn!("Telephony service lost; {} calls awaiting retirement", self.retention.len());
        self.notify_generic();
    }

    // ---- classification ----

    fn start_classification(&self, id: CallId) {
        let Some(call) = self.calls.get(&id) else {
            return;
        };
        let Some(number) = call.number().filter(|number| !number.is_empty()) else {
            return;
        };
        let country_iso = call
            .country_iso()
            .or(self.config.default_country_iso.as_deref());
        self.classifier.dispatch_spam(id, number, country_iso);
        self.classifier.dispatch_blocked(id, number, country_iso);
    }

    /// Merge a finished lookup into its call; `true` if anything changed
    ///
    /// Results for calls that have already been retired are dropped.
    pub fn apply_classification(&mut self, result: ClassificationResult) -> bool {
        let wall = self.clock.wall_clock();
        let window = self.config.emergency_callback_window();
        let last_emergency = self.last_outgoing_emergency_at;
        let Some(call) = self.calls.get_mut(&result.call_id) else {
            debug!(
                "Dropping {:?} for retired {}",
                result.classification, result.call_id
            );
            return false;
        };
        let emergency_callback = call.is_potential_emergency_callback(wall, window, last_emergency);
        if !call.apply_classification(result.classification, emergency_callback) {
            return false;
        }
        debug!("{} classified {:?}", result.call_id, result.classification);
        self.on_entity_updated(result.call_id);
        true
    }

    /// Apply every classification result that has already arrived
    pub fn drain_classification_results(&mut self) -> usize {
        let mut results = Vec::new();
        if let Some(rx) = self.classification_rx.as_mut() {
            while let Ok(result) = rx.try_recv() {
                results.push(result);
            }
        }
        let count = results.len();
        for result in results {
            self.apply_classification(result);
        }
        count
    }

    /// Hand the classification receiver to the task that owns the registry
    pub fn take_classification_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ClassificationResult>> {
        self.classification_rx.take()
    }

    // ---- retention ----

    /// Retire every call whose retention has expired
    pub fn fire_due_retentions(&mut self) -> usize {
        let due = self.retention.take_due(self.clock.now());
        let count = due.len();
        for id in due {
            self.finish_disconnected(id);
        }
        count
    }

    /// The user dismissed the error dialog; retire every disconnected call now
    pub fn on_error_dialog_dismissed(&mut self) {
        let pending = self.retention.drain_all();
        if !pending.is_empty() {
            info!("Dismissing {} disconnected calls", pending.len());
        }
        for id in pending {
            self.finish_disconnected(id);
        }
    }

    pub fn next_retention_deadline(&self) -> Option<Instant> {
        self.retention.next_deadline()
    }

    pub fn is_retention_pending(&self, id: CallId) -> bool {
        self.retention.is_pending(id)
    }

    fn finish_disconnected(&mut self, id: CallId) {
        self.retention.cancel(id);
        let (now, wall) = self.now();
        let Some(call) = self.calls.get_mut(&id) else {
            return;
        };
        debug!("Retention expired for {}", id);
        call.force_state(CallState::Idle, now, wall);
        self.update_call_in_map(id);
        self.notify_generic();
    }

    // ---- table membership ----

    fn update_call_in_map(&mut self, id: CallId) -> Membership {
        let Some(call) = self.calls.get(&id) else {
            return Membership::Untracked;
        };
        let state = call.state();
        let code = call.disconnect_cause().code;
        if state == CallState::Disconnected {
            let delay = self.retention.delay_for(code);
            self.retention.schedule(id, code, self.clock.now());
            Membership::Retained {
                immediate: delay.is_zero(),
            }
        } else if state.is_dead() {
            self.remove_entity(id);
            Membership::Removed
        } else {
            if self.retention.cancel(id) {
                warn!("{} left Disconnected with retention pending; timer cancelled", id);
            }
            Membership::Kept
        }
    }

    fn remove_entity(&mut self, id: CallId) {
        self.log_call_once(id);
        self.retention.cancel(id);
        let Some(call) = self.calls.shift_remove(&id) else {
            return;
        };
        self.by_handle.remove(call.handle());
        self.debug_check_indices();
        call.dispatch_removed_from_registry();
        info!("Retired {} ({})", id, call.handle());
        if !self.has_live_call() {
            self.hidden_counter = 0;
        }
        self.bus.publish(CallListEvent::Retired {
            call_id: id,
            handle: call.handle().clone(),
        });
    }

    /// Hand the call to the call log unless it already was
    fn log_call_once(&mut self, id: CallId) -> bool {
        let Some(call) = self.calls.get_mut(&id) else {
            return false;
        };
        if !call.mark_logged() {
            return false;
        }
        if let Some(sink) = &self.call_log {
            sink.log_call(call);
        }
        true
    }

    fn resolve_links(&self, snapshot: &CallSnapshot) -> ConferenceLinks {
        ConferenceLinks {
            parent_id: snapshot
                .parent
                .as_ref()
                .and_then(|parent| self.by_handle.get(parent).copied()),
            child_ids: snapshot
                .children
                .iter()
                .filter_map(|child| self.by_handle.get(child).copied())
                .collect(),
        }
    }

    fn record_outgoing_emergency(&mut self, id: CallId, wall: DateTime<Utc>) {
        let Some(call) = self.calls.get(&id) else {
            return;
        };
        if call.is_emergency() == Some(true)
            && call.is_outgoing() == Some(true)
            && !call.state().is_terminal()
        {
            self.last_outgoing_emergency_at = Some(wall);
        }
    }

    fn debug_check_indices(&self) {
        debug_assert_eq!(self.calls.len(), self.by_handle.len());
        debug_assert!(
            self.by_handle
                .iter()
                .all(|(handle, id)| self.calls.get(id).is_some_and(|call| call.handle() == handle))
        );
    }

    // ---- listeners ----

    /// Register a listener and bring it up to date with one synthetic update
    ///
    /// Adding a listener that is already registered has no effect.
    pub fn add_listener(&mut self, listener: Arc<dyn CallListListener>) -> bool {
        if !self.bus.add_listener(Arc::clone(&listener)) {
            return false;
        }
        invoke_isolated("call list change", || listener.on_call_list_change(self));
        true
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn CallListListener>) -> bool {
        self.bus.remove_listener(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.bus.listener_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallListEvent> {
        self.bus.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CallListEvent> {
        self.bus.sender()
    }

    pub fn add_call_listener(
        &mut self,
        id: CallId,
        listener: Arc<dyn CallEntityListener>,
    ) -> Result<bool> {
        let call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))?;
        Ok(call.add_listener(listener))
    }

    pub fn remove_call_listener(
        &mut self,
        id: CallId,
        listener: &Arc<dyn CallEntityListener>,
    ) -> Result<bool> {
        let call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))?;
        Ok(call.remove_listener(listener))
    }

    fn on_entity_updated(&mut self, id: CallId) {
        if let Some(call) = self.calls.get(&id) {
            call.notify_update();
        }
        self.update_call_in_map(id);
        self.notify_generic();
    }

    fn notify_generic(&self) {
        self.bus
            .notify("call list change", |listener| listener.on_call_list_change(self));
        self.bus.publish(CallListEvent::CallListChanged {
            calls: self.calls.values().map(CallSummary::from).collect(),
        });
    }

    fn notify_call(
        &self,
        id: CallId,
        event: &str,
        f: impl Fn(&dyn CallListListener, &CallEntity),
        to_event: impl FnOnce(CallSummary) -> CallListEvent,
    ) {
        let Some(call) = self.calls.get(&id) else {
            return;
        };
        self.bus.notify(event, |listener| f(listener, call));
        self.bus.publish(to_event(CallSummary::from(call)));
    }

    // ---- commands ----

    fn require(&self, id: CallId) -> Result<&CallEntity> {
        self.calls
            .get(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))
    }

    pub fn answer_call(&self, id: CallId, video_state: crate::types::VideoState) -> Result<()> {
        self.require(id)?.answer(video_state)
    }

    pub fn reject_call(&self, id: CallId, with_message: bool, message: Option<&str>) -> Result<()> {
        self.require(id)?.reject(with_message, message)
    }

    pub fn hold_call(&self, id: CallId) -> Result<()> {
        self.require(id)?.hold()
    }

    pub fn unhold_call(&self, id: CallId) -> Result<()> {
        self.require(id)?.unhold()
    }

    /// Hang up; the call shows as disconnecting until telephony confirms
    pub fn disconnect_call(&mut self, id: CallId) -> Result<()> {
        let (now, wall) = self.now();
        let call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))?;
        call.disconnect(now, wall)?;
        self.update_call_in_map(id);
        self.notify_generic();
        Ok(())
    }

    /// Reject the call and pin it in `Blocked` whatever telephony reports next
    pub fn block_call(&mut self, id: CallId) -> Result<()> {
        let (now, wall) = self.now();
        let call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))?;
        call.block(now, wall)?;
        self.on_entity_updated(id);
        Ok(())
    }

    /// Move a call into one of the states telephony never reports
    ///
    /// `CallWaiting` is reachable from `Incoming`, `Redialing` from `Dialing`.
    pub fn set_local_state(&mut self, id: CallId, state: CallState) -> Result<()> {
        let (now, wall) = self.now();
        let call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| RegistryError::call_not_found(id))?;
        let allowed = matches!(
            (call.state(), state),
            (CallState::Incoming, CallState::CallWaiting) | (CallState::Dialing, CallState::Redialing)
        );
        if !allowed {
            return Err(RegistryError::invalid_state(format!(
                "{} cannot move from {} to {}",
                id,
                call.state(),
                state
            )));
        }
        call.force_state(state, now, wall);
        self.on_entity_updated(id);
        Ok(())
    }

    pub fn notify_calls_of_device_rotation(&self, rotation: u32) {
        for call in self.calls.values() {
            call.dispatch_device_orientation(rotation);
        }
    }

    // ---- queries ----

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn call(&self, id: CallId) -> Option<&CallEntity> {
        self.calls.get(&id)
    }

    pub fn call_by_handle(&self, handle: &CallHandle) -> Option<&CallEntity> {
        self.by_handle.get(handle).and_then(|id| self.calls.get(id))
    }

    /// Every tracked call, in admission order
    pub fn all_calls(&self) -> impl Iterator<Item = &CallEntity> {
        self.calls.values()
    }

    /// The `nth` call (0-based, admission order) whose current state is `state`
    pub fn call_with_state(&self, state: CallState, nth: usize) -> Option<&CallEntity> {
        self.calls
            .values()
            .filter(|call| call.current_state() == state)
            .nth(nth)
    }

    pub fn first_call_with_state(&self, state: CallState) -> Option<&CallEntity> {
        self.call_with_state(state, 0)
    }

    pub fn call_with_state_and_number(&self, state: CallState, number: &str) -> Option<&CallEntity> {
        self.calls
            .values()
            .find(|call| call.current_state() == state && call.number() == Some(number))
    }

    pub fn incoming_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Incoming)
            .or_else(|| self.first_call_with_state(CallState::CallWaiting))
    }

    pub fn pending_outgoing_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Connecting)
    }

    pub fn outgoing_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Dialing)
            .or_else(|| self.first_call_with_state(CallState::Redialing))
            .or_else(|| self.first_call_with_state(CallState::Pulling))
    }

    pub fn active_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Active)
    }

    pub fn second_active_call(&self) -> Option<&CallEntity> {
        self.call_with_state(CallState::Active, 1)
    }

    pub fn background_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::OnHold)
    }

    pub fn second_background_call(&self) -> Option<&CallEntity> {
        self.call_with_state(CallState::OnHold, 1)
    }

    pub fn disconnected_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Disconnected)
    }

    pub fn disconnecting_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::Disconnecting)
    }

    pub fn waiting_for_account_call(&self) -> Option<&CallEntity> {
        self.first_call_with_state(CallState::SelectAccount)
    }

    pub fn incoming_or_active(&self) -> Option<&CallEntity> {
        self.incoming_call().or_else(|| self.active_call())
    }

    pub fn outgoing_or_active(&self) -> Option<&CallEntity> {
        self.outgoing_call().or_else(|| self.active_call())
    }

    pub fn active_or_background_call(&self) -> Option<&CallEntity> {
        self.active_call().or_else(|| self.background_call())
    }

    /// The call the main screen should show when there are several
    pub fn first_call(&self) -> Option<&CallEntity> {
        self.incoming_call()
            .or_else(|| self.pending_outgoing_call())
            .or_else(|| self.outgoing_call())
            .or_else(|| self.active_call())
            .or_else(|| self.disconnecting_call())
            .or_else(|| self.disconnected_call())
    }

    /// Some call is neither ending nor ended
    pub fn has_live_call(&self) -> bool {
        let Some(first) = self.first_call() else {
            return false;
        };
        !matches!(
            first.current_state(),
            CallState::Disconnecting | CallState::Disconnected
        )
    }

    pub fn video_upgrade_request_call(&self) -> Option<&CallEntity> {
        self.calls.values().find(|call| {
            call.session_modification_state() == SessionModificationState::ReceivedUpgradeToVideoRequest
        })
    }

    /// An active, held or conferenced call that never hosted a conference
    pub fn has_non_parent_active_or_background_call(&self) -> bool {
        self.calls.values().any(|call| {
            matches!(
                call.current_state(),
                CallState::Active | CallState::OnHold | CallState::Conferenced
            ) && call.log_state().conferenced_calls == 0
        })
    }

    /// Withheld callers seen since the registry last had no live call
    pub fn hidden_counter(&self) -> u32 {
        self.hidden_counter
    }

    /// Display name for a call, numbered when several withheld callers exist
    pub fn display_name(&self, id: CallId, name: &str) -> Option<String> {
        self.calls
            .get(&id)
            .map(|call| call.name_if_restricted(name, self.hidden_counter))
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("calls", &self.calls.values().collect::<Vec<_>>())
            .field("pending_retention", &self.retention.len())
            .field("listeners", &self.bus.listener_count())
            .finish_non_exhaustive()
    }
}
