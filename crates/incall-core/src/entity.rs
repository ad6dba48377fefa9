//! One tracked call
//!
//! A [`CallEntity`] is created by the registry when telephony reports a new
//! call and is mutated only on the registry's owner task. It translates raw
//! snapshots into [`CallState`], records timing and classification results,
//! keeps the decoded metadata, and notifies its own [`CallEntityListener`]s.
//!
//! Each accepted snapshot produces exactly one of `on_call_disconnect` (the
//! call has just become disconnected) or `on_call_update`. Metadata changes
//! fire their narrower callbacks first.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::classification::{Classification, ClassificationFlags};
use crate::error::{RegistryError, Result};
use crate::events::{CallEntityListener, ListenerSet};
use crate::extras::CallExtras;
use crate::state::{CallState, next_state, translate};
use crate::telephony::TelephonyCommands;
use crate::types::{
    AccountHandle, CallCapabilities, CallHandle, CallId, CallProperties, CallSnapshot,
    DisconnectCause, DisconnectCode, NumberPresentation, VideoState,
};
use crate::video::{SessionModificationState, VideoCapabilityResolver, VideoStrategy};

static UNKNOWN_CAUSE: DisconnectCause = DisconnectCause {
    code: DisconnectCode::Unknown,
    label: None,
    reason: None,
};

/// What the call history needs to know about a call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLogState {
    pub is_incoming: bool,
    /// Set once the call has been handed to the call log
    pub is_logged: bool,
    /// Largest number of conference children seen at any point
    pub conferenced_calls: usize,
    pub disconnect_cause: DisconnectCode,
    /// Time from connect to disconnect; zero if the call never connected
    pub call_duration: Duration,
    /// Time from creation to disconnect
    pub lifetime: Duration,
}

/// Conference links resolved from handles by the registry
#[derive(Debug, Clone, Default)]
pub(crate) struct ConferenceLinks {
    pub parent_id: Option<CallId>,
    pub child_ids: Vec<CallId>,
}

/// Effect of one snapshot on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityChange {
    pub previous_state: CallState,
    pub state: CallState,
    pub child_number_changed: bool,
    pub last_forwarded_changed: bool,
    /// The metadata blob was malformed and ignored
    pub metadata_rejected: bool,
    /// The snapshot's raw state was ignored because the call is blocked or
    /// already disconnected
    pub state_held: bool,
}

impl EntityChange {
    fn unchanged(state: CallState) -> Self {
        Self {
            previous_state: state,
            state,
            child_number_changed: false,
            last_forwarded_changed: false,
            metadata_rejected: false,
            state_held: false,
        }
    }

    pub fn state_changed(&self) -> bool {
        self.previous_state != self.state
    }

    /// The call has just become disconnected
    pub fn became_disconnected(&self) -> bool {
        self.state_changed() && self.state == CallState::Disconnected
    }
}

pub struct CallEntity {
    id: CallId,
    unique_id: Uuid,
    handle: CallHandle,
    telephony: Option<Weak<dyn TelephonyCommands>>,

    state: CallState,
    disconnect_cause: DisconnectCause,
    number: Option<String>,
    presentation: NumberPresentation,
    country_iso: Option<String>,
    account: Option<AccountHandle>,
    capabilities: CallCapabilities,
    properties: CallProperties,
    video_state: VideoState,
    conferenceable_calls: usize,

    created_at: DateTime<Utc>,
    created_instant: Instant,
    connected_at: Option<DateTime<Utc>>,
    connected_instant: Option<Instant>,

    classification: ClassificationFlags,
    is_emergency: Option<bool>,
    is_outgoing: Option<bool>,

    parent_handle: Option<CallHandle>,
    parent_id: Option<CallId>,
    child_ids: Vec<CallId>,

    child_number: Option<String>,
    last_forwarded_number: Option<String>,
    call_subject: Option<String>,
    last_emergency_callback_millis: Option<i64>,
    answering_drops_foreground_call: bool,
    canned_responses: Option<Vec<String>>,

    remotely_held: bool,
    merge_in_process: bool,
    call_forwarded: bool,
    lte_to_wifi_logged: bool,
    hidden_id: u32,

    log_state: CallLogState,
    video: VideoCapabilityResolver,
    listeners: ListenerSet<dyn CallEntityListener>,
}

impl CallEntity {
    /// A new entity in state `Invalid`, before its first snapshot
    pub fn new(
        id: CallId,
        handle: CallHandle,
        telephony: Option<Weak<dyn TelephonyCommands>>,
        video: VideoCapabilityResolver,
        created_at: DateTime<Utc>,
        created_instant: Instant,
    ) -> Self {
        Self {
            id,
            unique_id: Uuid::new_v4(),
            handle,
            telephony,
            state: CallState::Invalid,
            disconnect_cause: DisconnectCause::unknown(),
            number: None,
            presentation: NumberPresentation::Allowed,
            country_iso: None,
            account: None,
            capabilities: CallCapabilities::empty(),
            properties: CallProperties::empty(),
            video_state: VideoState::AUDIO_ONLY,
            conferenceable_calls: 0,
            created_at,
            created_instant,
            connected_at: None,
            connected_instant: None,
            classification: ClassificationFlags::default(),
            is_emergency: None,
            is_outgoing: None,
            parent_handle: None,
            parent_id: None,
            child_ids: Vec::new(),
            child_number: None,
            last_forwarded_number: None,
            call_subject: None,
            last_emergency_callback_millis: None,
            answering_drops_foreground_call: false,
            canned_responses: None,
            remotely_held: false,
            merge_in_process: false,
            call_forwarded: false,
            lte_to_wifi_logged: false,
            hidden_id: 0,
            log_state: CallLogState::default(),
            video,
            listeners: ListenerSet::new(),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Random id used to correlate this call with external records
    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    /// Stored state, ignoring conference membership
    pub fn state(&self) -> CallState {
        self.state
    }

    /// State as observers see it: `Conferenced` whenever the call has a parent
    pub fn current_state(&self) -> CallState {
        if self.parent_handle.is_some() {
            CallState::Conferenced
        } else {
            self.state
        }
    }

    /// The disconnect cause, once the call has ended
    pub fn disconnect_cause(&self) -> &DisconnectCause {
        match self.state {
            CallState::Disconnected | CallState::Idle => &self.disconnect_cause,
            _ => &UNKNOWN_CAUSE,
        }
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn presentation(&self) -> NumberPresentation {
        self.presentation
    }

    pub fn country_iso(&self) -> Option<&str> {
        self.country_iso.as_deref()
    }

    pub fn account(&self) -> Option<&AccountHandle> {
        self.account.as_ref()
    }

    pub fn capabilities(&self) -> CallCapabilities {
        self.capabilities
    }

    pub fn properties(&self) -> CallProperties {
        self.properties
    }

    pub fn video_state(&self) -> VideoState {
        self.video_state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Time since the call first became active
    pub fn connected_duration(&self, now: Instant) -> Option<Duration> {
        self.connected_instant
            .map(|connected| now.saturating_duration_since(connected))
    }

    pub fn classification(&self) -> ClassificationFlags {
        self.classification
    }

    /// Spam as shown to the user: a stored positive that still applies
    pub fn is_spam(&self) -> bool {
        self.classification.spam == Some(true) && self.current_state().is_incoming()
    }

    pub fn is_blocked(&self) -> bool {
        self.classification.blocked == Some(true)
    }

    pub fn is_emergency(&self) -> Option<bool> {
        self.is_emergency
    }

    pub fn is_outgoing(&self) -> Option<bool> {
        self.is_outgoing
    }

    pub fn is_conference(&self) -> bool {
        self.properties.contains(CallProperties::CONFERENCE)
    }

    pub fn is_conference_member(&self) -> bool {
        self.parent_handle.is_some()
    }

    pub fn parent_handle(&self) -> Option<&CallHandle> {
        self.parent_handle.as_ref()
    }

    pub fn parent_id(&self) -> Option<CallId> {
        self.parent_id
    }

    pub fn child_ids(&self) -> &[CallId] {
        &self.child_ids
    }

    pub fn child_number(&self) -> Option<&str> {
        self.child_number.as_deref()
    }

    pub fn last_forwarded_number(&self) -> Option<&str> {
        self.last_forwarded_number.as_deref()
    }

    pub fn call_subject(&self) -> Option<&str> {
        self.call_subject.as_deref()
    }

    pub fn answering_drops_foreground_call(&self) -> bool {
        self.answering_drops_foreground_call
    }

    pub fn canned_responses(&self) -> Option<&[String]> {
        self.canned_responses.as_deref()
    }

    pub fn is_remotely_held(&self) -> bool {
        self.remotely_held
    }

    pub fn is_merge_in_process(&self) -> bool {
        self.merge_in_process
    }

    pub fn was_forwarded(&self) -> bool {
        self.call_forwarded
    }

    pub fn log_state(&self) -> &CallLogState {
        &self.log_state
    }

    /// Whether the user may currently do everything in `capabilities`
    ///
    /// Merging is also allowed when telephony lists conferenceable peers,
    /// even without the merge capability bit.
    pub fn can(&self, capabilities: CallCapabilities) -> bool {
        let mut required = capabilities;
        if required.contains(CallCapabilities::MERGE_CONFERENCE) {
            if self.conferenceable_calls == 0
                && !self.capabilities.contains(CallCapabilities::MERGE_CONFERENCE)
            {
                return false;
            }
            required.remove(CallCapabilities::MERGE_CONFERENCE);
        }
        self.capabilities.contains(required)
    }

    /// Whether spam labelling must be suppressed for this call
    ///
    /// True when telephony reports emergency-callback mode, when metadata says
    /// an emergency callback was received within `window`, or when an
    /// outgoing emergency call was placed within `window`.
    pub fn is_potential_emergency_callback(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        last_outgoing_emergency: Option<DateTime<Utc>>,
    ) -> bool {
        if self.properties.contains(CallProperties::EMERGENCY_CALLBACK_MODE) {
            return true;
        }
        let window_millis = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let within_window = |at_millis: i64| now.timestamp_millis() - at_millis < window_millis;
        if let Some(at_millis) = self.last_emergency_callback_millis.filter(|millis| *millis > 0) {
            if within_window(at_millis) {
                return true;
            }
        }
        last_outgoing_emergency.is_some_and(|at| within_window(at.timestamp_millis()))
    }

    /// The selected video strategy, selecting one on first use
    pub fn video_tech(&self) -> Arc<dyn VideoStrategy> {
        self.video.resolve(self.number.as_deref(), self.account.as_ref())
    }

    pub fn session_modification_state(&self) -> SessionModificationState {
        self.video.session_modification_state()
    }

    pub fn is_video_call(&self) -> bool {
        self.video_state.is_video()
    }

    /// Append the hidden-caller counter to a display name
    ///
    /// Only applies to withheld numbers, and only once more than one of them
    /// has been seen since the registry last had no live call.
    pub fn name_if_restricted(&self, name: &str, hidden_counter: u32) -> String {
        if self.hidden_id != 0 && hidden_counter > 1 && self.is_hidden_number() {
            format!("{} {}", name, self.hidden_id)
        } else {
            name.to_string()
        }
    }

    pub fn hidden_id(&self) -> u32 {
        self.hidden_id
    }

    pub(crate) fn is_hidden_number(&self) -> bool {
        self.presentation.is_hidden() && self.number.as_deref().is_none_or(str::is_empty)
    }

    pub(crate) fn set_hidden_id(&mut self, hidden_id: u32) {
        self.hidden_id = hidden_id;
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CallEntityListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn CallEntityListener>) -> bool {
        self.listeners.remove(listener)
    }

    // ---- mutation, owner task only ----

    fn set_state(&mut self, state: CallState, now: Instant, wall: DateTime<Utc>) {
        if state == CallState::Incoming {
            self.log_state.is_incoming = true;
        }
        if state == self.state {
            if state == CallState::Disconnected {
                trace!("{} ignoring DISCONNECTED to DISCONNECTED", self.id);
            }
            return;
        }
        match state {
            CallState::Active if self.connected_instant.is_none() => {
                self.connected_instant = Some(now);
                self.connected_at = Some(wall);
            }
            CallState::Disconnected => {
                self.log_state.call_duration = self
                    .connected_instant
                    .map(|connected| now.saturating_duration_since(connected))
                    .unwrap_or_default();
                self.log_state.lifetime = now.saturating_duration_since(self.created_instant);
            }
            CallState::Dialing | CallState::Connecting => {
                self.is_outgoing = Some(true);
            }
            CallState::Incoming | CallState::CallWaiting => {
                self.is_outgoing.get_or_insert(false);
            }
            _ => {}
        }
        debug!("{} state {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    /// Force a state without a telephony snapshot
    pub(crate) fn force_state(&mut self, state: CallState, now: Instant, wall: DateTime<Utc>) {
        self.set_state(state, now, wall);
    }

    pub(crate) fn set_disconnect_cause(&mut self, cause: DisconnectCause) {
        self.log_state.disconnect_cause = cause.code;
        self.disconnect_cause = cause;
    }

    pub(crate) fn apply_snapshot(
        &mut self,
        snapshot: &CallSnapshot,
        links: ConferenceLinks,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> EntityChange {
        let mut change = EntityChange::unchanged(self.state);

        self.video
            .dispatch_call_state_changed(translate(snapshot.state), snapshot.account.as_ref());

        let next = next_state(self.state, snapshot.state);
        if next != translate(snapshot.state) {
            trace!("{} is {}; ignoring telephony {:?}", self.id, next, snapshot.state);
            change.state_held = true;
        } else {
            self.set_state(next, now, wall);
            self.set_disconnect_cause(snapshot.disconnect_cause.clone());
        }

        self.log_state.conferenced_calls = self.log_state.conferenced_calls.max(links.child_ids.len());
        self.child_ids = links.child_ids;
        self.parent_handle = snapshot.parent.clone();
        self.parent_id = links.parent_id;
        self.conferenceable_calls = snapshot.conferenceable.len();

        if let Some(blob) = &snapshot.extras {
            match CallExtras::parse(blob) {
                Ok(extras) => self.apply_extras(extras, &mut change),
                Err(e) => {
                    error!("Ignoring metadata for {}: {}", self.id, e);
                    change.metadata_rejected = true;
                }
            }
        }

        if self.number != snapshot.number || self.is_emergency.is_none() {
            self.number = snapshot.number.clone();
            self.is_emergency = Some(snapshot.emergency_number);
        }
        self.presentation = snapshot.presentation;
        if snapshot.country_iso.is_some() {
            self.country_iso = snapshot.country_iso.clone();
        }
        self.account = snapshot.account.clone();
        self.capabilities = snapshot.capabilities;
        self.properties = snapshot.properties;
        self.video_state = snapshot.video_state;

        change.state = self.state;
        change
    }

    fn apply_extras(&mut self, extras: CallExtras, change: &mut EntityChange) {
        if let Some(child_number) = extras.child_address.as_ref() {
            if self.child_number.as_ref() != Some(child_number) {
                self.child_number = Some(child_number.clone());
                change.child_number_changed = true;
            }
        }
        if let Some(forwarded) = extras.last_forwarded() {
            if self.last_forwarded_number.as_deref() != Some(forwarded) {
                self.last_forwarded_number = Some(forwarded.to_string());
                change.last_forwarded_changed = true;
            }
        }
        if extras.call_subject.is_some() {
            self.call_subject = extras.call_subject;
        }
        if extras.last_emergency_callback_time_millis.is_some() {
            self.last_emergency_callback_millis = extras.last_emergency_callback_time_millis;
        }
        if let Some(drops) = extras.answering_drops_foreground_call {
            self.answering_drops_foreground_call = drops;
        }
    }

    /// Merge one classification result; `true` if a flag changed
    pub(crate) fn apply_classification(
        &mut self,
        classification: Classification,
        potential_emergency_callback: bool,
    ) -> bool {
        let state = self.current_state();
        self.classification
            .merge(classification, state, potential_emergency_callback)
    }

    pub(crate) fn set_canned_responses(&mut self, responses: Vec<String>) {
        self.canned_responses = Some(responses);
    }

    pub(crate) fn set_remotely_held(&mut self, held: bool) {
        self.remotely_held = held;
    }

    pub(crate) fn set_merge_in_process(&mut self, in_process: bool) {
        self.merge_in_process = in_process;
    }

    pub(crate) fn mark_forwarded(&mut self) {
        self.call_forwarded = true;
    }

    /// Returns `true` the first time only
    pub(crate) fn mark_lte_to_wifi_logged(&mut self) -> bool {
        !std::mem::replace(&mut self.lte_to_wifi_logged, true)
    }

    /// Returns `true` the first time only
    pub(crate) fn mark_logged(&mut self) -> bool {
        !std::mem::replace(&mut self.log_state.is_logged, true)
    }

    pub(crate) fn dispatch_removed_from_registry(&self) {
        self.video.dispatch_removed_from_registry();
    }

    pub(crate) fn dispatch_device_orientation(&self, rotation: u32) {
        self.video.dispatch_device_orientation(rotation);
    }

    // ---- notifications ----

    /// Fan out the per-entity callbacks for one snapshot
    pub(crate) fn notify_change(&self, change: &EntityChange) {
        if change.child_number_changed {
            self.listeners
                .for_each("child number change", |listener| listener.on_child_number_change(self));
        }
        if change.last_forwarded_changed {
            self.listeners.for_each("last forwarded number change", |listener| {
                listener.on_last_forwarded_number_change(self)
            });
        }
        if change.became_disconnected() {
            self.listeners
                .for_each("call disconnect", |listener| listener.on_call_disconnect(self));
        } else {
            self.notify_update();
        }
    }

    pub(crate) fn notify_update(&self) {
        self.listeners
            .for_each("call update", |listener| listener.on_call_update(self));
    }

    pub(crate) fn notify(&self, event: &str, f: impl Fn(&dyn CallEntityListener)) {
        self.listeners.for_each(event, |listener| f(listener));
    }

    // ---- commands ----

    fn telephony(&self) -> Result<Arc<dyn TelephonyCommands>> {
        self.telephony
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RegistryError::telephony_unavailable(self.id))
    }

    pub fn answer(&self, video_state: VideoState) -> Result<()> {
        info!("Answering {} (video state {:#x})", self.id, video_state.bits());
        self.telephony()?.answer(&self.handle, video_state);
        Ok(())
    }

    pub fn reject(&self, with_message: bool, message: Option<&str>) -> Result<()> {
        if with_message && message.is_none_or(str::is_empty) {
            return Err(RegistryError::invalid_argument(
                "reject with message requires a message",
            ));
        }
        info!("Rejecting {}", self.id);
        self.telephony()?.reject(&self.handle, with_message, message);
        Ok(())
    }

    pub fn hold(&self) -> Result<()> {
        info!("Holding {}", self.id);
        self.telephony()?.hold(&self.handle);
        Ok(())
    }

    pub fn unhold(&self) -> Result<()> {
        info!("Unholding {}", self.id);
        self.telephony()?.unhold(&self.handle);
        Ok(())
    }

    pub fn merge_conference(&self) -> Result<()> {
        if !self.can(CallCapabilities::MERGE_CONFERENCE) {
            return Err(RegistryError::invalid_state(format!(
                "{} has nothing to merge with",
                self.id
            )));
        }
        info!("Merging {} into conference", self.id);
        self.telephony()?.merge_conference(&self.handle);
        Ok(())
    }

    pub fn split_from_conference(&self) -> Result<()> {
        info!("Splitting {} from conference", self.id);
        self.telephony()?.split_from_conference(&self.handle);
        Ok(())
    }

    pub fn play_dtmf_tone(&self, digit: char) -> Result<()> {
        if !is_dtmf_digit(digit) {
            return Err(RegistryError::invalid_argument(format!(
                "'{}' is not a DTMF digit",
                digit
            )));
        }
        self.telephony()?.play_dtmf_tone(&self.handle, digit);
        Ok(())
    }

    pub fn stop_dtmf_tone(&self) -> Result<()> {
        self.telephony()?.stop_dtmf_tone(&self.handle);
        Ok(())
    }

    pub fn phone_account_selected(&self, account: &AccountHandle, set_default: bool) -> Result<()> {
        info!("{} placed through {} (default: {})", self.id, account, set_default);
        self.telephony()?
            .phone_account_selected(&self.handle, account, set_default);
        Ok(())
    }

    /// Optimistically show the call as disconnecting, then ask telephony
    pub(crate) fn disconnect(&mut self, now: Instant, wall: DateTime<Utc>) -> Result<()> {
        let telephony = self.telephony()?;
        info!("Disconnecting {}", self.id);
        self.set_state(CallState::Disconnecting, now, wall);
        self.notify_update();
        telephony.disconnect(&self.handle);
        Ok(())
    }

    /// Reject the call and pin it in `Blocked`
    pub(crate) fn block(&mut self, now: Instant, wall: DateTime<Utc>) -> Result<()> {
        if self.state == CallState::Disconnected {
            return Err(RegistryError::invalid_state(format!(
                "{} has already disconnected",
                self.id
            )));
        }
        let telephony = self.telephony()?;
        info!("Blocking {}", self.id);
        telephony.reject(&self.handle, false, None);
        self.set_state(CallState::Blocked, now, wall);
        Ok(())
    }
}

fn is_dtmf_digit(digit: char) -> bool {
    digit.is_ascii_digit() || matches!(digit, '*' | '#' | 'A'..='D')
}

impl fmt::Debug for CallEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEntity")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.current_state())
            .field("disconnect_cause", &self.disconnect_cause.code)
            .field("classification", &self.classification)
            .field("parent_id", &self.parent_id)
            .field("child_ids", &self.child_ids)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CallEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, children:{:?}, parent:{:?}, conferenceable:{}, video:{:#x}]",
            self.id,
            self.current_state(),
            self.child_ids,
            self.parent_id,
            self.conferenceable_calls,
            self.video_state.bits()
        )
    }
}
