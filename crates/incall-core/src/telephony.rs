//! Seams to the collaborators around the registry
//!
//! The telephony stack places and receives calls; this crate only observes it
//! through [`TelephonyEvent`]s and steers it through [`TelephonyCommands`].
//! Call history and enriched-call session management are reached through
//! [`CallLogSink`] and [`EnrichedCallRegistrar`].

use serde::{Deserialize, Serialize};

use crate::entity::CallEntity;
use crate::types::{AccountHandle, CallHandle, CallId, CallSnapshot, VideoState};
use crate::video::VideoEvent;

/// Commands the registry may issue to telephony for one call
///
/// Commands are fire-and-forget. Their effect is confirmed by the next
/// [`TelephonyEvent::CallUpdated`] for the same handle.
pub trait TelephonyCommands: Send + Sync {
    fn answer(&self, handle: &CallHandle, video_state: VideoState);

    fn reject(&self, handle: &CallHandle, with_message: bool, message: Option<&str>);

    fn hold(&self, handle: &CallHandle);

    fn unhold(&self, handle: &CallHandle);

    fn disconnect(&self, handle: &CallHandle);

    fn merge_conference(&self, handle: &CallHandle);

    fn split_from_conference(&self, handle: &CallHandle);

    fn play_dtmf_tone(&self, handle: &CallHandle, digit: char);

    fn stop_dtmf_tone(&self, handle: &CallHandle);

    fn phone_account_selected(&self, handle: &CallHandle, account: &AccountHandle, set_default: bool);
}

/// Sink that records finished calls in the call history
pub trait CallLogSink: Send + Sync {
    /// Called exactly once per call, when it leaves the registry
    fn log_call(&self, call: &CallEntity);
}

/// Per-call capability and session listeners for enriched calling
pub trait EnrichedCallRegistrar: Send + Sync {
    fn register(&self, call_id: CallId, number: Option<&str>);

    fn unregister(&self, call_id: CallId);
}

/// Out-of-band connection events raised by telephony for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    MergeStart,
    MergeComplete,
    MergeFailed,
    /// Call moved from WiFi calling to the cellular network
    HandoverFromWifiToLte,
    /// Call moved from the cellular network to WiFi calling
    HandoverFromLteToWifi,
    HandoverToWifiFailed,
    RemotelyHeld,
    RemotelyUnheld,
    InternationalCallOnWifi,
    CallForwarded,
}

/// Everything telephony can push into the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelephonyEvent {
    CallAdded {
        handle: CallHandle,
        snapshot: CallSnapshot,
    },
    CallUpdated {
        handle: CallHandle,
        snapshot: CallSnapshot,
    },
    CallRemoved {
        handle: CallHandle,
    },
    /// The call now lives on another device
    CallMadeExternal {
        handle: CallHandle,
    },
    Connection {
        handle: CallHandle,
        event: ConnectionEvent,
    },
    CannedResponsesLoaded {
        handle: CallHandle,
        responses: Vec<String>,
    },
    Video {
        handle: CallHandle,
        event: VideoEvent,
    },
    /// The telephony service itself went away
    ServiceLost,
}

impl TelephonyEvent {
    pub fn handle(&self) -> Option<&CallHandle> {
        match self {
            TelephonyEvent::CallAdded { handle, .. }
            | TelephonyEvent::CallUpdated { handle, .. }
            | TelephonyEvent::CallRemoved { handle }
            | TelephonyEvent::CallMadeExternal { handle }
            | TelephonyEvent::Connection { handle, .. }
            | TelephonyEvent::CannedResponsesLoaded { handle, .. }
            | TelephonyEvent::Video { handle, .. } => Some(handle),
            TelephonyEvent::ServiceLost => None,
        }
    }
}
