//! Application-level call state machine
//!
//! Telephony states are translated through a fixed, total mapping. The only
//! exception is [`CallState::Blocked`]: once local policy has rejected a call,
//! late telephony snapshots must not bring it back to life. That exception is a
//! single guard clause in [`next_state`] so the table itself stays testable in
//! isolation.
//!
//! [`CallState::Conferenced`] is never produced here. It is computed at query
//! time from whether the call currently has a parent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::RawCallState;

/// State of a call as seen by the in-call UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Before the first telephony snapshot, or an unrecognised raw state
    #[default]
    Invalid,
    Connecting,
    /// Waiting for the user to choose an origination account
    SelectAccount,
    Dialing,
    Redialing,
    /// Being transferred onto this device from elsewhere
    Pulling,
    Incoming,
    CallWaiting,
    Active,
    OnHold,
    Conferenced,
    Disconnecting,
    Disconnected,
    /// Rejected by local policy; sticky until the entity is retired
    Blocked,
    Idle,
}

impl CallState {
    pub const ALL: [CallState; 15] = [
        CallState::Invalid,
        CallState::Connecting,
        CallState::SelectAccount,
        CallState::Dialing,
        CallState::Redialing,
        CallState::Pulling,
        CallState::Incoming,
        CallState::CallWaiting,
        CallState::Active,
        CallState::OnHold,
        CallState::Conferenced,
        CallState::Disconnecting,
        CallState::Disconnected,
        CallState::Blocked,
        CallState::Idle,
    ];

    /// Idle and Invalid calls are never stored in the registry
    pub fn is_dead(self) -> bool {
        matches!(self, CallState::Idle | CallState::Invalid)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Disconnected | CallState::Blocked | CallState::Idle | CallState::Invalid
        )
    }

    pub fn is_incoming(self) -> bool {
        matches!(self, CallState::Incoming | CallState::CallWaiting)
    }

    pub fn is_dialing(self) -> bool {
        matches!(
            self,
            CallState::Dialing | CallState::Redialing | CallState::Pulling
        )
    }

    pub fn is_connecting_or_connected(self) -> bool {
        matches!(
            self,
            CallState::Incoming
                | CallState::CallWaiting
                | CallState::Connecting
                | CallState::Dialing
                | CallState::Pulling
                | CallState::Redialing
                | CallState::Active
                | CallState::OnHold
                | CallState::Conferenced
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Invalid => "INVALID",
            CallState::Connecting => "CONNECTING",
            CallState::SelectAccount => "SELECT_ACCOUNT",
            CallState::Dialing => "DIALING",
            CallState::Redialing => "REDIALING",
            CallState::Pulling => "PULLING",
            CallState::Incoming => "INCOMING",
            CallState::CallWaiting => "CALL_WAITING",
            CallState::Active => "ACTIVE",
            CallState::OnHold => "ONHOLD",
            CallState::Conferenced => "CONFERENCED",
            CallState::Disconnecting => "DISCONNECTING",
            CallState::Disconnected => "DISCONNECTED",
            CallState::Blocked => "BLOCKED",
            CallState::Idle => "IDLE",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed mapping from telephony state to application state
///
/// `CallWaiting` and `Redialing` are never produced: they are only reachable
/// through explicit local transitions.
pub fn translate(raw: RawCallState) -> CallState {
    match raw {
        RawCallState::New | RawCallState::Connecting => CallState::Connecting,
        RawCallState::SelectPhoneAccount => CallState::SelectAccount,
        RawCallState::Dialing => CallState::Dialing,
        RawCallState::PullingCall => CallState::Pulling,
        RawCallState::Ringing => CallState::Incoming,
        RawCallState::Active => CallState::Active,
        RawCallState::Holding => CallState::OnHold,
        RawCallState::Disconnected => CallState::Disconnected,
        RawCallState::Disconnecting => CallState::Disconnecting,
        RawCallState::Unknown => CallState::Invalid,
    }
}

/// Apply one telephony snapshot to a stored state
///
/// A disconnected call never comes back to life: a late live snapshot leaves
/// it `Disconnected` until retention retires it.
pub fn next_state(current: CallState, raw: RawCallState) -> CallState {
    if current == CallState::Blocked {
        return CallState::Blocked;
    }
    let next = translate(raw);
    if current == CallState::Disconnected && !next.is_terminal() {
        return CallState::Disconnected;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_table() {
        assert_eq!(translate(RawCallState::New), CallState::Connecting);
        assert_eq!(translate(RawCallState::Connecting), CallState::Connecting);
        assert_eq!(translate(RawCallState::SelectPhoneAccount), CallState::SelectAccount);
        assert_eq!(translate(RawCallState::Ringing), CallState::Incoming);
        assert_eq!(translate(RawCallState::Holding), CallState::OnHold);
        assert_eq!(translate(RawCallState::PullingCall), CallState::Pulling);
        assert_eq!(translate(RawCallState::Unknown), CallState::Invalid);
    }

    #[test]
    fn test_local_only_states_are_never_translated() {
        for raw in RawCallState::ALL {
            let state = translate(raw);
            assert_ne!(state, CallState::CallWaiting);
            assert_ne!(state, CallState::Redialing);
            assert_ne!(state, CallState::Conferenced);
            assert_ne!(state, CallState::Blocked);
        }
    }

    #[test]
    fn test_blocked_is_sticky() {
        for raw in RawCallState::ALL {
            assert_eq!(next_state(CallState::Blocked, raw), CallState::Blocked);
        }
        assert_eq!(
            next_state(CallState::Incoming, RawCallState::Active),
            CallState::Active
        );
    }

    #[test]
    fn test_disconnected_ignores_live_snapshots() {
        for raw in [
            RawCallState::Active,
            RawCallState::Ringing,
            RawCallState::Holding,
            RawCallState::Dialing,
            RawCallState::Disconnecting,
        ] {
            assert_eq!(next_state(CallState::Disconnected, raw), CallState::Disconnected);
        }
        assert_eq!(
            next_state(CallState::Disconnected, RawCallState::Unknown),
            CallState::Invalid
        );
        assert_eq!(
            next_state(CallState::Invalid, RawCallState::Ringing),
            CallState::Incoming
        );
    }

    #[test]
    fn test_predicates() {
        assert!(CallState::Idle.is_dead());
        assert!(CallState::Invalid.is_dead());
        assert!(!CallState::Disconnected.is_dead());
        assert!(CallState::Disconnected.is_terminal());
        assert!(CallState::Blocked.is_terminal());
        assert!(!CallState::Disconnecting.is_terminal());
        assert!(CallState::CallWaiting.is_incoming());
        assert!(CallState::Redialing.is_dialing());
    }
}
