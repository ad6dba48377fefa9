//! Property tests for the call state machine

mod common;

use std::sync::Arc;

use incall_core::state::{next_state, translate};
use incall_core::{CallSnapshot, CallState, DisconnectCode, ManualClock, RawCallState};
use proptest::prelude::*;

use common::{handle, test_registry};

fn raw_state() -> impl Strategy<Value = RawCallState> {
    prop::sample::select(RawCallState::ALL.to_vec())
}

/// Raw states that keep the call in the table
fn live_raw_state() -> impl Strategy<Value = RawCallState> {
    prop::sample::select(
        RawCallState::ALL
            .iter()
            .copied()
            .filter(|raw| !translate(*raw).is_dead() && *raw != RawCallState::Disconnected)
            .collect::<Vec<_>>(),
    )
}

/// Raw states that keep the call in the table, disconnect included
fn tracked_raw_state() -> impl Strategy<Value = RawCallState> {
    prop::sample::select(
        RawCallState::ALL
            .iter()
            .copied()
            .filter(|raw| !translate(*raw).is_dead())
            .collect::<Vec<_>>(),
    )
}

fn stored_state() -> impl Strategy<Value = CallState> {
    prop::sample::select(CallState::ALL.to_vec())
}

proptest! {
    #[test]
    fn next_state_is_translation_unless_blocked(current in stored_state(), raw in raw_state()) {
        let next = next_state(current, raw);
        if current == CallState::Blocked {
            prop_assert_eq!(next, CallState::Blocked);
        } else if current == CallState::Disconnected && !translate(raw).is_terminal() {
            prop_assert_eq!(next, CallState::Disconnected);
        } else {
            prop_assert_eq!(next, translate(raw));
        }
    }

    #[test]
    fn translation_never_yields_local_states(raw in raw_state()) {
        let state = translate(raw);
        prop_assert!(!matches!(
            state,
            CallState::CallWaiting | CallState::Redialing | CallState::Conferenced | CallState::Blocked
        ));
    }

    #[test]
    fn stored_state_follows_snapshots(
        first in live_raw_state(),
        rest in prop::collection::vec(tracked_raw_state(), 1..20),
        block_at in prop::option::of(0usize..20),
    ) {
        let clock = Arc::new(ManualClock::new());
        let (mut registry, _telephony) = test_registry(&clock);
        let id = registry.on_call_appeared(handle("a"), &CallSnapshot::new(first)).unwrap().id();

        let mut blocked = false;
        let mut disconnected = false;
        for (index, raw) in rest.into_iter().enumerate() {
            if block_at == Some(index) {
                let result = registry.block_call(id);
                if disconnected {
                    prop_assert!(result.is_err());
                } else {
                    prop_assert!(result.is_ok());
                    blocked = true;
                }
            }
            registry.on_call_updated(&handle("a"), &CallSnapshot::new(raw));
            disconnected |= !blocked && raw == RawCallState::Disconnected;
            let stored = registry.call(id).unwrap().state();
            if blocked {
                prop_assert_eq!(stored, CallState::Blocked);
            } else if disconnected {
                prop_assert_eq!(stored, CallState::Disconnected);
            } else {
                prop_assert_eq!(stored, translate(raw));
            }
        }
    }

    #[test]
    fn blocked_survives_disconnect_snapshots(first in live_raw_state()) {
        let clock = Arc::new(ManualClock::new());
        let (mut registry, telephony) = test_registry(&clock);
        let id = registry.on_call_appeared(handle("a"), &CallSnapshot::new(first)).unwrap().id();

        registry.block_call(id).unwrap();
        registry.on_call_updated(
            &handle("a"),
            &CallSnapshot::new(RawCallState::Disconnected).with_disconnect_cause(DisconnectCode::Rejected),
        );

        prop_assert_eq!(registry.call(id).unwrap().state(), CallState::Blocked);
        prop_assert_eq!(telephony.commands(), vec!["reject a".to_string()]);
    }

    #[test]
    fn parent_always_reads_as_conferenced(raw in live_raw_state()) {
        let clock = Arc::new(ManualClock::new());
        let (mut registry, _telephony) = test_registry(&clock);
        registry.on_call_appeared(handle("conf"), &CallSnapshot::new(RawCallState::Active));
        let call = registry
            .on_call_appeared(handle("leg"), &CallSnapshot::new(raw).with_parent("conf"))
            .unwrap();

        prop_assert_eq!(call.state(), translate(raw));
        prop_assert_eq!(call.current_state(), CallState::Conferenced);
        prop_assert!(call.parent_id().is_some());
    }
}
