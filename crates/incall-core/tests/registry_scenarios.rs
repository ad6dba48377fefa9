//! End-to-end registry scenarios driven through the public API

mod common;

use std::sync::Arc;
use std::time::Duration;

use incall_core::{
    CallListEvent, CallRegistry, CallSnapshot, CallState, DisconnectCode, ManualClock,
    RawCallState, RegistryConfig, RemovalOutcome,
};
use pretty_assertions::assert_eq;
use tracing_test::traced_test;

use common::{
    FixedSpamChecker, NumberBlockList, RecordingCallLog, RecordingListener, handle, ringing,
    test_registry,
};

#[tokio::test]
async fn test_ringing_call_classified_as_spam() {
    let clock = Arc::new(ManualClock::new());
    let mut registry = CallRegistry::builder(RegistryConfig::default())
        .with_clock(clock.clone())
        .with_spam_checker(Arc::new(FixedSpamChecker::new(true)))
        .with_blocked_number_checker(Arc::new(NumberBlockList(Vec::new())))
        .build()
        .unwrap();
    let mut results = registry.take_classification_receiver().unwrap();
    let listener = Arc::new(RecordingListener::default());
    registry.add_listener(listener.clone());
    let mut events = registry.subscribe();

    let id = registry
        .on_call_appeared(handle("tel-1"), &ringing("+15551234567"))
        .unwrap()
        .id();

    assert_eq!(registry.call(id).unwrap().state(), CallState::Incoming);
    assert_eq!(listener.incoming(), 1);
    assert!(matches!(
        events.try_recv().unwrap(),
        CallListEvent::IncomingCall { call } if call.id == id
    ));

    // four spam lookups plus the block-list lookup
    let changes_before = listener.changes();
    for _ in 0..5 {
        let result = results.recv().await.unwrap();
        assert_eq!(result.call_id, id);
        registry.apply_classification(result);
    }

    let call = registry.call(id).unwrap();
    assert!(call.is_spam());
    assert_eq!(call.classification().spam, Some(true));
    assert_eq!(call.classification().in_global_spam_list, Some(true));
    assert_eq!(call.classification().blocked, Some(false));
    assert!(listener.changes() > changes_before);
}

#[tokio::test]
async fn test_spam_check_disabled_by_config() {
    let clock = Arc::new(ManualClock::new());
    let mut registry = CallRegistry::builder(RegistryConfig::default().with_spam_check(false))
        .with_clock(clock.clone())
        .with_spam_checker(Arc::new(FixedSpamChecker::new(true)))
        .build()
        .unwrap();

    registry.on_call_appeared(handle("tel-1"), &ringing("+15551234567"));
    tokio::task::yield_now().await;

    assert_eq!(registry.drain_classification_results(), 0);
}

#[test]
fn test_local_hangup_retained_then_retired() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, telephony) = test_registry(&clock);
    let listener = Arc::new(RecordingListener::default());
    registry.add_listener(listener.clone());

    let id = registry
        .on_call_appeared(handle("tel-1"), &CallSnapshot::new(RawCallState::Active))
        .unwrap()
        .id();
    registry.disconnect_call(id).unwrap();
    assert_eq!(registry.call(id).unwrap().state(), CallState::Disconnecting);
    assert_eq!(telephony.commands(), vec!["disconnect tel-1".to_string()]);

    let mut events = registry.subscribe();
    registry.on_call_updated(
        &handle("tel-1"),
        &CallSnapshot::new(RawCallState::Disconnected).with_disconnect_cause(DisconnectCode::Local),
    );

    assert_eq!(registry.call(id).unwrap().state(), CallState::Disconnected);
    assert_eq!(listener.disconnects(), 1);
    assert!(registry.is_retention_pending(id));
    assert!(matches!(events.try_recv().unwrap(), CallListEvent::Disconnected { .. }));

    clock.advance(Duration::from_millis(150));
    assert_eq!(registry.fire_due_retentions(), 0);
    assert!(registry.call(id).is_some());

    let changes_before = listener.changes();
    clock.advance(Duration::from_millis(50));
    assert_eq!(registry.fire_due_retentions(), 1);

    assert!(registry.call(id).is_none());
    assert!(registry.call_by_handle(&handle("tel-1")).is_none());
    assert_eq!(listener.changes(), changes_before + 1);
    assert_eq!(listener.sizes.lock().last(), Some(&0));
    assert!(matches!(
        events.try_recv().unwrap(),
        CallListEvent::Retired { call_id, .. } if call_id == id
    ));
    assert_eq!(
        events.try_recv().unwrap(),
        CallListEvent::CallListChanged { calls: Vec::new() }
    );
}

#[test]
#[traced_test]
fn test_duplicate_rejected_disconnects() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let listener = Arc::new(RecordingListener::default());
    registry.add_listener(listener.clone());
    registry.on_call_appeared(handle("tel-1"), &ringing("+15551234567"));

    let rejected =
        CallSnapshot::new(RawCallState::Disconnected).with_disconnect_cause(DisconnectCode::Rejected);
    registry.on_call_updated(&handle("tel-1"), &rejected);
    assert!(registry.is_empty());
    let changes_after_first = listener.changes();

    registry.on_call_updated(&handle("tel-1"), &rejected);

    assert!(registry.is_empty());
    assert_eq!(listener.disconnects(), 1);
    assert_eq!(listener.changes(), changes_after_first);
    assert!(logs_contain("Update for unknown call tel-1"));

    assert_eq!(registry.on_call_disappeared(&handle("tel-1")), RemovalOutcome::Unknown);
    assert!(logs_contain("Removal for unknown call tel-1"));
}

#[test]
#[traced_test]
fn test_disappearing_twice_matches_once() {
    let clock = Arc::new(ManualClock::new());
    let call_log = Arc::new(RecordingCallLog::default());
    let mut registry = CallRegistry::builder(RegistryConfig::default())
        .with_clock(clock.clone())
        .with_call_log(call_log.clone())
        .build()
        .unwrap();
    let id = registry
        .on_call_appeared(handle("tel-1"), &CallSnapshot::new(RawCallState::Active))
        .unwrap()
        .id();
    registry.on_call_updated(
        &handle("tel-1"),
        &CallSnapshot::new(RawCallState::Disconnected).with_disconnect_cause(DisconnectCode::Remote),
    );
    let deadline = registry.next_retention_deadline();

    assert_eq!(registry.on_call_disappeared(&handle("tel-1")), RemovalOutcome::Retained);
    assert_eq!(registry.on_call_disappeared(&handle("tel-1")), RemovalOutcome::Duplicate);

    assert!(logs_contain("Duplicate removal"));
    assert_eq!(call_log.logged.lock().as_slice(), &[id]);
    assert_eq!(registry.next_retention_deadline(), deadline);
    assert!(registry.call(id).is_some());

    clock.advance(Duration::from_secs(2));
    registry.fire_due_retentions();
    assert!(registry.is_empty());
    assert_eq!(call_log.logged.lock().len(), 1);
}

#[test]
fn test_blocked_call_removed_on_disappear() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let id = registry
        .on_call_appeared(handle("tel-1"), &ringing("+15551234567"))
        .unwrap()
        .id();
    registry.block_call(id).unwrap();

    assert_eq!(registry.on_call_disappeared(&handle("tel-1")), RemovalOutcome::Removed);
    assert!(registry.is_empty());
}

#[test]
fn test_disconnected_call_cannot_be_blocked() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, telephony) = test_registry(&clock);
    let id = registry
        .on_call_appeared(handle("tel-1"), &ringing("+15551234567"))
        .unwrap()
        .id();
    registry.on_call_updated(
        &handle("tel-1"),
        &CallSnapshot::new(RawCallState::Disconnected).with_disconnect_cause(DisconnectCode::Remote),
    );

    assert!(registry.block_call(id).is_err());
    assert_eq!(registry.call(id).unwrap().state(), CallState::Disconnected);
    assert!(registry.next_retention_deadline().is_some());
    assert!(telephony.commands().is_empty());
}

#[test]
fn test_conference_links_resolve_by_handle() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let first = registry
        .on_call_appeared(handle("a"), &CallSnapshot::new(RawCallState::Active))
        .unwrap()
        .id();
    let second = registry
        .on_call_appeared(handle("b"), &CallSnapshot::new(RawCallState::Holding))
        .unwrap()
        .id();
    let conference = registry
        .on_call_appeared(
            handle("conf"),
            &CallSnapshot::new(RawCallState::Active).with_children(vec![handle("a"), handle("b")]),
        )
        .unwrap()
        .id();
    registry.on_call_updated(&handle("a"), &CallSnapshot::new(RawCallState::Active).with_parent("conf"));
    registry.on_call_updated(&handle("b"), &CallSnapshot::new(RawCallState::Active).with_parent("conf"));

    assert_eq!(registry.call(conference).unwrap().child_ids(), &[first, second]);
    assert_eq!(registry.call(first).unwrap().parent_id(), Some(conference));
    assert_eq!(registry.active_call().unwrap().id(), conference);
    assert_eq!(
        registry.call_with_state(CallState::Conferenced, 1).unwrap().id(),
        second
    );
    assert_eq!(registry.call(conference).unwrap().log_state().conferenced_calls, 2);
}
