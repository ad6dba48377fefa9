//! Classification results racing call state changes

mod common;

use std::sync::Arc;
use std::time::Duration;

use incall_core::{
    CallId, CallRegistry, CallSnapshot, Classification, ClassificationResult, ManualClock,
    RawCallState, RegistryConfig, RegistryDriver, TelephonyEvent,
};

use common::{FixedSpamChecker, RecordingListener, handle, ringing, test_registry};

fn spam(call_id: CallId) -> ClassificationResult {
    ClassificationResult {
        call_id,
        classification: Classification::Spam(true),
    }
}

#[test]
fn test_late_spam_result_is_stored_as_not_spam() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let id = registry
        .on_call_appeared(handle("a"), &ringing("+15551234567"))
        .unwrap()
        .id();
    registry.on_call_updated(&handle("a"), &CallSnapshot::new(RawCallState::Active));

    let listener = Arc::new(RecordingListener::default());
    registry.add_listener(listener.clone());
    assert!(registry.apply_classification(spam(id)));

    let call = registry.call(id).unwrap();
    assert_eq!(call.classification().spam, Some(false));
    assert!(!call.is_spam());
    assert_eq!(listener.changes(), 2);
}

#[test]
fn test_flags_are_independent_and_duplicates_are_quiet() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let id = registry
        .on_call_appeared(handle("a"), &ringing("+15551234567"))
        .unwrap()
        .id();
    let listener = Arc::new(RecordingListener::default());
    registry.add_listener(listener.clone());

    assert!(registry.apply_classification(ClassificationResult {
        call_id: id,
        classification: Classification::UserAllowList(true),
    }));
    assert!(registry.apply_classification(spam(id)));
    assert!(!registry.apply_classification(spam(id)));

    let flags = registry.call(id).unwrap().classification();
    assert_eq!(flags.in_user_allow_list, Some(true));
    assert_eq!(flags.spam, Some(true));
    assert_eq!(flags.blocked, None);
    assert_eq!(listener.changes(), 3);
}

#[test]
fn test_result_for_retired_call_is_dropped() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    let id = registry
        .on_call_appeared(handle("a"), &ringing("+15551234567"))
        .unwrap()
        .id();
    registry.on_call_updated(
        &handle("a"),
        &CallSnapshot::new(RawCallState::Disconnected)
            .with_disconnect_cause(incall_core::DisconnectCode::Rejected),
    );

    assert!(registry.is_empty());
    assert!(!registry.apply_classification(spam(id)));
}

#[test]
fn test_recent_emergency_call_suppresses_spam() {
    let clock = Arc::new(ManualClock::new());
    let (mut registry, _telephony) = test_registry(&clock);
    registry.on_call_appeared(
        handle("911"),
        &CallSnapshot::new(RawCallState::Dialing)
            .with_number("911")
            .with_emergency_number(true),
    );
    registry.on_call_updated(
        &handle("911"),
        &CallSnapshot::new(RawCallState::Disconnected)
            .with_number("911")
            .with_emergency_number(true)
            .with_disconnect_cause(incall_core::DisconnectCode::Local),
    );
    registry.on_error_dialog_dismissed();

    clock.advance(Duration::from_secs(4 * 60));
    let callback = registry
        .on_call_appeared(handle("cb"), &ringing("+15551234567"))
        .unwrap()
        .id();
    registry.apply_classification(spam(callback));
    assert_eq!(registry.call(callback).unwrap().classification().spam, Some(false));

    clock.advance(Duration::from_secs(2 * 60));
    let stranger = registry
        .on_call_appeared(handle("later"), &ringing("+15557654321"))
        .unwrap()
        .id();
    registry.apply_classification(spam(stranger));
    assert_eq!(registry.call(stranger).unwrap().classification().spam, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_slow_lookup_loses_race_with_answer() {
    let registry = CallRegistry::builder(RegistryConfig::default())
        .with_spam_checker(Arc::new(FixedSpamChecker {
            spam: true,
            delay: Duration::from_millis(500),
        }))
        .build()
        .unwrap();
    let (driver, task) = RegistryDriver::spawn(registry);

    driver
        .send_event(TelephonyEvent::CallAdded {
            handle: handle("a"),
            snapshot: ringing("+15551234567"),
        })
        .await
        .unwrap();
    driver
        .send_event(TelephonyEvent::CallUpdated {
            handle: handle("a"),
            snapshot: CallSnapshot::new(RawCallState::Active),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let flags = driver
        .with_registry(|registry| registry.active_call().map(|call| call.classification()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(flags.spam, Some(false));
    assert_eq!(flags.in_global_spam_list, Some(true));

    driver.shutdown().await.unwrap();
    task.await.unwrap();
}
