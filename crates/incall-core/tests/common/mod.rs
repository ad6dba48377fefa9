//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use incall_core::{
    AccountHandle, BlockedNumberChecker, CallEntity, CallHandle, CallId, CallListListener,
    CallLogSink, CallRegistry, CallSnapshot, ManualClock, RawCallState, RegistryConfig,
    SpamChecker, TelephonyCommands, VideoState,
};
use parking_lot::Mutex;

#[derive(Default)]
pub struct RecordingTelephony {
    pub commands: Mutex<Vec<String>>,
}

impl RecordingTelephony {
    fn record(&self, command: String) {
        self.commands.lock().push(command);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl TelephonyCommands for RecordingTelephony {
    fn answer(&self, handle: &CallHandle, _video_state: VideoState) {
        self.record(format!("answer {}", handle));
    }

    fn reject(&self, handle: &CallHandle, _with_message: bool, _message: Option<&str>) {
        self.record(format!("reject {}", handle));
    }

    fn hold(&self, handle: &CallHandle) {
        self.record(format!("hold {}", handle));
    }

    fn unhold(&self, handle: &CallHandle) {
        self.record(format!("unhold {}", handle));
    }

    fn disconnect(&self, handle: &CallHandle) {
        self.record(format!("disconnect {}", handle));
    }

    fn merge_conference(&self, handle: &CallHandle) {
        self.record(format!("merge {}", handle));
    }

    fn split_from_conference(&self, handle: &CallHandle) {
        self.record(format!("split {}", handle));
    }

    fn play_dtmf_tone(&self, handle: &CallHandle, digit: char) {
        self.record(format!("dtmf {} {}", handle, digit));
    }

    fn stop_dtmf_tone(&self, handle: &CallHandle) {
        self.record(format!("dtmf-stop {}", handle));
    }

    fn phone_account_selected(&self, handle: &CallHandle, account: &AccountHandle, _set_default: bool) {
        self.record(format!("account {} {}", handle, account));
    }
}

/// Counts every registry callback it receives
#[derive(Default)]
pub struct RecordingListener {
    pub changes: AtomicUsize,
    pub incoming: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub upgrades: AtomicUsize,
    pub handovers: AtomicUsize,
    /// Registry size seen by each generic update
    pub sizes: Mutex<Vec<usize>>,
}

impl RecordingListener {
    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn incoming(&self) -> usize {
        self.incoming.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl CallListListener for RecordingListener {
    fn on_incoming_call(&self, _call: &CallEntity) {
        self.incoming.fetch_add(1, Ordering::SeqCst);
    }

    fn on_upgrade_to_video(&self, _call: &CallEntity) {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
    }

    fn on_call_list_change(&self, registry: &CallRegistry) {
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.sizes.lock().push(registry.len());
    }

    fn on_disconnect(&self, _call: &CallEntity) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_wifi_to_lte_handover(&self, _call: &CallEntity) {
        self.handovers.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spam checker with fixed answers and an optional delay
pub struct FixedSpamChecker {
    pub spam: bool,
    pub delay: Duration,
}

impl FixedSpamChecker {
    pub fn new(spam: bool) -> Self {
        Self {
            spam,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl SpamChecker for FixedSpamChecker {
    async fn check_spam_status(&self, _number: &str, _iso: Option<&str>) -> bool {
        tokio::time::sleep(self.delay).await;
        self.spam
    }

    async fn check_user_marked_non_spam(&self, _number: &str, _iso: Option<&str>) -> bool {
        false
    }

    async fn check_global_spam_list(&self, _number: &str, _iso: Option<&str>) -> bool {
        self.spam
    }

    async fn check_user_marked_spam(&self, _number: &str, _iso: Option<&str>) -> bool {
        false
    }
}

pub struct NumberBlockList(pub Vec<String>);

#[async_trait]
impl BlockedNumberChecker for NumberBlockList {
    async fn is_blocked(&self, number: &str, _iso: Option<&str>) -> bool {
        self.0.iter().any(|blocked| blocked == number)
    }
}

#[derive(Default)]
pub struct RecordingCallLog {
    pub logged: Mutex<Vec<CallId>>,
}

impl CallLogSink for RecordingCallLog {
    fn log_call(&self, call: &CallEntity) {
        self.logged.lock().push(call.id());
    }
}

pub fn handle(name: &str) -> CallHandle {
    CallHandle::new(name)
}

pub fn ringing(number: &str) -> CallSnapshot {
    CallSnapshot::new(RawCallState::Ringing).with_number(number)
}

/// A registry on a manual clock with a recording telephony sink
pub fn test_registry(clock: &Arc<ManualClock>) -> (CallRegistry, Arc<RecordingTelephony>) {
    let telephony = Arc::new(RecordingTelephony::default());
    let registry = CallRegistry::builder(RegistryConfig::default())
        .with_clock(clock.clone())
        .with_telephony(telephony.clone())
        .build()
        .expect("default config is valid");
    (registry, telephony)
}
