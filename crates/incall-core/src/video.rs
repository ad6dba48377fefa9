//! Video capability resolution
//!
//! Several video transports compete for a call (carrier IMS video, RCS video
//! share, an over-the-top app). Each call carries a [`VideoCapabilityResolver`]
//! holding its strategies in priority order. The first strategy that reports
//! itself available is selected, told to become primary, and kept for the rest
//! of the call so the transport never switches mid-call.
//!
//! While nothing is available the resolver hands out an [`EmptyVideoStrategy`]
//! and keeps looking on later calls.

use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::CallState;
use crate::types::{AccountHandle, CallHandle, CallId};

/// Which transport a strategy implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoTechKind {
    None,
    Ims,
    Rcs,
    Duo,
}

/// Progress of an audio to video upgrade negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionModificationState {
    #[default]
    NoRequest,
    WaitingForUpgradeToVideoResponse,
    RequestFailed,
    ReceivedUpgradeToVideoRequest,
    UpgradeToVideoRequestTimedOut,
    UpgradeToVideoRequestFailed,
    RequestRejected,
    WaitingForResponse,
}

/// Video notifications raised by the active strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoEvent {
    /// The strategy's internal state moved; treated as a generic call update
    TechStateChanged,
    SessionModificationChanged { state: SessionModificationState },
    UpgradeRequestReceived,
}

/// One video transport for one call
pub trait VideoStrategy: Send + Sync + Debug {
    fn kind(&self) -> VideoTechKind;

    fn is_available(&self, number: Option<&str>, account: Option<&AccountHandle>) -> bool;

    /// Called once when this strategy wins selection
    fn become_primary(&self) {}

    fn on_call_state_changed(&self, _state: CallState, _account: Option<&AccountHandle>) {}

    fn on_removed_from_registry(&self) {}

    fn session_modification_state(&self) -> SessionModificationState {
        SessionModificationState::NoRequest
    }

    fn is_transmitting_or_receiving(&self) -> bool {
        false
    }

    fn set_device_orientation(&self, _rotation: u32) {}
}

/// Strategy used when no transport is available
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyVideoStrategy;

impl VideoStrategy for EmptyVideoStrategy {
    fn kind(&self) -> VideoTechKind {
        VideoTechKind::None
    }

    fn is_available(&self, _number: Option<&str>, _account: Option<&AccountHandle>) -> bool {
        false
    }
}

/// Builds a strategy for each newly admitted call
///
/// Factories are registered with the registry in priority order.
pub trait VideoStrategyFactory: Send + Sync {
    fn create(&self, call_id: CallId, handle: &CallHandle) -> Arc<dyn VideoStrategy>;
}

/// Memoized selection of a call's video strategy
#[derive(Debug)]
pub struct VideoCapabilityResolver {
    strategies: Vec<Arc<dyn VideoStrategy>>,
    selected: OnceLock<Arc<dyn VideoStrategy>>,
    empty: Arc<dyn VideoStrategy>,
}

impl VideoCapabilityResolver {
    pub fn new(strategies: Vec<Arc<dyn VideoStrategy>>) -> Self {
        Self {
            strategies,
            selected: OnceLock::new(),
            empty: Arc::new(EmptyVideoStrategy),
        }
    }

    /// A resolver with no strategies; always resolves to the empty strategy
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Return the selected strategy, selecting one if none has been yet
    pub fn resolve(
        &self,
        number: Option<&str>,
        account: Option<&AccountHandle>,
    ) -> Arc<dyn VideoStrategy> {
        if let Some(selected) = self.selected.get() {
            return Arc::clone(selected);
        }
        let Some(strategy) = self
            .strategies
            .iter()
            .find(|strategy| strategy.is_available(number, account))
        else {
            return Arc::clone(&self.empty);
        };
        let selected = self.selected.get_or_init(|| {
            debug!("Selected {:?} video strategy", strategy.kind());
            strategy.become_primary();
            Arc::clone(strategy)
        });
        Arc::clone(selected)
    }

    /// The selected strategy, without attempting selection
    pub fn selected(&self) -> Option<&Arc<dyn VideoStrategy>> {
        self.selected.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.selected.get().is_some()
    }

    /// Current negotiation state, or `NoRequest` when nothing is selected
    pub fn session_modification_state(&self) -> SessionModificationState {
        self.selected
            .get()
            .map(|strategy| strategy.session_modification_state())
            .unwrap_or_default()
    }

    pub fn dispatch_call_state_changed(&self, state: CallState, account: Option<&AccountHandle>) {
        for strategy in &self.strategies {
            strategy.on_call_state_changed(state, account);
        }
    }

    pub fn dispatch_removed_from_registry(&self) {
        for strategy in &self.strategies {
            strategy.on_removed_from_registry();
        }
    }

    pub fn dispatch_device_orientation(&self, rotation: u32) {
        if let Some(strategy) = self.selected.get() {
            strategy.set_device_orientation(rotation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeStrategy {
        kind: VideoTechKind,
        available: AtomicBool,
        primary_calls: AtomicUsize,
    }

    impl FakeStrategy {
        fn new(kind: VideoTechKind, available: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(available),
                primary_calls: AtomicUsize::new(0),
            })
        }
    }

    impl VideoStrategy for FakeStrategy {
        fn kind(&self) -> VideoTechKind {
            self.kind
        }

        fn is_available(&self, _number: Option<&str>, _account: Option<&AccountHandle>) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn become_primary(&self) {
            self.primary_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_first_available_wins_and_is_cached() {
        let ims = FakeStrategy::new(VideoTechKind::Ims, false);
        let rcs = FakeStrategy::new(VideoTechKind::Rcs, true);
        let duo = FakeStrategy::new(VideoTechKind::Duo, true);
        let resolver = VideoCapabilityResolver::new(vec![
            ims.clone() as Arc<dyn VideoStrategy>,
            rcs.clone() as Arc<dyn VideoStrategy>,
            duo.clone() as Arc<dyn VideoStrategy>,
        ]);

        assert_eq!(resolver.resolve(None, None).kind(), VideoTechKind::Rcs);

        // IMS turning available later does not switch transports
        ims.available.store(true, Ordering::SeqCst);
        rcs.available.store(false, Ordering::SeqCst);
        assert_eq!(resolver.resolve(None, None).kind(), VideoTechKind::Rcs);
        assert_eq!(rcs.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(duo.primary_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_until_something_is_available() {
        let ims = FakeStrategy::new(VideoTechKind::Ims, false);
        let resolver = VideoCapabilityResolver::new(vec![ims.clone() as Arc<dyn VideoStrategy>]);

        assert_eq!(resolver.resolve(None, None).kind(), VideoTechKind::None);
        assert!(!resolver.is_resolved());

        ims.available.store(true, Ordering::SeqCst);
        assert_eq!(resolver.resolve(None, None).kind(), VideoTechKind::Ims);
        assert!(resolver.is_resolved());
    }

    #[test]
    fn test_no_strategies() {
        let resolver = VideoCapabilityResolver::empty();
        assert_eq!(resolver.resolve(Some("+15551234567"), None).kind(), VideoTechKind::None);
        assert_eq!(
            resolver.session_modification_state(),
            SessionModificationState::NoRequest
        );
    }
}
