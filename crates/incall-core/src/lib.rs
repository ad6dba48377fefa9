//! # incall-core
//!
//! Call lifecycle registry for in-call user interfaces.
//!
//! The telephony stack reports calls as opaque handles with raw state
//! snapshots. This crate turns those into application-level call entities,
//! keeps them in a single registry, retires them a short while after they end,
//! and tells observers what changed.
//!
//! ## Components
//!
//! - [`CallEntity`]: one call. Translates raw snapshots into [`CallState`],
//!   records timing, merges asynchronous spam and block-list results, and
//!   notifies its own [`CallEntityListener`]s.
//! - [`CallRegistry`]: the table of calls, indexed by id and by handle, with
//!   the "which call matters right now" queries.
//! - [`RetentionScheduler`]: grace periods for disconnected calls.
//! - [`VideoCapabilityResolver`]: memoized choice of a video transport.
//! - [`EventBus`]: listener fan-out plus a broadcast channel of
//!   [`CallListEvent`]s.
//! - [`RegistryDriver`]: runs a registry on its own tokio task.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use incall_core::{
//!     CallHandle, CallRegistry, CallSnapshot, RawCallState, RegistryConfig, RegistryDriver,
//!     TelephonyEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> incall_core::Result<()> {
//!     let registry = CallRegistry::builder(RegistryConfig::default()).build()?;
//!     let (handle, _task) = RegistryDriver::spawn(registry);
//!     let mut events = handle.subscribe();
//!
//!     handle
//!         .send_event(TelephonyEvent::CallAdded {
//!             handle: CallHandle::new("tel-1"),
//!             snapshot: CallSnapshot::new(RawCallState::Ringing).with_number("+15551234567"),
//!         })
//!         .await?;
//!
//!     println!("{:?}", events.recv().await);
//!     handle.shutdown().await
//! }
//! ```

pub mod classification;
pub mod clock;
pub mod config;
pub mod driver;
pub mod entity;
pub mod error;
pub mod events;
pub mod extras;
pub mod logging;
pub mod registry;
pub mod retention;
pub mod state;
pub mod telephony;
pub mod types;
pub mod video;

pub use classification::{
    BlockedNumberChecker, Classification, ClassificationFlags, ClassificationResult, SpamChecker,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RegistryConfig, RetentionConfig};
pub use driver::{RegistryCommand, RegistryDriver, RegistryHandle};
pub use entity::{CallEntity, CallLogState, EntityChange};
pub use error::{RegistryError, Result};
pub use events::{CallEntityListener, CallListEvent, CallListListener, CallSummary, EventBus};
pub use extras::CallExtras;
pub use logging::{LoggingConfig, REGISTRY_TARGET, parse_log_level, setup_logging};
pub use registry::{CallRegistry, CallRegistryBuilder, RemovalOutcome};
pub use retention::RetentionScheduler;
pub use state::CallState;
pub use telephony::{
    CallLogSink, ConnectionEvent, EnrichedCallRegistrar, TelephonyCommands, TelephonyEvent,
};
pub use types::{
    AccountHandle, CallCapabilities, CallHandle, CallId, CallProperties, CallSnapshot,
    DisconnectCause, DisconnectCode, NumberPresentation, RawCallState, VideoState,
};
pub use video::{
    EmptyVideoStrategy, SessionModificationState, VideoCapabilityResolver, VideoEvent,
    VideoStrategy, VideoStrategyFactory, VideoTechKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
