//! Identifiers and the raw telephony vocabulary
//!
//! Everything the telephony collaborator pushes into the registry is described
//! here: the opaque [`CallHandle`], the raw per-call state, disconnect causes,
//! capability and property bitmasks, and the [`CallSnapshot`] that carries one
//! update for one call. All of it is serde-friendly so scenarios can be
//! scripted as JSON.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a tracked call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Allocate the next id from the process-wide counter
    pub fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw counter value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Opaque reference to a call as known by the telephony collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallHandle(String);

impl CallHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CallHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Origination identity (SIM slot, VoIP account) a call is placed through
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountHandle(String);

impl AccountHandle {
    pub fn new(account: impl Into<String>) -> Self {
        Self(account.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call state as reported by telephony, before translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawCallState {
    New,
    Connecting,
    SelectPhoneAccount,
    Dialing,
    Ringing,
    Active,
    Holding,
    Disconnected,
    Disconnecting,
    PullingCall,
    /// Anything telephony reports that this registry does not know about
    #[default]
    #[serde(other)]
    Unknown,
}

impl RawCallState {
    pub const ALL: [RawCallState; 11] = [
        RawCallState::New,
        RawCallState::Connecting,
        RawCallState::SelectPhoneAccount,
        RawCallState::Dialing,
        RawCallState::Ringing,
        RawCallState::Active,
        RawCallState::Holding,
        RawCallState::Disconnected,
        RawCallState::Disconnecting,
        RawCallState::PullingCall,
        RawCallState::Unknown,
    ];
}

/// Category of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCode {
    #[default]
    Unknown,
    Error,
    /// Hung up on this device
    Local,
    /// Hung up by the other party
    Remote,
    Canceled,
    Missed,
    Rejected,
    Busy,
    Restricted,
    Other,
    ConnectionManagerNotSupported,
    AnsweredElsewhere,
    CallPulled,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectCause {
    pub code: DisconnectCode,
    /// Short user-facing label, when telephony supplies one
    pub label: Option<String>,
    /// Free-form diagnostic reason
    pub reason: Option<String>,
}

impl DisconnectCause {
    pub fn new(code: DisconnectCode) -> Self {
        Self {
            code,
            label: None,
            reason: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(DisconnectCode::Unknown)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl From<DisconnectCode> for DisconnectCause {
    fn from(code: DisconnectCode) -> Self {
        Self::new(code)
    }
}

macro_rules! bitmask {
    ($(#[$meta:meta])* $name:ident { $($(#[$flag_meta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            $($(#[$flag_meta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(&self) -> u32 {
                self.0
            }

            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitmask! {
    /// What telephony allows the user to do with a call
    CallCapabilities {
        HOLD = 0x0000_0001,
        SUPPORT_HOLD = 0x0000_0002,
        MERGE_CONFERENCE = 0x0000_0004,
        SWAP_CONFERENCE = 0x0000_0008,
        RESPOND_VIA_TEXT = 0x0000_0020,
        MUTE = 0x0000_0040,
        MANAGE_CONFERENCE = 0x0000_0080,
        SEPARATE_FROM_CONFERENCE = 0x0000_1000,
        DISCONNECT_FROM_CONFERENCE = 0x0000_2000,
        CAN_PULL_CALL = 0x0080_0000,
    }
}

bitmask! {
    /// Structural facts about a call
    CallProperties {
        CONFERENCE = 0x0000_0001,
        GENERIC_CONFERENCE = 0x0000_0002,
        /// Telephony says this call is an emergency callback
        EMERGENCY_CALLBACK_MODE = 0x0000_0004,
        WIFI = 0x0000_0008,
        HIGH_DEF_AUDIO = 0x0000_0010,
        EXTERNAL_CALL = 0x0000_0040,
    }
}

bitmask! {
    /// Media directions of a call
    VideoState {
        TX_ENABLED = 0x1,
        RX_ENABLED = 0x2,
        BIDIRECTIONAL = 0x3,
        PAUSED = 0x4,
    }
}

impl VideoState {
    pub const AUDIO_ONLY: Self = Self(0);

    pub fn is_video(&self) -> bool {
        self.0 & Self::BIDIRECTIONAL.0 != 0
    }
}

/// How the remote number may be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberPresentation {
    #[default]
    Allowed,
    Restricted,
    Unknown,
    Payphone,
}

impl NumberPresentation {
    /// Whether the caller withheld their number
    pub fn is_hidden(&self) -> bool {
        matches!(self, Self::Restricted | Self::Unknown)
    }
}

/// One telephony push for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSnapshot {
    pub state: RawCallState,
    pub disconnect_cause: DisconnectCause,
    pub number: Option<String>,
    pub presentation: NumberPresentation,
    pub country_iso: Option<String>,
    /// Telephony reports the number as an emergency number
    pub emergency_number: bool,
    /// Out-of-band metadata, see [`crate::extras::CallExtras`]
    pub extras: Option<serde_json::Value>,
    pub capabilities: CallCapabilities,
    pub properties: CallProperties,
    pub video_state: VideoState,
    pub parent: Option<CallHandle>,
    pub children: Vec<CallHandle>,
    pub conferenceable: Vec<CallHandle>,
    pub account: Option<AccountHandle>,
}

impl CallSnapshot {
    pub fn new(state: RawCallState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn with_disconnect_cause(mut self, cause: impl Into<DisconnectCause>) -> Self {
        self.disconnect_cause = cause.into();
        self
    }

    pub fn with_presentation(mut self, presentation: NumberPresentation) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn with_extras(mut self, extras: serde_json::Value) -> Self {
        self.extras = Some(extras);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CallCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_properties(mut self, properties: CallProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_video_state(mut self, video_state: VideoState) -> Self {
        self.video_state = video_state;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<CallHandle>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_children(mut self, children: Vec<CallHandle>) -> Self {
        self.children = children;
        self
    }

    pub fn with_account(mut self, account: AccountHandle) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_emergency_number(mut self, emergency: bool) -> Self {
        self.emergency_number = emergency;
        self
    }
}
