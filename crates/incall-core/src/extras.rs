//! Out-of-band call metadata
//!
//! Telephony attaches a loosely typed blob to each snapshot. It is decoded in
//! one step into [`CallExtras`]; if the probe or the decode fails the whole
//! blob is rejected so that nothing from a corrupted payload is applied.

use serde::Deserialize;

use crate::error::{RegistryError, Result};

/// Well-known metadata keys
pub mod keys {
    /// Number of the child leg when the call is a conference participant
    pub const CHILD_ADDRESS: &str = "child_address";
    /// Array of forwarding numbers; the last one is the most recent
    pub const LAST_FORWARDED_NUMBER: &str = "last_forwarded_number";
    pub const CALL_SUBJECT: &str = "call_subject";
    /// Epoch millis of the last emergency callback this account received
    pub const LAST_EMERGENCY_CALLBACK_TIME_MILLIS: &str = "last_emergency_callback_time_millis";
    pub const ANSWERING_DROPS_FOREGROUND_CALL: &str = "answering_drops_foreground_call";
}

/// Decoded metadata blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallExtras {
    pub child_address: Option<String>,
    pub last_forwarded_number: Option<Vec<String>>,
    pub call_subject: Option<String>,
    pub last_emergency_callback_time_millis: Option<i64>,
    pub answering_drops_foreground_call: Option<bool>,
}

impl CallExtras {
    /// Probe and decode a metadata blob
    ///
    /// `null` decodes to an empty set of extras. Anything that is not a JSON
    /// object, or whose known keys carry the wrong type, is malformed.
    pub fn parse(blob: &serde_json::Value) -> Result<Self> {
        if blob.is_null() {
            return Ok(Self::default());
        }
        let object = blob.as_object().ok_or_else(|| {
            RegistryError::malformed_metadata(format!("expected an object, got {}", kind_of(blob)))
        })?;
        if object.keys().any(|key| key.is_empty()) {
            return Err(RegistryError::malformed_metadata("empty key in metadata blob"));
        }
        serde_json::from_value(blob.clone())
            .map_err(|e| RegistryError::malformed_metadata(e.to_string()))
    }

    /// Most recent forwarding number
    pub fn last_forwarded(&self) -> Option<&str> {
        self.last_forwarded_number
            .as_ref()
            .and_then(|numbers| numbers.last())
            .map(String::as_str)
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
