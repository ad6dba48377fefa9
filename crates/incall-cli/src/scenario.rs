//! Scripted telephony scenarios
//!
//! A scenario is a JSON document with a list of steps, plus optional number
//! lists answering the spam and block-list lookups of incoming calls:
//!
//! ```json
//! {
//!   "name": "local hangup",
//!   "spam_numbers": ["+15550000000"],
//!   "steps": [
//!     { "step": "telephony", "event": { "type": "call_added", "handle": "tel-1", "snapshot": { "state": "active" } } },
//!     { "step": "telephony", "event": { "type": "call_updated", "handle": "tel-1", "snapshot": { "state": "disconnected", "disconnect_cause": { "code": "local" } } } },
//!     { "step": "wait", "ms": 300 }
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use incall_core::{
    BlockedNumberChecker, CallHandle, Classification, ClassificationResult, RegistryHandle,
    SpamChecker, TelephonyEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Numbers the spam lookup reports as spam
    #[serde(default)]
    pub spam_numbers: Vec<String>,
    /// Numbers the block-list lookup reports as blocked
    #[serde(default)]
    pub blocked_numbers: Vec<String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Deliver one telephony notification
    Telephony { event: TelephonyEvent },
    /// Let real time pass so retention timers can fire
    Wait { ms: u64 },
    /// Post a finished lookup for the call behind `handle`
    Classify {
        handle: CallHandle,
        classification: Classification,
    },
    /// The user dismissed the error dialog
    DismissPendingDisconnects,
}

impl Scenario {
    pub fn from_json(source: &str) -> Result<Self> {
        let scenario: Scenario =
            serde_json::from_str(source).context("scenario is not valid JSON")?;
        if scenario.steps.is_empty() {
            bail!("scenario has no steps");
        }
        Ok(scenario)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read scenario {}", path.display()))?;
        Self::from_json(&source).with_context(|| format!("in {}", path.display()))
    }

    pub fn number_lists(&self) -> Arc<NumberLists> {
        Arc::new(NumberLists {
            spam: self.spam_numbers.clone(),
            blocked: self.blocked_numbers.clone(),
        })
    }

    /// Feed every step to a running registry, in order
    pub async fn replay(&self, registry: &RegistryHandle) -> Result<()> {
        info!(
            "Replaying {} ({} steps)",
            self.name.as_deref().unwrap_or("scenario"),
            self.steps.len()
        );
        for (index, step) in self.steps.iter().enumerate() {
            debug!("Step {}: {:?}", index, step);
            run_step(registry, step)
                .await
                .with_context(|| format!("step {} failed", index))?;
        }
        Ok(())
    }
}

async fn run_step(registry: &RegistryHandle, step: &Step) -> Result<()> {
    match step {
        Step::Telephony { event } => registry.send_event(event.clone()).await?,
        Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        Step::Classify {
            handle,
            classification,
        } => {
            let lookup = handle.clone();
            let call_id = registry
                .with_registry(move |registry| registry.call_by_handle(&lookup).map(|call| call.id()))
                .await?
                .with_context(|| format!("no call tracked under {}", handle))?;
            registry
                .post_classification(ClassificationResult {
                    call_id,
                    classification: *classification,
                })
                .await?;
        }
        Step::DismissPendingDisconnects => registry.dismiss_pending_disconnects().await?,
    }
    Ok(())
}

/// Lookups answered from the scenario's number lists
#[derive(Debug, Default)]
pub struct NumberLists {
    spam: Vec<String>,
    blocked: Vec<String>,
}

impl NumberLists {
    fn is_spam(&self, number: &str) -> bool {
        self.spam.iter().any(|listed| listed == number)
    }
}

#[async_trait]
impl SpamChecker for NumberLists {
    async fn check_spam_status(&self, number: &str, _country_iso: Option<&str>) -> bool {
        self.is_spam(number)
    }

    async fn check_user_marked_non_spam(&self, _number: &str, _country_iso: Option<&str>) -> bool {
        false
    }

    async fn check_global_spam_list(&self, number: &str, _country_iso: Option<&str>) -> bool {
        self.is_spam(number)
    }

    async fn check_user_marked_spam(&self, _number: &str, _country_iso: Option<&str>) -> bool {
        false
    }
}

#[async_trait]
impl BlockedNumberChecker for NumberLists {
    async fn is_blocked(&self, number: &str, _country_iso: Option<&str>) -> bool {
        self.blocked.iter().any(|listed| listed == number)
    }
}
