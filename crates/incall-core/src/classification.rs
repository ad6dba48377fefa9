//! Asynchronous number classification
//!
//! Spam, allow-list and block-list lookups run on the tokio runtime and finish
//! in any order. None of them touches a [`crate::CallEntity`] directly: each
//! lookup posts a [`ClassificationResult`] to an unbounded channel, and the
//! owner of the registry applies it later through
//! [`CallRegistry::apply_classification`](crate::CallRegistry::apply_classification).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::CallState;
use crate::types::CallId;

/// Spam lookups for a phone number
#[async_trait]
pub trait SpamChecker: Send + Sync {
    async fn check_spam_status(&self, number: &str, country_iso: Option<&str>) -> bool;

    /// The user explicitly marked this number as not spam
    async fn check_user_marked_non_spam(&self, number: &str, country_iso: Option<&str>) -> bool;

    async fn check_global_spam_list(&self, number: &str, country_iso: Option<&str>) -> bool;

    async fn check_user_marked_spam(&self, number: &str, country_iso: Option<&str>) -> bool;
}

/// Blocked-number lookup
#[async_trait]
pub trait BlockedNumberChecker: Send + Sync {
    async fn is_blocked(&self, number: &str, country_iso: Option<&str>) -> bool;
}

/// One finished lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Classification {
    Spam(bool),
    Blocked(bool),
    UserSpamList(bool),
    UserAllowList(bool),
    GlobalSpamList(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub call_id: CallId,
    pub classification: Classification,
}

/// Classification flags of one call; `None` until a result arrives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationFlags {
    pub spam: Option<bool>,
    pub blocked: Option<bool>,
    pub in_user_spam_list: Option<bool>,
    pub in_user_allow_list: Option<bool>,
    pub in_global_spam_list: Option<bool>,
}

impl ClassificationFlags {
    /// Merge one result into the flags
    ///
    /// Each result sets exactly one flag. A positive spam result is stored as
    /// `false` if the call is no longer ringing, or if it may be an emergency
    /// callback. Returns `true` if the stored value changed.
    pub fn merge(
        &mut self,
        classification: Classification,
        state: CallState,
        potential_emergency_callback: bool,
    ) -> bool {
        let (slot, value) = match classification {
            Classification::Spam(spam) => {
                let stored = spam && state.is_incoming() && !potential_emergency_callback;
                if spam && !stored {
                    debug!(
                        "Downgrading spam result (state {}, emergency callback {})",
                        state, potential_emergency_callback
                    );
                }
                (&mut self.spam, stored)
            }
            Classification::Blocked(blocked) => (&mut self.blocked, blocked),
            Classification::UserSpamList(listed) => (&mut self.in_user_spam_list, listed),
            Classification::UserAllowList(listed) => (&mut self.in_user_allow_list, listed),
            Classification::GlobalSpamList(listed) => (&mut self.in_global_spam_list, listed),
        };
        let changed = *slot != Some(value);
        *slot = Some(value);
        changed
    }
}

/// Spawns classification lookups and routes their results to the owner
#[derive(Clone)]
pub struct ClassificationDispatcher {
    spam: Option<Arc<dyn SpamChecker>>,
    blocked: Option<Arc<dyn BlockedNumberChecker>>,
    results: mpsc::UnboundedSender<ClassificationResult>,
}

impl ClassificationDispatcher {
    pub fn new(
        spam: Option<Arc<dyn SpamChecker>>,
        blocked: Option<Arc<dyn BlockedNumberChecker>>,
        results: mpsc::UnboundedSender<ClassificationResult>,
    ) -> Self {
        Self {
            spam,
            blocked,
            results,
        }
    }

    /// Start the spam lookups for a new call
    pub fn dispatch_spam(&self, call_id: CallId, number: &str, country_iso: Option<&str>) {
        let Some(checker) = &self.spam else {
            return;
        };
        let Some(runtime) = current_runtime(call_id) else {
            return;
        };
        let lookups: [(fn(bool) -> Classification, SpamLookup); 4] = [
            (Classification::Spam, SpamLookup::Status),
            (Classification::UserAllowList, SpamLookup::UserMarkedNonSpam),
            (Classification::GlobalSpamList, SpamLookup::GlobalList),
            (Classification::UserSpamList, SpamLookup::UserMarkedSpam),
        ];
        for (wrap, lookup) in lookups {
            let checker = Arc::clone(checker);
            let number = number.to_string();
            let iso = country_iso.map(str::to_string);
            self.spawn_lookup(&runtime, call_id, wrap, async move {
                lookup.run(checker.as_ref(), &number, iso.as_deref()).await
            });
        }
    }

    /// Start the blocked-number lookup for a new call
    pub fn dispatch_blocked(&self, call_id: CallId, number: &str, country_iso: Option<&str>) {
        let Some(checker) = &self.blocked else {
            return;
        };
        let Some(runtime) = current_runtime(call_id) else {
            return;
        };
        let checker = Arc::clone(checker);
        let number = number.to_string();
        let iso = country_iso.map(str::to_string);
        self.spawn_lookup(&runtime, call_id, Classification::Blocked, async move {
            checker.is_blocked(&number, iso.as_deref()).await
        });
    }

    fn spawn_lookup<F>(
        &self,
        runtime: &Handle,
        call_id: CallId,
        wrap: fn(bool) -> Classification,
        lookup: F,
    ) where
        F: Future<Output = bool> + Send + 'static,
    {
        let results = self.results.clone();
        runtime.spawn(async move {
            let classification = wrap(lookup.await);
            let result = ClassificationResult {
                call_id,
                classification,
            };
            if results.send(result).is_err() {
                debug!("Registry gone; dropping {:?} for {}", classification, call_id);
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum SpamLookup {
    Status,
    UserMarkedNonSpam,
    GlobalList,
    UserMarkedSpam,
}

impl SpamLookup {
    async fn run(self, checker: &dyn SpamChecker, number: &str, iso: Option<&str>) -> bool {
        match self {
            SpamLookup::Status => checker.check_spam_status(number, iso).await,
            SpamLookup::UserMarkedNonSpam => checker.check_user_marked_non_spam(number, iso).await,
            SpamLookup::GlobalList => checker.check_global_spam_list(number, iso).await,
            SpamLookup::UserMarkedSpam => checker.check_user_marked_spam(number, iso).await,
        }
    }
}

fn current_runtime(call_id: CallId) -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!("No async runtime; skipping classification for {}", call_id);
            None
        }
    }
}
