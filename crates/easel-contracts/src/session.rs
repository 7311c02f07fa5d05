use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::wizard::WizardState;

/// Parameter snapshot taken after a successful generation so that reload
/// and "more like this" can rerun without re-collecting anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedParams {
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

/// Per-user interaction context. Process-resident only; a restart starts
/// every user from a fresh session while the ledger keeps the durable part.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub prompt: String,
    pub reference_images: Vec<PathBuf>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub format: Option<String>,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
    pub wizard: Option<WizardState>,
    pub saved_params: Option<SavedParams>,
    pub last_image: Option<PathBuf>,
    pub edit_source: Option<PathBuf>,
    pub in_refinement_mode: bool,
    /// Bumped on every reset. In-flight work snapshots the epoch before
    /// releasing the lock and applies its result only if it still matches.
    pub epoch: u64,
}

/// Keyed session map. The outer lock is held only long enough to fetch the
/// per-user slot; all session reads and writes happen under that user's own
/// mutex, so two messages from one user can never interleave mid-update
/// while different users proceed in parallel.
#[derive(Debug, Default)]
pub struct SessionStore {
    slots: Mutex<HashMap<u64, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `apply` under the user's exclusive section, creating a default
    /// session on first contact.
    pub fn with<R>(&self, user_id: u64, apply: impl FnOnce(&mut Session) -> R) -> R {
        let slot = self.slot(user_id);
        let mut session = slot.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut session)
    }

    /// Owned copy for lock-free reading while blocking I/O runs.
    pub fn snapshot(&self, user_id: u64) -> Session {
        self.with(user_id, |session| session.clone())
    }

    /// Replaces the session with a fresh default, advancing the epoch so
    /// that results of work started before the reset get discarded.
    pub fn reset(&self, user_id: u64) {
        self.with(user_id, |session| {
            let epoch = session.epoch;
            *session = Session {
                epoch: epoch + 1,
                ..Session::default()
            };
        });
    }

    /// Applies `apply` only when the stored epoch still equals `epoch`.
    /// Returns whether the update landed; a `false` means a concurrent
    /// reset happened and the caller's result must be dropped, not forced.
    pub fn apply_if_current(
        &self,
        user_id: u64,
        epoch: u64,
        apply: impl FnOnce(&mut Session),
    ) -> bool {
        self.with(user_id, |session| {
            if session.epoch != epoch {
                return false;
            }
            apply(session);
            true
        })
    }

    pub fn user_ids(&self) -> Vec<u64> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<u64> = slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn slot(&self, user_id: u64) -> Arc<Mutex<Session>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(user_id).or_default())
    }
}
