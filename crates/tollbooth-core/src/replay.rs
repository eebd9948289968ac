use crate::error::AuthorityError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error};

/// Outcome of presenting a certificate identifier to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    Fresh,
    Replay,
}

#[derive(Debug, Clone, Copy)]
struct ReplayEntry {
    expires_at: DateTime<Utc>,
    presented: bool,
}

/// In-memory record of recently issued and presented certificate identifiers.
///
/// Entries are volatile. Correctness never depends on pruning: an expired
/// certificate is rejected by the verifier's own expiry check before the
/// tracker is consulted.
#[derive(Debug, Default)]
pub struct ReplayTracker {
    entries: Mutex<HashMap<String, ReplayEntry>>,
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly issued identifier.
    ///
    /// A collision with a live entry means identifier generation is broken and
    /// is reported as an internal error.
    pub fn record(&self, id: &str, expires_at: DateTime<Utc>) -> Result<(), AuthorityError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        if let Some(existing) = entries.get(id) {
            if existing.expires_at >= now {
                error!(certificate_id = %id, "issued identifier collides with live replay entry");
                return Err(AuthorityError::Internal(format!(
                    "certificate identifier '{id}' already live"
                )));
            }
        }
        entries.insert(
            id.to_string(),
            ReplayEntry {
                expires_at,
                presented: false,
            },
        );
        Ok(())
    }

    /// Atomic test-and-set used by the verifier.
    ///
    /// The first presentation of an identifier is `Fresh`, whether or not this
    /// process issued it; any later presentation before expiry is `Replay`.
    pub fn check_and_mark(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReplayCheck, AuthorityError> {
        let mut entries = self.lock()?;
        match entries.get_mut(id) {
            Some(entry) if entry.presented && entry.expires_at >= now => Ok(ReplayCheck::Replay),
            Some(entry) => {
                entry.presented = true;
                entry.expires_at = entry.expires_at.max(expires_at);
                Ok(ReplayCheck::Fresh)
            }
            None => {
                entries.insert(
                    id.to_string(),
                    ReplayEntry {
                        expires_at,
                        presented: true,
                    },
                );
                Ok(ReplayCheck::Fresh)
            }
        }
    }

    /// Drop every entry whose expiry has passed. Returns the number removed.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, AuthorityError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "pruned replay entries");
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, AuthorityError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, AuthorityError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ReplayEntry>>, AuthorityError> {
        self.entries
            .lock()
            .map_err(|_| AuthorityError::Internal("replay tracker lock poisoned".into()))
    }
}
