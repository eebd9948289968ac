use crate::error::AuthorityError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Result of a membership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Inactive,
    Unreachable,
}

impl MembershipStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// One row of the external allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub npub: String,
    #[serde(default)]
    pub status: String,
}

/// External allow-list source.
#[async_trait]
pub trait MembershipRegistry: Send + Sync {
    fn source(&self) -> &str;

    async fn fetch_members(&self) -> Result<Vec<MemberRecord>, AuthorityError>;
}

/// Accept either a bare list of members or an object wrapping a `members` list.
pub fn parse_member_list(value: Value) -> Result<Vec<MemberRecord>, AuthorityError> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("members") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AuthorityError::upstream(
                    "membership-registry",
                    "registry object is missing a 'members' list",
                ))
            }
        },
        _ => {
            return Err(AuthorityError::upstream(
                "membership-registry",
                "registry document is neither a list nor an object",
            ))
        }
    };

    list.into_iter()
        .map(|item| {
            serde_json::from_value::<MemberRecord>(item).map_err(|e| {
                AuthorityError::upstream("membership-registry", format!("bad member record: {e}"))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct MembershipCacheEntry {
    pub subject: String,
    pub status: MembershipStatus,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl MembershipCacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < self.ttl
    }
}

/// Fail-closed cache in front of a [`MembershipRegistry`].
///
/// A subject is only ever reported `Active` from an entry younger than its TTL.
/// When the registry cannot be reached and no fresh entry exists the answer is
/// `Unreachable`, which callers must treat as a denial.
pub struct MembershipGate {
    registry: Option<Arc<dyn MembershipRegistry>>,
    cache: RwLock<MembershipCache>,
    refresh: Mutex<()>,
    ttl: Duration,
    timeout: std::time::Duration,
}

#[derive(Debug, Default)]
struct MembershipCache {
    entries: HashMap<String, MembershipCacheEntry>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl MembershipGate {
    pub fn new(
        registry: Option<Arc<dyn MembershipRegistry>>,
        ttl: Duration,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            cache: RwLock::new(MembershipCache::default()),
            refresh: Mutex::new(()),
            ttl,
            timeout,
        }
    }

    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }

    pub async fn is_active(&self, subject: &str) -> MembershipStatus {
        if let Some(status) = self.cached(subject).await {
            debug!(subject, ?status, "membership cache hit");
            return status;
        }

        // Single refresh in flight; late arrivals reuse its result.
        let _refresh = self.refresh.lock().await;
        if let Some(status) = self.cached(subject).await {
            return status;
        }

        match self.refresh_cache(subject).await {
            Ok(status) => status,
            Err(err) => {
                warn!(subject, error = %err, "membership registry unreachable, denying");
                MembershipStatus::Unreachable
            }
        }
    }

    /// Deny unless membership is affirmatively confirmed.
    pub async fn require_active(&self, subject: &str) -> Result<(), AuthorityError> {
        match self.is_active(subject).await {
            MembershipStatus::Active => Ok(()),
            MembershipStatus::Inactive => Err(AuthorityError::MembershipDenied {
                subject: subject.to_string(),
                reason: "not an active member".into(),
            }),
            MembershipStatus::Unreachable => Err(AuthorityError::MembershipDenied {
                subject: subject.to_string(),
                reason: "membership could not be confirmed".into(),
            }),
        }
    }

    /// Force the next lookup to hit the registry.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        cache.entries.clear();
        cache.refreshed_at = None;
    }

    async fn cached(&self, subject: &str) -> Option<MembershipStatus> {
        let now = Utc::now();
        let cache = self.cache.read().await;
        if let Some(entry) = cache.entries.get(subject) {
            return entry.is_fresh(now).then_some(entry.status);
        }
        // Absent from a list that is still fresh.
        cache
            .refreshed_at
            .filter(|at| now - *at < self.ttl)
            .map(|_| MembershipStatus::Inactive)
    }

    /// Replace the cache from the registry and return `subject`'s status.
    async fn refresh_cache(&self, subject: &str) -> Result<MembershipStatus, AuthorityError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            AuthorityError::upstream("membership-registry", "no registry configured")
        })?;

        let members = tokio::time::timeout(self.timeout, registry.fetch_members())
            .await
            .map_err(|_| {
                AuthorityError::upstream(registry.source(), "registry fetch timed out")
            })??;

        let fetched_at = Utc::now();
        let mut entries = HashMap::with_capacity(members.len());
        for member in members {
            let status = if member.status == "active" {
                MembershipStatus::Active
            } else {
                MembershipStatus::Inactive
            };
            entries
                .entry(member.npub.clone())
                .or_insert(MembershipCacheEntry {
                    subject: member.npub,
                    status,
                    fetched_at,
                    ttl: self.ttl,
                });
        }

        let status = entries
            .get(subject)
            .map(|entry| entry.status)
            .unwrap_or(MembershipStatus::Inactive);
        info!(source = registry.source(), members = entries.len(), "membership cache refreshed");

        let mut cache = self.cache.write().await;
        cache.entries = entries;
        cache.refreshed_at = Some(fetched_at);
        Ok(status)
    }
}
