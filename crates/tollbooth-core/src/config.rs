use crate::error::AuthorityError;
use crate::fee::FeeSchedule;
use crate::supply::SupplyMode;
use serde::{Deserialize, Serialize};

/// Ten years. Longer lifetimes leave the range chrono can represent.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Engine policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default)]
    pub fee: FeeSchedule,

    #[serde(default = "default_certificate_ttl_secs")]
    pub certificate_ttl_secs: u64,

    #[serde(default)]
    pub supply: SupplyMode,

    /// Only this identity may replenish supply. `None` denies every caller.
    #[serde(default)]
    pub admin_identity: Option<String>,

    #[serde(default = "default_enforce_membership")]
    pub enforce_membership: bool,

    #[serde(default = "default_membership_ttl_secs")]
    pub membership_ttl_secs: u64,

    /// Bound on every payment backend and registry call.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Embedded in certificates as `authority_npub` when set.
    #[serde(default)]
    pub authority_id: Option<String>,
}

fn default_certificate_ttl_secs() -> u64 {
    600
}

fn default_enforce_membership() -> bool {
    true
}

fn default_membership_ttl_secs() -> u64 {
    300
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            fee: FeeSchedule::default(),
            certificate_ttl_secs: default_certificate_ttl_secs(),
            supply: SupplyMode::default(),
            admin_identity: None,
            enforce_membership: default_enforce_membership(),
            membership_ttl_secs: default_membership_ttl_secs(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            authority_id: None,
        }
    }
}

impl AuthorityConfig {
    pub fn validate(&self) -> Result<(), AuthorityError> {
        FeeSchedule::new(self.fee.rate_bps, self.fee.min_fee)?;
        if self.certificate_ttl_secs == 0 || self.certificate_ttl_secs > MAX_TTL_SECS {
            return Err(AuthorityError::invalid(format!(
                "certificate_ttl_secs must be between 1 and {MAX_TTL_SECS}"
            )));
        }
        if self.membership_ttl_secs > MAX_TTL_SECS {
            return Err(AuthorityError::invalid(format!(
                "membership_ttl_secs must not exceed {MAX_TTL_SECS}"
            )));
        }
        if self.upstream_timeout_ms == 0 {
            return Err(AuthorityError::invalid("upstream_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn certificate_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.certificate_ttl_secs as i64)
    }

    pub fn membership_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.membership_ttl_secs as i64)
    }

    pub fn upstream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.upstream_timeout_ms)
    }
}
