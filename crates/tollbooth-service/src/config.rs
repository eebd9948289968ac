//! Configuration for tollboothd

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tollbooth_adapters::BtcPayConfig;
use tollbooth_core::{AccountStorageConfig, AuthorityConfig, SignatureScheme};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Fee, supply, membership and certificate policy
    #[serde(default)]
    pub authority: AuthorityConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    /// Seconds between sweeps of expired replay entries
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            authority: AuthorityConfig::default(),
            signing: SigningConfig::default(),
            storage: StorageConfig::default(),
            payment: PaymentConfig::default(),
            membership: MembershipConfig::default(),
            prune_interval_secs: default_prune_interval_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_scheme")]
    pub scheme: SignatureScheme,

    /// 32-byte secret as hex. When unset an ephemeral key is generated at
    /// startup, so certificates do not verify across restarts.
    #[serde(default)]
    pub secret_key_hex: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            secret_key_hex: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    Memory,

    /// PostgreSQL storage
    Postgres {
        database_url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StorageConfig {
    pub fn to_account_storage(&self) -> AccountStorageConfig {
        match self {
            Self::Memory => AccountStorageConfig::memory(),
            Self::Postgres {
                database_url,
                max_connections,
            } => AccountStorageConfig::postgres(database_url.clone(), *max_connections),
        }
    }
}

/// Payment backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum PaymentConfig {
    /// In-process invoices, settled automatically (development only)
    Mock,

    /// BTCPay Server Greenfield API
    Btcpay(BtcPayConfig),
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self::Mock
    }
}

/// Membership registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// URL of the JSON member list. Without it every enforced lookup is
    /// treated as unreachable.
    #[serde(default)]
    pub registry_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_scheme() -> SignatureScheme {
    SignatureScheme::SchnorrNostr
}

fn default_max_connections() -> u32 {
    5
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Environment keys use the `TOLLBOOTH_` prefix with `__` between
    /// sections, e.g. `TOLLBOOTH_AUTHORITY__ADMIN_IDENTITY`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOLLBOOTH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
