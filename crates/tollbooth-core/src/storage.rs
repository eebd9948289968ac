use crate::error::AuthorityError;
use crate::invoice::{Invoice, InvoiceStatus};
use crate::ledger::OperatorAccount;
use crate::supply::SupplyState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Account persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum AccountStorageConfig {
    /// Keep accounts, invoices and supply in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL and hydrate engine state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl AccountStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Everything the engine needs to resume after a restart.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub accounts: Vec<OperatorAccount>,
    pub invoices: Vec<Invoice>,
    pub supply: Option<SupplyState>,
}

/// Durable backing for the ledger, the invoice tracker and the supply counter.
///
/// Methods that take more than one record write them in a single transaction:
/// either every record is stored or none is.
#[async_trait]
pub trait AccountStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn load(&self) -> Result<StoredState, AuthorityError>;

    async fn save_account(&self, account: &OperatorAccount) -> Result<(), AuthorityError>;

    async fn save_invoice_with_account(
        &self,
        invoice: &Invoice,
        account: &OperatorAccount,
    ) -> Result<(), AuthorityError>;

    async fn save_certification(
        &self,
        account: &OperatorAccount,
        supply: &SupplyState,
    ) -> Result<(), AuthorityError>;

    async fn save_supply(&self, supply: &SupplyState) -> Result<(), AuthorityError>;
}

/// Connect the configured backend, creating its schema when needed.
pub async fn connect_store(
    config: &AccountStorageConfig,
) -> Result<Arc<dyn AccountStore>, AuthorityError> {
    match config {
        AccountStorageConfig::Memory => Ok(Arc::new(MemoryAccountStore::new())),
        AccountStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresAccountStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            info!(backend = "postgres", "account store ready");
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    accounts: HashMap<String, OperatorAccount>,
    invoices: HashMap<String, Invoice>,
    supply: Option<SupplyState>,
}

/// Run a write-then-publish step on its own task and wait for it.
///
/// Dropping the caller's future does not stop the step, so a storage commit
/// is always followed by the matching in-memory update. Locks held by the
/// step are released only after both have happened.
pub(crate) async fn commit_detached<T, F>(step: F) -> Result<T, AuthorityError>
where
    F: Future<Output = Result<T, AuthorityError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(step)
        .await
        .map_err(|err| AuthorityError::Internal(format!("commit task failed: {err}")))?
}

/// Process-local store. Writes can be made to fail, or to acknowledge late
/// after they have landed, for exercising error and cancellation paths.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    data: RwLock<MemoryData>,
    fail_writes: AtomicBool,
    ack_delay_ms: AtomicU64,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay the reply of every successful write by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.ack_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), AuthorityError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AuthorityError::Storage("memory store rejected write".into()));
        }
        Ok(())
    }

    async fn acknowledge(&self) -> Result<(), AuthorityError> {
        let millis = self.ack_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<StoredState, AuthorityError> {
        let data = self.data.read().await;
        Ok(StoredState {
            accounts: data.accounts.values().cloned().collect(),
            invoices: data.invoices.values().cloned().collect(),
            supply: data.supply.clone(),
        })
    }

    async fn save_account(&self, account: &OperatorAccount) -> Result<(), AuthorityError> {
        self.check_writable()?;
        self.data
            .write()
            .await
            .accounts
            .insert(account.operator_id.clone(), account.clone());
        self.acknowledge().await
    }

    async fn save_invoice_with_account(
        &self,
        invoice: &Invoice,
        account: &OperatorAccount,
    ) -> Result<(), AuthorityError> {
        self.check_writable()?;
        {
            let mut data = self.data.write().await;
            data.invoices
                .insert(invoice.invoice_id.clone(), invoice.clone());
            data.accounts
                .insert(account.operator_id.clone(), account.clone());
        }
        self.acknowledge().await
    }

    async fn save_certification(
        &self,
        account: &OperatorAccount,
        supply: &SupplyState,
    ) -> Result<(), AuthorityError> {
        self.check_writable()?;
        {
            let mut data = self.data.write().await;
            data.accounts
                .insert(account.operator_id.clone(), account.clone());
            data.supply = Some(supply.clone());
        }
        self.acknowledge().await
    }

    async fn save_supply(&self, supply: &SupplyState) -> Result<(), AuthorityError> {
        self.check_writable()?;
        self.data.write().await.supply = Some(supply.clone());
        self.acknowledge().await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AuthorityError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| AuthorityError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), AuthorityError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tollbooth_operator_accounts (
                operator_id TEXT PRIMARY KEY,
                balance BIGINT NOT NULL CHECK (balance >= 0),
                total_deposited BIGINT NOT NULL,
                total_consumed BIGINT NOT NULL,
                pending_invoices JSONB NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tollbooth_invoices (
                invoice_id TEXT PRIMARY KEY,
                operator_id TEXT NOT NULL,
                amount BIGINT NOT NULL,
                status TEXT NOT NULL,
                payment_descriptor TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                settled_at TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tollbooth_invoices_operator ON tollbooth_invoices (operator_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres index create failed: {e}")))?;

        // Singleton row keyed by id = 1.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tollbooth_supply (
                id SMALLINT PRIMARY KEY,
                remaining BIGINT NOT NULL CHECK (remaining >= 0),
                total_replenished BIGINT NOT NULL,
                total_consumed BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres schema create failed: {e}")))?;

        Ok(())
    }

    async fn load_accounts(&self) -> Result<Vec<OperatorAccount>, AuthorityError> {
        let rows = sqlx::query(
            r#"
            SELECT operator_id, balance, total_deposited, total_consumed,
                   pending_invoices, registered_at, updated_at
            FROM tollbooth_operator_accounts
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres account load failed: {e}")))?;

        rows.iter().map(account_from_row).collect()
    }

    async fn load_invoices(&self) -> Result<Vec<Invoice>, AuthorityError> {
        let rows = sqlx::query(
            r#"
            SELECT invoice_id, operator_id, amount, status, payment_descriptor,
                   created_at, settled_at
            FROM tollbooth_invoices
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres invoice load failed: {e}")))?;

        rows.iter().map(invoice_from_row).collect()
    }

    async fn load_supply(&self) -> Result<Option<SupplyState>, AuthorityError> {
        let row = sqlx::query(
            "SELECT remaining, total_replenished, total_consumed, updated_at FROM tollbooth_supply WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres supply load failed: {e}")))?;

        row.map(|row| {
            Ok(SupplyState {
                remaining: from_db(get(&row, "remaining")?, "remaining")?,
                total_replenished: from_db(get(&row, "total_replenished")?, "total_replenished")?,
                total_consumed: from_db(get(&row, "total_consumed")?, "total_consumed")?,
                updated_at: get(&row, "updated_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self) -> Result<StoredState, AuthorityError> {
        Ok(StoredState {
            accounts: self.load_accounts().await?,
            invoices: self.load_invoices().await?,
            supply: self.load_supply().await?,
        })
    }

    async fn save_account(&self, account: &OperatorAccount) -> Result<(), AuthorityError> {
        let mut tx = begin(&self.pool).await?;
        upsert_account(&mut tx, account).await?;
        commit(tx).await
    }

    async fn save_invoice_with_account(
        &self,
        invoice: &Invoice,
        account: &OperatorAccount,
    ) -> Result<(), AuthorityError> {
        let mut tx = begin(&self.pool).await?;
        upsert_invoice(&mut tx, invoice).await?;
        upsert_account(&mut tx, account).await?;
        commit(tx).await
    }

    async fn save_certification(
        &self,
        account: &OperatorAccount,
        supply: &SupplyState,
    ) -> Result<(), AuthorityError> {
        let mut tx = begin(&self.pool).await?;
        upsert_account(&mut tx, account).await?;
        upsert_supply(&mut tx, supply).await?;
        commit(tx).await
    }

    async fn save_supply(&self, supply: &SupplyState) -> Result<(), AuthorityError> {
        let mut tx = begin(&self.pool).await?;
        upsert_supply(&mut tx, supply).await?;
        commit(tx).await
    }
}

type PgTx = sqlx::Transaction<'static, sqlx::Postgres>;

async fn begin(pool: &PgPool) -> Result<PgTx, AuthorityError> {
    pool.begin()
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres begin failed: {e}")))
}

async fn commit(tx: PgTx) -> Result<(), AuthorityError> {
    tx.commit()
        .await
        .map_err(|e| AuthorityError::Storage(format!("postgres commit failed: {e}")))
}

async fn upsert_account(tx: &mut PgTx, account: &OperatorAccount) -> Result<(), AuthorityError> {
    let pending = serde_json::to_value(&account.pending_invoices)
        .map_err(|e| AuthorityError::Storage(format!("pending invoice encode failed: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO tollbooth_operator_accounts (
            operator_id, balance, total_deposited, total_consumed,
            pending_invoices, registered_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (operator_id) DO UPDATE SET
            balance = EXCLUDED.balance,
            total_deposited = EXCLUDED.total_deposited,
            total_consumed = EXCLUDED.total_consumed,
            pending_invoices = EXCLUDED.pending_invoices,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&account.operator_id)
    .bind(to_db(account.balance, "balance")?)
    .bind(to_db(account.total_deposited, "total_deposited")?)
    .bind(to_db(account.total_consumed, "total_consumed")?)
    .bind(pending)
    .bind(account.registered_at)
    .bind(account.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| AuthorityError::Storage(format!("postgres account upsert failed: {e}")))?;

    Ok(())
}

async fn upsert_invoice(tx: &mut PgTx, invoice: &Invoice) -> Result<(), AuthorityError> {
    sqlx::query(
        r#"
        INSERT INTO tollbooth_invoices (
            invoice_id, operator_id, amount, status, payment_descriptor,
            created_at, settled_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (invoice_id) DO UPDATE SET
            status = EXCLUDED.status,
            settled_at = EXCLUDED.settled_at
        "#,
    )
    .bind(&invoice.invoice_id)
    .bind(&invoice.operator_id)
    .bind(to_db(invoice.amount, "amount")?)
    .bind(invoice.status.as_str())
    .bind(&invoice.payment_descriptor)
    .bind(invoice.created_at)
    .bind(invoice.settled_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| AuthorityError::Storage(format!("postgres invoice upsert failed: {e}")))?;

    Ok(())
}

async fn upsert_supply(tx: &mut PgTx, supply: &SupplyState) -> Result<(), AuthorityError> {
    sqlx::query(
        r#"
        INSERT INTO tollbooth_supply (id, remaining, total_replenished, total_consumed, updated_at)
        VALUES (1, $1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE SET
            remaining = EXCLUDED.remaining,
            total_replenished = EXCLUDED.total_replenished,
            total_consumed = EXCLUDED.total_consumed,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(to_db(supply.remaining, "remaining")?)
    .bind(to_db(supply.total_replenished, "total_replenished")?)
    .bind(to_db(supply.total_consumed, "total_consumed")?)
    .bind(supply.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| AuthorityError::Storage(format!("postgres supply upsert failed: {e}")))?;

    Ok(())
}

fn account_from_row(row: &PgRow) -> Result<OperatorAccount, AuthorityError> {
    let pending: serde_json::Value = get(row, "pending_invoices")?;
    let pending_invoices: BTreeSet<String> = serde_json::from_value(pending)
        .map_err(|e| AuthorityError::Storage(format!("pending invoice decode failed: {e}")))?;

    Ok(OperatorAccount {
        operator_id: get(row, "operator_id")?,
        balance: from_db(get(row, "balance")?, "balance")?,
        total_deposited: from_db(get(row, "total_deposited")?, "total_deposited")?,
        total_consumed: from_db(get(row, "total_consumed")?, "total_consumed")?,
        pending_invoices,
        registered_at: get(row, "registered_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, AuthorityError> {
    let status: String = get(row, "status")?;
    let settled_at: Option<DateTime<Utc>> = get(row, "settled_at")?;

    Ok(Invoice {
        invoice_id: get(row, "invoice_id")?,
        operator_id: get(row, "operator_id")?,
        amount: from_db(get(row, "amount")?, "amount")?,
        status: InvoiceStatus::parse(&status)?,
        payment_descriptor: get(row, "payment_descriptor")?,
        created_at: get(row, "created_at")?,
        settled_at,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, AuthorityError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| AuthorityError::Storage(format!("column '{column}' decode failed: {e}")))
}

fn to_db(value: u64, column: &str) -> Result<i64, AuthorityError> {
    i64::try_from(value)
        .map_err(|_| AuthorityError::Storage(format!("{column} value {value} exceeds BIGINT")))
}

fn from_db(value: i64, column: &str) -> Result<u64, AuthorityError> {
    u64::try_from(value)
        .map_err(|_| AuthorityError::Storage(format!("{column} value {value} is negative")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_state() {
        let store = MemoryAccountStore::new();
        let mut account = OperatorAccount::new("op-a");
        account.apply_credit(50).unwrap();
        let mut supply = SupplyState::empty();
        supply.apply_replenish(1_000).unwrap();

        store.save_certification(&account, &supply).await.unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.accounts, vec![account]);
        assert_eq!(state.supply, Some(supply));
        assert!(state.invoices.is_empty());
    }

    #[tokio::test]
    async fn failing_store_writes_nothing() {
        let store = MemoryAccountStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save_account(&OperatorAccount::new("op-a")).await,
            Err(AuthorityError::Storage(_))
        ));
        assert!(store.load().await.unwrap().accounts.is_empty());
    }

    #[test]
    fn bigint_conversions_reject_out_of_range_values() {
        assert!(to_db(u64::MAX, "balance").is_err());
        assert_eq!(to_db(42, "balance").unwrap(), 42);
        assert!(from_db(-1, "balance").is_err());
    }

    #[test]
    fn storage_config_labels() {
        assert_eq!(AccountStorageConfig::default().label(), "memory");
        assert_eq!(
            AccountStorageConfig::postgres("postgres://localhost/tollbooth", 4).label(),
            "postgres"
        );
    }
}
