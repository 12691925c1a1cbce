use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use shop_pulse_core::types::{NormalizedCustomer, NormalizedOrder, NormalizedProduct};

/// Transaction type shared by every repository write.
pub type StoreTransaction = Transaction<'static, Sqlite>;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // In-memory databases use a single connection so an open write never
        // locks out readers on the shared cache.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction; dropping it without `commit` rolls it back.
    pub async fn begin(&self) -> Result<StoreTransaction, sqlx::Error> {
        self.pool.begin().await
    }

    pub fn tenants(&self) -> TenantRepository {
        TenantRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the raw webhook event log.
    pub fn events(&self) -> EventRepository {
        EventRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and returns the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get(0)?,
            log_frames: row.try_get(1)?,
            checkpointed_frames: row.try_get(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// Frame counters reported by a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// A connected store. All other entities are scoped to a tenant.
#[derive(Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: String,
    pub store_name: String,
    pub domain: String,
    pub access_token: String,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("store_name", &self.store_name)
            .field("domain", &self.domain)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Repository used to resolve and register tenants.
#[derive(Clone)]
pub struct TenantRepository {
    pool: SqlitePool,
}

impl TenantRepository {
    /// Looks up the tenant owning a shop domain such as `acme.myshopify.com`.
    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, TenantError> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT id, store_name, domain, access_token FROM tenants WHERE domain = ?",
        )
        .bind(normalize_domain(domain))
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    /// Registers a tenant, or replaces the access token of an existing domain.
    pub async fn connect(
        &self,
        domain: &str,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Tenant, TenantError> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(TenantError::InvalidDomain);
        }
        let store_name = domain.split('.').next().unwrap_or(&domain).to_string();
        let timestamp = to_rfc3339(now);

        let tenant = sqlx::query_as::<_, Tenant>(
            "INSERT INTO tenants (id, store_name, domain, access_token, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(domain) DO UPDATE \
             SET access_token = excluded.access_token, updated_at = excluded.updated_at \
             RETURNING id, store_name, domain, access_token",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&store_name)
        .bind(&domain)
        .bind(access_token)
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(tenant)
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant domain must not be empty")]
    InvalidDomain,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the append-only `events` table.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Records an inbound webhook verbatim.
    ///
    /// A second delivery carrying a webhook id already stored for the tenant
    /// reports [`EventInsertOutcome::Duplicate`] instead of failing.
    pub async fn insert(&self, record: NewEvent<'_>) -> Result<EventInsertOutcome, EventError> {
        let result = sqlx::query(
            "INSERT INTO events \
             (id, tenant_id, webhook_id, type, payload, processed, attempts, received_at) \
             VALUES (?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.webhook_id)
        .bind(record.topic)
        .bind(record.payload_json)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(EventInsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) => match db_err.code().as_deref() {
                Some("2067") | Some("1555") => Ok(EventInsertOutcome::Duplicate),
                Some("787") => Err(EventError::MissingTenant),
                _ => Err(EventError::Database(sqlx::Error::Database(db_err))),
            },
            Err(err) => Err(EventError::Database(err)),
        }
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<StoredEvent>, EventError> {
        let event = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    /// Flags the event as fully processed.
    pub async fn mark_processed(&self, id: &str, now: DateTime<Utc>) -> Result<(), EventError> {
        let result = sqlx::query(
            "UPDATE events \
             SET processed = 1, attempts = attempts + 1, last_error = NULL, processed_at = ? \
             WHERE id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventError::NotFound);
        }
        Ok(())
    }

    /// Counts a failed processing attempt and keeps the error for inspection.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<(), EventError> {
        let result = sqlx::query(
            "UPDATE events SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventError::NotFound);
        }
        Ok(())
    }

    /// Lists unprocessed events received at or before `received_before`, oldest first.
    pub async fn list_pending(
        &self,
        received_before: DateTime<Utc>,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, EventError> {
        let events = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE processed = 0 AND attempts < ? AND received_at <= ? \
             ORDER BY received_at ASC, id ASC \
             LIMIT ?"
        ))
        .bind(i64::from(max_attempts))
        .bind(to_rfc3339(received_before))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

const EVENT_COLUMNS: &str = "id, tenant_id, webhook_id, type AS topic, payload, processed, \
                             attempts, last_error, received_at, processed_at";

/// Result of attempting to insert into `events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsertOutcome {
    Inserted,
    Duplicate,
}

impl EventInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Error type for operations on the event repository.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("tenant is missing for incoming payload")]
    MissingTenant,
    #[error("event not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Data required to create a new entry in `events`.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub webhook_id: Option<&'a str>,
    pub topic: &'a str,
    pub payload_json: &'a str,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: String,
    pub tenant_id: String,
    pub webhook_id: Option<String>,
    pub topic: String,
    pub payload: String,
    pub processed: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Errors raised by the insert-or-update repositories.
#[derive(Debug, Error)]
pub enum UpsertError {
    /// A uniqueness constraint other than the upsert key was violated.
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for UpsertError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err)
                if matches!(db_err.code().as_deref(), Some("2067") | Some("1555")) =>
            {
                Self::Conflict(db_err.message().to_string())
            }
            other => Self::Database(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CustomerRow {
    pub id: String,
    pub tenant_id: String,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    /// Inserts or updates the customer keyed by `(tenant_id, external_id)`.
    ///
    /// Returns `None` without touching the table when the customer has no
    /// external id. `created_at` is only written on insert.
    pub async fn upsert(
        &self,
        tx: &mut StoreTransaction,
        tenant_id: &str,
        customer: &NormalizedCustomer,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, UpsertError> {
        let Some(external_id) = customer.external_id.as_deref() else {
            return Ok(None);
        };
        let timestamp = to_rfc3339(now);

        let row = sqlx::query(
            "INSERT INTO customers \
             (id, tenant_id, external_id, email, name, phone, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, external_id) DO UPDATE \
             SET email = excluded.email, \
                 name = excluded.name, \
                 phone = excluded.phone, \
                 updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(external_id)
        .bind(&customer.email)
        .bind(&customer.name)
        .bind(&customer.phone)
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Some(row.get("id")))
    }

    pub async fn fetch_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<CustomerRow>, sqlx::Error> {
        sqlx::query_as::<_, CustomerRow>(
            "SELECT id, tenant_id, external_id, email, name, phone, created_at, updated_at \
             FROM customers WHERE tenant_id = ? AND external_id = ?",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProductRow {
    pub id: String,
    pub tenant_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub sku: Option<String>,
    pub price_cents: Option<i64>,
    pub inventory: Option<i64>,
}

#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    /// Inserts or updates the product keyed by `(tenant_id, external_id)`.
    pub async fn upsert(
        &self,
        tx: &mut StoreTransaction,
        tenant_id: &str,
        product: &NormalizedProduct,
        now: DateTime<Utc>,
    ) -> Result<String, UpsertError> {
        let timestamp = to_rfc3339(now);
        let row = sqlx::query(
            "INSERT INTO products \
             (id, tenant_id, external_id, title, sku, price_cents, inventory, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, external_id) DO UPDATE \
             SET title = excluded.title, \
                 sku = excluded.sku, \
                 price_cents = excluded.price_cents, \
                 inventory = excluded.inventory, \
                 updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(&product.external_id)
        .bind(&product.title)
        .bind(&product.sku)
        .bind(product.price_cents)
        .bind(product.inventory)
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("id"))
    }

    /// Maps a vendor product id to the internal id, if the product is known.
    pub async fn resolve_id(
        &self,
        tx: &mut StoreTransaction,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT id FROM products WHERE tenant_id = ? AND external_id = ?")
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn fetch_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<ProductRow>, sqlx::Error> {
        sqlx::query_as::<_, ProductRow>(
            "SELECT id, tenant_id, external_id, title, sku, price_cents, inventory \
             FROM products WHERE tenant_id = ? AND external_id = ?",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrderRow {
    pub id: String,
    pub tenant_id: String,
    pub external_id: Option<String>,
    pub order_number: Option<String>,
    pub customer_id: Option<String>,
    pub total_cents: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrderItemRow {
    pub id: String,
    pub order_id: String,
    pub product_id: Option<String>,
    pub quantity: i64,
    pub price_cents: Option<i64>,
}

/// Line item ready for insertion, with the product already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: Option<String>,
    pub quantity: i64,
    pub price_cents: Option<i64>,
}

#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Inserts or updates the order keyed by `(tenant_id, external_id)` and
    /// returns its internal id.
    ///
    /// An existing customer link is kept when `customer_id` is `None`.
    pub async fn upsert(
        &self,
        tx: &mut StoreTransaction,
        tenant_id: &str,
        order: &NormalizedOrder,
        customer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, UpsertError> {
        let timestamp = to_rfc3339(now);
        let row = sqlx::query(
            "INSERT INTO orders \
             (id, tenant_id, external_id, order_number, customer_id, total_cents, currency, status, placed_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, external_id) DO UPDATE \
             SET order_number = excluded.order_number, \
                 customer_id = COALESCE(excluded.customer_id, orders.customer_id), \
                 total_cents = excluded.total_cents, \
                 currency = excluded.currency, \
                 status = excluded.status, \
                 placed_at = excluded.placed_at, \
                 updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(&order.external_id)
        .bind(&order.order_number)
        .bind(customer_id)
        .bind(order.total_cents)
        .bind(&order.currency)
        .bind(&order.status)
        .bind(order.placed_at.map(to_rfc3339))
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("id"))
    }

    /// Replaces every line item of the order with `items`.
    pub async fn replace_items(
        &self,
        tx: &mut StoreTransaction,
        order_id: &str,
        items: &[NewOrderItem],
    ) -> Result<u64, UpsertError> {
        sqlx::query("DELETE FROM order_items WHERE order_id = ?")
            .bind(order_id)
            .execute(&mut **tx)
            .await?;

        for item in items {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, product_id, quantity, price_cents) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(order_id)
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(item.price_cents)
            .execute(&mut **tx)
            .await?;
        }

        Ok(items.len() as u64)
    }

    pub async fn fetch_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<OrderRow>, sqlx::Error> {
        sqlx::query_as::<_, OrderRow>(
            "SELECT id, tenant_id, external_id, order_number, customer_id, total_cents, currency, status, placed_at \
             FROM orders WHERE tenant_id = ? AND external_id = ?",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_items(&self, order_id: &str) -> Result<Vec<OrderItemRow>, sqlx::Error> {
        sqlx::query_as::<_, OrderItemRow>(
            "SELECT id, order_id, product_id, quantity, price_cents \
             FROM order_items WHERE order_id = ? ORDER BY rowid",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
