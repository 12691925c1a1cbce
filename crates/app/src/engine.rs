use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use shop_pulse_core::types::{
    NormalizedCustomer, NormalizedEvent, NormalizedOrder, NormalizedProduct, TopicFamily,
};
use shop_pulse_storage::{Database, NewOrderItem, UpsertError};

/// Writes normalized entities into the tenant's tables.
///
/// Every routine runs inside a single transaction. Any error drops the
/// transaction before commit, so a failed delivery leaves no partial rows.
#[derive(Clone)]
pub struct UpsertEngine {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl UpsertEngine {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn apply(
        &self,
        tenant_id: &str,
        event: &NormalizedEvent,
    ) -> Result<ApplyOutcome, EngineError> {
        match event {
            NormalizedEvent::Customer(customer) => self.apply_customer(tenant_id, customer).await,
            NormalizedEvent::Product(product) => self.apply_product(tenant_id, product).await,
            NormalizedEvent::Order(order) => self.apply_order(tenant_id, order).await,
            NormalizedEvent::Skipped { family, reason } => Ok(ApplyOutcome::Skipped {
                family: *family,
                reason: reason.clone(),
            }),
            NormalizedEvent::Unsupported { topic } => Ok(ApplyOutcome::Unsupported {
                topic: topic.clone(),
            }),
        }
    }

    async fn apply_customer(
        &self,
        tenant_id: &str,
        customer: &NormalizedCustomer,
    ) -> Result<ApplyOutcome, EngineError> {
        let now = (self.clock)();
        let mut tx = self.database.begin().await?;
        let id = self
            .database
            .customers()
            .upsert(&mut tx, tenant_id, customer, now)
            .await?;
        tx.commit().await?;

        match id {
            Some(id) => Ok(ApplyOutcome::Customer { id }),
            None => Ok(ApplyOutcome::Skipped {
                family: TopicFamily::Customers,
                reason: "customer payload has no id".to_string(),
            }),
        }
    }

    async fn apply_product(
        &self,
        tenant_id: &str,
        product: &NormalizedProduct,
    ) -> Result<ApplyOutcome, EngineError> {
        let now = (self.clock)();
        let mut tx = self.database.begin().await?;
        let id = self
            .database
            .products()
            .upsert(&mut tx, tenant_id, product, now)
            .await?;
        tx.commit().await?;
        Ok(ApplyOutcome::Product { id })
    }

    async fn apply_order(
        &self,
        tenant_id: &str,
        order: &NormalizedOrder,
    ) -> Result<ApplyOutcome, EngineError> {
        let now = (self.clock)();
        let customers = self.database.customers();
        let products = self.database.products();
        let orders = self.database.orders();

        let mut tx = self.database.begin().await?;

        let customer_id = match &order.customer {
            Some(customer) => customers.upsert(&mut tx, tenant_id, customer, now).await?,
            None => None,
        };

        let order_id = orders
            .upsert(&mut tx, tenant_id, order, customer_id.as_deref(), now)
            .await?;

        let mut items = Vec::with_capacity(order.line_items.len());
        for line in &order.line_items {
            let product_id = match line.product_external_id.as_deref() {
                Some(external_id) => products.resolve_id(&mut tx, tenant_id, external_id).await?,
                None => None,
            };
            items.push(NewOrderItem {
                product_id,
                quantity: line.quantity,
                price_cents: line.price_cents,
            });
        }

        let written = orders.replace_items(&mut tx, &order_id, &items).await?;
        tx.commit().await?;

        debug!(
            stage = "engine",
            tenant_id,
            order_id = %order_id,
            items = written,
            "order upserted"
        );
        Ok(ApplyOutcome::Order {
            id: order_id,
            customer_id,
            items: written,
        })
    }
}

/// What a successful [`UpsertEngine::apply`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Customer {
        id: String,
    },
    Product {
        id: String,
    },
    Order {
        id: String,
        customer_id: Option<String>,
        items: u64,
    },
    Skipped {
        family: TopicFamily,
        reason: String,
    },
    Unsupported {
        topic: String,
    },
}

impl ApplyOutcome {
    /// Entity label used in metrics and logs.
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Customer { .. } => TopicFamily::Customers.as_str(),
            Self::Product { .. } => TopicFamily::Products.as_str(),
            Self::Order { .. } => TopicFamily::Orders.as_str(),
            Self::Skipped { family, .. } => family.as_str(),
            Self::Unsupported { .. } => TopicFamily::Other.as_str(),
        }
    }

    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Customer { .. } | Self::Product { .. } | Self::Order { .. } => "applied",
            Self::Skipped { .. } => "skipped",
            Self::Unsupported { .. } => "ignored",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Upsert(#[from] UpsertError),
    #[error("transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Upsert(UpsertError::Conflict(_)))
    }
}
