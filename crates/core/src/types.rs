use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity family a Shopify topic belongs to, derived from the topic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicFamily {
    Customers,
    Products,
    Orders,
    Other,
}

impl TopicFamily {
    /// Classifies topics such as `orders/create` or `customers/update`.
    pub fn classify(topic: &str) -> Self {
        if topic.starts_with("customers") {
            Self::Customers
        } else if topic.starts_with("products") {
            Self::Products
        } else if topic.starts_with("orders") {
            Self::Orders
        } else {
            Self::Other
        }
    }

    /// Label used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Products => "products",
            Self::Orders => "orders",
            Self::Other => "other",
        }
    }
}

/// Canonical customer fields extracted from a vendor payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCustomer {
    /// `None` marks a local-only customer that ingestion never matches.
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub external_id: String,
    pub title: String,
    pub sku: Option<String>,
    pub price_cents: Option<i64>,
    pub inventory: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedLineItem {
    pub product_external_id: Option<String>,
    pub quantity: i64,
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedOrder {
    pub external_id: String,
    pub order_number: Option<String>,
    pub total_cents: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
    pub customer: Option<NormalizedCustomer>,
    pub line_items: Vec<NormalizedLineItem>,
}

/// Result of normalizing one webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Customer(NormalizedCustomer),
    Product(NormalizedProduct),
    Order(NormalizedOrder),
    /// The payload belongs to a known family but lacks the external id that
    /// keys the upsert.
    Skipped {
        family: TopicFamily,
        reason: String,
    },
    /// Topics outside the customer/product/order families.
    Unsupported { topic: String },
}

impl NormalizedEvent {
    pub fn family(&self) -> TopicFamily {
        match self {
            Self::Customer(_) => TopicFamily::Customers,
            Self::Product(_) => TopicFamily::Products,
            Self::Order(_) => TopicFamily::Orders,
            Self::Skipped { family, .. } => *family,
            Self::Unsupported { .. } => TopicFamily::Other,
        }
    }
}
