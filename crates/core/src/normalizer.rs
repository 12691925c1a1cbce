use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::money;
use crate::types::{
    NormalizedCustomer, NormalizedEvent, NormalizedLineItem, NormalizedOrder, NormalizedProduct,
    TopicFamily,
};

const UNTITLED_PRODUCT: &str = "Untitled";

/// Errors that can occur during normalization of incoming webhook payloads.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deterministic normalizer transforming Shopify webhook JSON into [`NormalizedEvent`] values.
///
/// Individual malformed fields degrade to `None`; only a payload that is not
/// an object at all is an error.
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(topic: &str, payload: &Value) -> Result<NormalizedEvent, NormalizerError> {
        match TopicFamily::classify(topic) {
            TopicFamily::Other => Ok(NormalizedEvent::Unsupported {
                topic: topic.to_string(),
            }),
            _ if !payload.is_object() => Err(NormalizerError::NotAnObject),
            TopicFamily::Customers => Self::normalize_customer(payload),
            TopicFamily::Products => Self::normalize_product(payload),
            TopicFamily::Orders => Self::normalize_order(payload),
        }
    }

    fn normalize_customer(payload: &Value) -> Result<NormalizedEvent, NormalizerError> {
        let raw = RawCustomer::deserialize(payload)?;
        let customer = raw.into_normalized();
        if customer.external_id.is_none() {
            return Ok(NormalizedEvent::Skipped {
                family: TopicFamily::Customers,
                reason: "customer payload has no id".to_string(),
            });
        }
        Ok(NormalizedEvent::Customer(customer))
    }

    fn normalize_product(payload: &Value) -> Result<NormalizedEvent, NormalizerError> {
        let raw = RawProduct::deserialize(payload)?;
        let Some(external_id) = raw.id else {
            return Ok(NormalizedEvent::Skipped {
                family: TopicFamily::Products,
                reason: "product payload has no id".to_string(),
            });
        };

        let first_variant = raw.variants.into_iter().next();
        let (sku, price_cents, inventory) = match first_variant {
            Some(variant) => (variant.sku, variant.price, variant.inventory_quantity),
            None => (None, None, None),
        };

        Ok(NormalizedEvent::Product(NormalizedProduct {
            external_id,
            title: raw
                .title
                .or(raw.name)
                .unwrap_or_else(|| UNTITLED_PRODUCT.to_string()),
            sku,
            price_cents,
            inventory,
        }))
    }

    fn normalize_order(payload: &Value) -> Result<NormalizedEvent, NormalizerError> {
        let raw = RawOrder::deserialize(payload)?;
        let Some(external_id) = raw.id else {
            return Ok(NormalizedEvent::Skipped {
                family: TopicFamily::Orders,
                reason: "order payload has no id".to_string(),
            });
        };

        let line_items = raw
            .line_items
            .into_iter()
            .map(|item| NormalizedLineItem {
                product_external_id: item.product_id,
                quantity: item.quantity.unwrap_or(1),
                price_cents: item.price,
            })
            .collect();

        Ok(NormalizedEvent::Order(NormalizedOrder {
            external_id,
            order_number: raw.name.or(raw.order_number),
            total_cents: raw.total_price,
            currency: raw.currency.or(raw.presentment_currency),
            status: raw.financial_status.or(raw.fulfillment_status),
            placed_at: raw.created_at,
            customer: raw.customer.map(RawCustomer::into_normalized),
            line_items,
        }))
    }
}

/// Joins first and last name, falling back to the display name.
fn derive_name(
    first: Option<String>,
    last: Option<String>,
    display: Option<String>,
) -> Option<String> {
    if first.is_some() || last.is_some() {
        let joined = format!(
            "{} {}",
            first.unwrap_or_default(),
            last.unwrap_or_default()
        );
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    display
}

#[derive(Debug, Deserialize)]
struct RawCustomer {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    phone: Option<String>,
}

impl RawCustomer {
    fn into_normalized(self) -> NormalizedCustomer {
        NormalizedCustomer {
            external_id: self.id,
            email: self.email,
            name: derive_name(self.first_name, self.last_name, self.display_name),
            phone: self.phone,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    variants: Vec<RawVariant>,
}

#[derive(Debug, Deserialize)]
struct RawVariant {
    #[serde(default, deserialize_with = "lenient_string")]
    sku: Option<String>,
    #[serde(default, deserialize_with = "lenient_cents")]
    price: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    inventory_quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    order_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_cents")]
    total_price: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    presentment_currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    financial_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    fulfillment_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_object")]
    customer: Option<RawCustomer>,
    #[serde(default, deserialize_with = "lenient_vec")]
    line_items: Vec<RawLineItem>,
}

#[derive(Debug, Deserialize)]
struct RawLineItem {
    #[serde(default, deserialize_with = "lenient_string")]
    product_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    quantity: Option<i64>,
    #[serde(default, deserialize_with = "lenient_cents")]
    price: Option<i64>,
}

// Vendor ids arrive as numbers or strings; empty strings count as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) if !value.trim().is_empty() => Some(value),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_cents<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(money::to_minor_units(&value))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_i64(),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    })
}

fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(None);
    }
    Ok(serde_json::from_value(value).ok())
}

// Elements that are not objects are dropped rather than failing the payload.
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}
