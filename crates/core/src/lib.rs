//! Domain layer for Shopify webhook ingestion.
//!
//! Everything here is pure: signature checks, money conversion, and the
//! normalization boundary that turns loosely typed vendor JSON into the
//! canonical structs persisted by the storage crate.

pub mod money;
pub mod normalizer;
pub mod signature;
pub mod types;
