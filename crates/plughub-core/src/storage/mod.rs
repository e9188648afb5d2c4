//! Persistence layer
//!
//! SQLite-based storage for:
//! - Plugin metadata, installations and routes (the plugin registry)
//! - Marketplace catalog records

mod database;
mod marketplace;
mod registry;

pub use database::{Database, SharedDatabase};
pub use marketplace::MarketplaceStore;
pub use registry::SqliteRegistry;
