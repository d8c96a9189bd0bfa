//! Offline caching for the ticketing web client.
//!
//! This module provides:
//! - Named, versioned cache buckets for app-shell and sub-resource responses
//! - Rule-based classification of requests into caching strategies
//! - Cache-first, network-first and dynamic strategies with their fallbacks

mod error;
mod layer;
mod routing;
mod storage;

pub use error::StoreError;
pub use layer::CacheLayer;
pub use routing::{Route, Router, Rule, Strategy};
pub use storage::{CacheStorage, SqliteStorage};
