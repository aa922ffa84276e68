//! API endpoint handlers module
//!
//! Contains all HTTP endpoint handler implementations.

pub mod chat_completions;
pub mod credentials;
pub mod health;
pub mod metrics;
pub mod models;
