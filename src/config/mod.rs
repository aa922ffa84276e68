//! Configuration management module
//!
//! Loads and validates gateway configuration from environment variables and
//! `.env` files; the binary applies CLI overrides on top.

pub mod settings;

pub use settings::{
    DispatchSettings, EgressSettings, Environment, PoolSettings, Settings, UpstreamSettings,
    UserGroups,
};
