//! Error types

mod types;

pub use types::{ApiError, BASIC_CHALLENGE};
