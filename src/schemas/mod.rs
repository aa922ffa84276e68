//! API schema definitions
//!
//! Wire types of the OpenAI-compatible chat API and the credential admin API.

pub mod admin;
pub mod openai;
