//! Client for the upstream OpenAI-compatible model API.

mod client;
mod error;
mod types;

pub use client::ChatClient;
pub use error::UpstreamError;
pub use types::*;
