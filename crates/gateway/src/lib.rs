//! Credit-metered chat gateway.
//!
//! Every request resolves a valid upstream credential for the user, is
//! admitted against their credit balance, forwarded to the model API and
//! charged from the reported usage.
//!
//! # Modules
//!
//! - [`pipeline`] - The per-request flow
//! - [`driver`] - JSON-lines front end
//! - [`config`] - Environment configuration
//! - [`error`] - Error codes shown to clients

pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;

pub use config::Config;
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use pipeline::{GatewayReply, GatewayRequest, Pipeline};
