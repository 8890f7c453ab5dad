//! Upstream credential lifecycle for the chat gateway.
//!
//! Access and refresh tokens are stored encrypted per user and provider.
//! [`RefreshCoordinator`] turns them into a continuously valid bearer token,
//! refreshing at most once per user at a time.
//!
//! # Modules
//!
//! - [`coordinator`] - Single-flight refresh and invalidation
//! - [`store`] - Credential persistence (memory, JSON file)
//! - [`cipher`] - AES-256-GCM secret encryption
//! - [`exchange`] - OAuth refresh-token grant client

pub mod cipher;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exchange;
pub mod store;
pub mod types;

pub use cipher::SecretCipher;
pub use config::RefreshConfig;
pub use coordinator::RefreshCoordinator;
pub use error::CredentialError;
pub use exchange::{OAuthTokenClient, TokenExchange};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use types::{BearerToken, Credential, CredentialKind, TokenGrant, UserId};
