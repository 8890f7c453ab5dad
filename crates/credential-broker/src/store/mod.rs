//! Credential persistence.

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::error::CredentialError;
use crate::types::{Credential, CredentialKind};
use async_trait::async_trait;

/// Storage seam for encrypted credentials, keyed by user, provider and kind.
///
/// Secrets arrive already encrypted; stores never see plaintext.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find(
        &self,
        user_id: &str,
        kind: CredentialKind,
        provider: &str,
    ) -> Result<Option<Credential>, CredentialError>;

    /// Insert or replace a credential.
    async fn create(&self, credential: Credential) -> Result<(), CredentialError>;

    /// Replace an existing credential. Fails with `NotFound` if absent.
    async fn update(&self, credential: Credential) -> Result<(), CredentialError>;

    /// Replace a credential only if the stored ciphertext still equals
    /// `expected_ciphertext`. Returns `false` when it changed or is absent.
    async fn update_if_unchanged(
        &self,
        expected_ciphertext: String,
        credential: Credential,
    ) -> Result<bool, CredentialError>;

    /// Delete both kinds for a user and provider. Returns how many were removed.
    async fn delete_many(&self, user_id: &str, provider: &str) -> Result<usize, CredentialError>;
}

/// Update if present, create otherwise.
pub async fn upsert(
    store: &dyn CredentialStore,
    credential: Credential,
) -> Result<(), CredentialError> {
    match store.update(credential.clone()).await {
        Err(CredentialError::NotFound(_)) => store.create(credential).await,
        other => other,
    }
}

fn describe(user_id: &str, kind: CredentialKind, provider: &str) -> String {
    format!("{} {} credential for {}", provider, kind, user_id)
}
