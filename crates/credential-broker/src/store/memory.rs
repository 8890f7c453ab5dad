//! In-memory credential store.

use super::{describe, CredentialStore};
use crate::error::CredentialError;
use crate::types::{Credential, CredentialKind};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

type Key = (String, String, CredentialKind);

/// Credentials held in process memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<Key, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.credentials.read().await.len()
    }
}

fn key_of(credential: &Credential) -> Key {
    (
        credential.user_id.clone(),
        credential.provider.clone(),
        credential.kind,
    )
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(
        &self,
        user_id: &str,
        kind: CredentialKind,
        provider: &str,
    ) -> Result<Option<Credential>, CredentialError> {
        let key = (user_id.to_string(), provider.to_string(), kind);
        Ok(self.credentials.read().await.get(&key).cloned())
    }

    async fn create(&self, credential: Credential) -> Result<(), CredentialError> {
        self.credentials
            .write()
            .await
            .insert(key_of(&credential), credential);
        Ok(())
    }

    async fn update(&self, credential: Credential) -> Result<(), CredentialError> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&key_of(&credential)) {
            Some(stored) => {
                *stored = credential;
                Ok(())
            }
            None => Err(CredentialError::NotFound(describe(
                &credential.user_id,
                credential.kind,
                &credential.provider,
            ))),
        }
    }

    async fn update_if_unchanged(
        &self,
        expected_ciphertext: String,
        credential: Credential,
    ) -> Result<bool, CredentialError> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&key_of(&credential)) {
            Some(stored) if stored.ciphertext == expected_ciphertext => {
                *stored = credential;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_many(&self, user_id: &str, provider: &str) -> Result<usize, CredentialError> {
        let mut credentials = self.credentials.write().await;
        let before = credentials.len();
        credentials.retain(|(user, prov, _), _| !(user == user_id && prov == provider));
        Ok(before - credentials.len())
    }
}
