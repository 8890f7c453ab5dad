//! File-backed credential store.

use super::{describe, CredentialStore};
use crate::error::CredentialError;
use crate::types::{Credential, CredentialKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Data version for schema migrations.
const DATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialFileData {
    version: u32,
    credentials: Vec<Credential>,
}

impl Default for CredentialFileData {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            credentials: Vec::new(),
        }
    }
}

impl CredentialFileData {
    fn position(&self, user_id: &str, kind: CredentialKind, provider: &str) -> Option<usize> {
        self.credentials
            .iter()
            .position(|c| c.user_id == user_id && c.kind == kind && c.provider == provider)
    }
}

/// Credentials persisted as a JSON file of ciphertexts.
///
/// Every write replaces the file atomically (temp file + rename). A failed
/// write leaves memory unchanged.
pub struct FileCredentialStore {
    data: Mutex<CredentialFileData>,
    storage_path: PathBuf,
}

impl FileCredentialStore {
    pub async fn open(storage_path: PathBuf) -> Result<Self, CredentialError> {
        let data = Self::load(&storage_path).await?;
        Ok(Self {
            data: Mutex::new(data),
            storage_path,
        })
    }

    async fn load(storage_path: &Path) -> Result<CredentialFileData, CredentialError> {
        if !storage_path.exists() {
            info!(
                "Credential file not found at {:?}, starting empty",
                storage_path
            );
            return Ok(CredentialFileData::default());
        }

        let bytes = fs::read(storage_path).await?;
        if bytes.is_empty() {
            warn!("Credential file {:?} is empty, starting empty", storage_path);
            return Ok(CredentialFileData::default());
        }

        let data: CredentialFileData = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded {} credentials from {:?}",
            data.credentials.len(),
            storage_path
        );
        Ok(data)
    }

    async fn persist(&self, data: &CredentialFileData) -> Result<(), CredentialError> {
        let bytes = serde_json::to_vec_pretty(data)?;

        if let Some(parent) = self.storage_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.storage_path.with_extension("tmp");
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, &self.storage_path).await?;

        debug!("Saved {} credentials to {:?}", data.credentials.len(), self.storage_path);
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then commit it to memory.
    async fn write_with<F, T>(&self, change: F) -> Result<T, CredentialError>
    where
        F: FnOnce(&mut CredentialFileData) -> Result<T, CredentialError> + Send,
        T: Send,
    {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *data = next;
        Ok(out)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn find(
        &self,
        user_id: &str,
        kind: CredentialKind,
        provider: &str,
    ) -> Result<Option<Credential>, CredentialError> {
        let data = self.data.lock().await;
        Ok(data
            .position(user_id, kind, provider)
            .map(|i| data.credentials[i].clone()))
    }

    async fn create(&self, credential: Credential) -> Result<(), CredentialError> {
        self.write_with(|data| {
            match data.position(&credential.user_id, credential.kind, &credential.provider) {
                Some(i) => data.credentials[i] = credential,
                None => data.credentials.push(credential),
            }
            Ok(())
        })
        .await
    }

    async fn update(&self, credential: Credential) -> Result<(), CredentialError> {
        self.write_with(|data| {
            match data.position(&credential.user_id, credential.kind, &credential.provider) {
                Some(i) => {
                    data.credentials[i] = credential;
                    Ok(())
                }
                None => Err(CredentialError::NotFound(describe(
                    &credential.user_id,
                    credential.kind,
                    &credential.provider,
                ))),
            }
        })
        .await
    }

    async fn update_if_unchanged(
        &self,
        expected_ciphertext: String,
        credential: Credential,
    ) -> Result<bool, CredentialError> {
        let mut data = self.data.lock().await;
        let Some(i) = data
            .position(&credential.user_id, credential.kind, &credential.provider)
            .filter(|&i| data.credentials[i].ciphertext == expected_ciphertext)
        else {
            return Ok(false);
        };

        let mut next = data.clone();
        next.credentials[i] = credential;
        self.persist(&next).await?;
        *data = next;
        Ok(true)
    }

    async fn delete_many(&self, user_id: &str, provider: &str) -> Result<usize, CredentialError> {
        self.write_with(|data| {
            let before = data.credentials.len();
            data.credentials
                .retain(|c| !(c.user_id == user_id && c.provider == provider));
            Ok(before - data.credentials.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn credential(kind: CredentialKind, ciphertext: &str) -> Credential {
        Credential::new("user-1", "openid", kind, ciphertext.into(), Utc::now())
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");

        {
            let store = FileCredentialStore::open(path.clone()).await.unwrap();
            store
                .create(credential(CredentialKind::Access, "a1"))
                .await
                .unwrap();
            store
                .create(credential(CredentialKind::Refresh, "r1"))
                .await
                .unwrap();
            store
                .update(credential(CredentialKind::Access, "a2"))
                .await
                .unwrap();
        }

        let store = FileCredentialStore::open(path).await.unwrap();
        let access = store
            .find("user-1", CredentialKind::Access, "openid")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.ciphertext, "a2");

        assert_eq!(store.delete_many("user-1", "openid").await.unwrap(), 2);
        assert!(store
            .find("user-1", CredentialKind::Refresh, "openid")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCredentialStore::open(temp_dir.path().join("c.json"))
            .await
            .unwrap();

        let result = store.update(credential(CredentialKind::Access, "a")).await;
        assert!(matches!(result, Err(CredentialError::NotFound(_))));
        // A rejected write never touches the disk.
        assert!(!temp_dir.path().join("c.json").exists());
    }

    #[tokio::test]
    async fn test_conditional_update_persists_only_on_match() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");

        {
            let store = FileCredentialStore::open(path.clone()).await.unwrap();
            store
                .create(credential(CredentialKind::Access, "a1"))
                .await
                .unwrap();
            assert!(!store
                .update_if_unchanged("a0".into(), credential(CredentialKind::Access, "x"))
                .await
                .unwrap());
            assert!(store
                .update_if_unchanged("a1".into(), credential(CredentialKind::Access, "a2"))
                .await
                .unwrap());
        }

        let store = FileCredentialStore::open(path).await.unwrap();
        let access = store
            .find("user-1", CredentialKind::Access, "openid")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(access.ciphertext, "a2");
    }
}
