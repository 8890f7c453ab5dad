//! File-backed balance repository.

use super::BalanceRepository;
use crate::error::MeteringError;
use crate::types::{LocalBalanceRecord, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Data version for schema migrations.
const DATA_VERSION: u32 = 1;

/// Persistent data structure for the balance file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BalanceFileData {
    version: u32,
    balances: HashMap<UserId, LocalBalanceRecord>,
}

impl Default for BalanceFileData {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            balances: HashMap::new(),
        }
    }
}

/// Balance records persisted as a JSON file.
///
/// Conditional writes are checked and persisted under one lock, so the
/// compare-and-swap semantics match the in-memory repository. The file is
/// replaced atomically (temp file + rename) on every successful write.
pub struct FileBalanceRepository {
    data: Mutex<BalanceFileData>,
    storage_path: PathBuf,
}

impl FileBalanceRepository {
    /// Open the repository, loading existing data if present.
    pub async fn open(storage_path: PathBuf) -> Result<Self, MeteringError> {
        let data = Self::load(&storage_path).await?;
        Ok(Self {
            data: Mutex::new(data),
            storage_path,
        })
    }

    async fn load(storage_path: &Path) -> Result<BalanceFileData, MeteringError> {
        if !storage_path.exists() {
            info!("Balance file not found at {:?}, starting fresh", storage_path);
            return Ok(BalanceFileData::default());
        }

        let bytes = fs::read(storage_path).await?;
        if bytes.is_empty() {
            warn!("Balance file {:?} is empty, starting fresh", storage_path);
            return Ok(BalanceFileData::default());
        }

        let data: BalanceFileData = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded {} balances from {:?}",
            data.balances.len(),
            storage_path
        );
        Ok(data)
    }

    async fn persist(&self, data: &BalanceFileData) -> Result<(), MeteringError> {
        let bytes = serde_json::to_vec_pretty(data)?;

        if let Some(parent) = self.storage_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.storage_path.with_extension("tmp");
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, &self.storage_path).await?;

        debug!(
            "Saved balance file ({} bytes) to {:?}",
            bytes.len(),
            self.storage_path
        );
        Ok(())
    }
}

#[async_trait]
impl BalanceRepository for FileBalanceRepository {
    async fn find(&self, user_id: &str) -> Result<Option<LocalBalanceRecord>, MeteringError> {
        Ok(self.data.lock().await.balances.get(user_id).cloned())
    }

    async fn update_if_unchanged(
        &self,
        expected: LocalBalanceRecord,
        record: LocalBalanceRecord,
    ) -> Result<bool, MeteringError> {
        let mut data = self.data.lock().await;
        let previous = match data.balances.get(&record.user_id) {
            Some(stored) if *stored == expected => stored.clone(),
            _ => return Ok(false),
        };

        data.balances.insert(record.user_id.clone(), record.clone());
        if let Err(e) = self.persist(&data).await {
            // Keep memory and disk in agreement.
            data.balances.insert(record.user_id, previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn insert(&self, record: LocalBalanceRecord) -> Result<(), MeteringError> {
        let mut data = self.data.lock().await;
        if data.balances.contains_key(&record.user_id) {
            return Err(MeteringError::Conflict(record.user_id));
        }

        let user_id = record.user_id.clone();
        data.balances.insert(user_id.clone(), record);
        if let Err(e) = self.persist(&data).await {
            data.balances.remove(&user_id);
            return Err(e);
        }
        Ok(())
    }
}
