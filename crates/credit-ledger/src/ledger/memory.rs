//! In-memory balance repository.

use super::BalanceRepository;
use crate::error::MeteringError;
use crate::types::{LocalBalanceRecord, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Balance records held in process memory.
#[derive(Default)]
pub struct MemoryBalanceRepository {
    records: Mutex<HashMap<UserId, LocalBalanceRecord>>,
}

impl MemoryBalanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl BalanceRepository for MemoryBalanceRepository {
    async fn find(&self, user_id: &str) -> Result<Option<LocalBalanceRecord>, MeteringError> {
        Ok(self.records.lock().await.get(user_id).cloned())
    }

    async fn update_if_unchanged(
        &self,
        expected: LocalBalanceRecord,
        record: LocalBalanceRecord,
    ) -> Result<bool, MeteringError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&record.user_id) {
            Some(stored) if *stored == expected => {
                *stored = record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert(&self, record: LocalBalanceRecord) -> Result<(), MeteringError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.user_id) {
            return Err(MeteringError::Conflict(record.user_id));
        }
        records.insert(record.user_id.clone(), record);
        Ok(())
    }
}
