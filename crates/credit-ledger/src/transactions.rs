//! Append-only transaction log.

use crate::error::MeteringError;
use crate::types::Transaction;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Audit sink for spends and refills. Records are never mutated.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Append a transaction.
    async fn append(&self, tx: Transaction) -> Result<(), MeteringError>;

    /// All transactions of a user, oldest first.
    async fn list(&self, user_id: &str) -> Result<Vec<Transaction>, MeteringError>;
}

/// In-memory transaction log.
#[derive(Default)]
pub struct MemoryTransactionLog {
    entries: RwLock<Vec<Transaction>>,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of transactions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TransactionLog for MemoryTransactionLog {
    async fn append(&self, tx: Transaction) -> Result<(), MeteringError> {
        self.entries.write().await.push(tx);
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Transaction>, MeteringError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Transaction log stored as newline-delimited JSON.
pub struct JsonlTransactionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTransactionLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TransactionLog for JsonlTransactionLog {
    async fn append(&self, tx: Transaction) -> Result<(), MeteringError> {
        let mut line = serde_json::to_vec(&tx)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!("Appended transaction {} for {}", tx.id, tx.user_id);
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Transaction>, MeteringError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let tx: Transaction = serde_json::from_str(line)?;
            if tx.user_id == user_id {
                out.push(tx);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionType;
    use tempfile::TempDir;

    fn sample(user_id: &str, value: i64) -> Transaction {
        Transaction::new(
            user_id,
            TransactionType::Prompt,
            1_000,
            2.5,
            value,
            "gpt-4o",
            "message",
        )
    }

    #[tokio::test]
    async fn test_memory_log_filters_by_user() {
        let log = MemoryTransactionLog::new();
        log.append(sample("a", 1)).await.unwrap();
        log.append(sample("b", 2)).await.unwrap();
        log.append(sample("a", 3)).await.unwrap();

        let history = log.list("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].token_value, 3);
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn test_jsonl_log_appends() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlTransactionLog::new(temp_dir.path().join("audit/tx.jsonl"));

        assert!(log.list("a").await.unwrap().is_empty());

        log.append(sample("a", 10)).await.unwrap();
        log.append(sample("a", 20)).await.unwrap();

        let history = log.list("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].token_value, 10);
        assert_eq!(history[0].model, "gpt-4o");
    }
}
