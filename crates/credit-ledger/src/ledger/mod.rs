//! Local balance ledger with optimistic concurrency control.
//!
//! Every write goes through a compare-and-swap loop: read the record,
//! compute the new value, and write it back only if the stored record
//! still matches what was read. Conflicting writers retry with jittered
//! exponential backoff, so concurrent decrements are never lost and the
//! balance never drops below zero.

mod file;
mod memory;

pub use file::FileBalanceRepository;
pub use memory::MemoryBalanceRepository;

use crate::config::LedgerConfig;
use crate::error::MeteringError;
use crate::transactions::TransactionLog;
use crate::types::{
    to_micros, Admission, BalanceUpdate, LocalBalanceRecord, MicroCredits, Reservation,
    Transaction, TransactionType,
};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Persistence seam for balance records.
///
/// Implementations must make both conditional operations atomic with
/// respect to each other.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Load the record for a user.
    async fn find(&self, user_id: &str) -> Result<Option<LocalBalanceRecord>, MeteringError>;

    /// Replace the stored record only if it still equals `expected` in every field.
    ///
    /// Returns `false` when another writer got there first (or the record vanished).
    async fn update_if_unchanged(
        &self,
        expected: LocalBalanceRecord,
        record: LocalBalanceRecord,
    ) -> Result<bool, MeteringError>;

    /// Insert a new record. Fails with [`MeteringError::Conflict`] if one exists.
    async fn insert(&self, record: LocalBalanceRecord) -> Result<(), MeteringError>;
}

/// Optimistic-concurrency ledger for the self-hosted accounting path.
pub struct LocalLedger {
    repo: Arc<dyn BalanceRepository>,
    config: LedgerConfig,
    audit: Option<Arc<dyn TransactionLog>>,
}

impl LocalLedger {
    pub fn new(repo: Arc<dyn BalanceRepository>, config: LedgerConfig) -> Self {
        Self {
            repo,
            config,
            audit: None,
        }
    }

    /// Record auto-refills in the given transaction log.
    pub fn with_audit(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.audit = Some(log);
        self
    }

    /// Add `delta` (negative for spends) to a user's balance, clamping at zero.
    ///
    /// Optional `extra` fields are written in the same conditional update.
    /// Fails with [`MeteringError::ConcurrencyExhausted`] if the write could not
    /// land within the configured number of attempts; in that case nothing
    /// was applied.
    #[instrument(skip(self, extra))]
    pub async fn apply_delta(
        &self,
        user_id: &str,
        delta: MicroCredits,
        extra: Option<&BalanceUpdate>,
    ) -> Result<LocalBalanceRecord, MeteringError> {
        let updated = self
            .update_with(user_id, |current| {
                let mut next = current.clone();
                next.token_credits = current.token_credits.saturating_add(delta);
                if let Some(extra) = extra {
                    extra.apply_to(&mut next);
                }
                Some(next)
            })
            .await?;

        // The closure above never declines.
        updated.ok_or_else(|| MeteringError::Storage("ledger update declined".into()))
    }

    /// Current balance, creating the record with the start balance if needed.
    pub async fn balance(&self, user_id: &str) -> Result<MicroCredits, MeteringError> {
        Ok(self.ensure_record(user_id).await?.token_credits)
    }

    /// Load a record, inserting one with the configured start balance if absent.
    pub async fn ensure_record(&self, user_id: &str) -> Result<LocalBalanceRecord, MeteringError> {
        if let Some(record) = self.repo.find(user_id).await? {
            return Ok(record);
        }

        let record = self.new_record(user_id);
        if record.token_credits == 0 {
            return Ok(record);
        }

        match self.repo.insert(record.clone()).await {
            Ok(()) => {
                info!(
                    "Created balance for {} with start balance {}",
                    user_id, record.token_credits
                );
                Ok(record)
            }
            // Someone else created it concurrently; theirs wins.
            Err(MeteringError::Conflict(_)) => self
                .repo
                .find(user_id)
                .await?
                .ok_or_else(|| MeteringError::Storage(format!("balance for {} vanished", user_id))),
            Err(e) => Err(e),
        }
    }

    /// Apply an auto-refill if one is due. Returns the refilled record.
    #[instrument(skip(self))]
    pub async fn refill_if_due(
        &self,
        user_id: &str,
    ) -> Result<Option<LocalBalanceRecord>, MeteringError> {
        let now = Utc::now();
        let refilled = self
            .update_with(user_id, |current| {
                if !current.refill_due(now) {
                    return None;
                }
                let mut next = current.clone();
                next.token_credits = current.token_credits.saturating_add(current.refill_amount);
                next.last_refill = Some(now);
                Some(next)
            })
            .await?;

        if let Some(record) = &refilled {
            info!(
                "Auto-refilled {} with {} micro-credits",
                user_id, record.refill_amount
            );
            if let Some(log) = &self.audit {
                let tx = Transaction::new(
                    user_id,
                    TransactionType::Credits,
                    record.refill_amount.max(0) as u64,
                    1.0,
                    record.refill_amount,
                    "",
                    "autoRefill",
                );
                if let Err(e) = log.append(tx).await {
                    warn!("Failed to audit refill for {}: {}", user_id, e);
                }
            }
        }

        Ok(refilled)
    }

    /// Admission check against the local balance.
    ///
    /// Applies a due auto-refill first. The ledger is its own authority, so
    /// the returned reservation is untracked.
    pub async fn check(
        &self,
        user_id: &str,
        required: MicroCredits,
    ) -> Result<Admission, MeteringError> {
        if required <= 0 {
            return Ok(Admission::Granted(Reservation::untracked(user_id, 0)));
        }

        self.refill_if_due(user_id).await?;
        let balance = self.balance(user_id).await?;

        if balance >= required {
            Ok(Admission::Granted(Reservation::untracked(user_id, required)))
        } else {
            debug!(
                "Insufficient local balance for {}: {} < {}",
                user_id, balance, required
            );
            Ok(Admission::Insufficient { balance, required })
        }
    }

    /// Compare-and-swap loop shared by every write path.
    ///
    /// `mutate` sees the freshly read record (the start balance if absent) on
    /// every attempt and may return `None` to abandon the update.
    async fn update_with<F>(
        &self,
        user_id: &str,
        mut mutate: F,
    ) -> Result<Option<LocalBalanceRecord>, MeteringError>
    where
        F: FnMut(&LocalBalanceRecord) -> Option<LocalBalanceRecord> + Send,
    {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(
                    "Ledger conflict for {}, retry {} after {:?}",
                    user_id, attempt, delay
                );
                sleep(delay).await;
            }

            let current = self.repo.find(user_id).await?;
            let exists = current.is_some();
            let base = current.unwrap_or_else(|| self.new_record(user_id));

            let Some(mut next) = mutate(&base) else {
                return Ok(None);
            };
            next.user_id = user_id.to_string();
            next.token_credits = next.token_credits.max(0);

            let landed = if exists {
                self.repo
                    .update_if_unchanged(base.clone(), next.clone())
                    .await?
            } else {
                match self.repo.insert(next.clone()).await {
                    Ok(()) => true,
                    Err(MeteringError::Conflict(_)) => false,
                    Err(e) => return Err(e),
                }
            };

            if landed {
                debug!(
                    "Ledger update for {}: {} -> {}",
                    user_id, base.token_credits, next.token_credits
                );
                return Ok(Some(next));
            }
        }

        warn!(
            "Ledger update for {} abandoned after {} attempts",
            user_id, max_attempts
        );
        Err(MeteringError::ConcurrencyExhausted {
            user_id: user_id.to_string(),
            attempts: max_attempts,
        })
    }

    /// A fresh record holding the configured start balance.
    fn new_record(&self, user_id: &str) -> LocalBalanceRecord {
        let mut record = LocalBalanceRecord::new(user_id);
        record.token_credits = to_micros(self.config.start_balance).max(0);
        record
    }

    /// Exponential backoff with equal jitter, capped at `max_delay`.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as u64;
        let cap = self.config.max_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (retry - 1).min(20)).min(cap);
        let half = exp / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(half + jitter)
    }
}
