//! Spend recording: price usage, audit it, then charge the active ledger.

use crate::cache::BalanceCache;
use crate::config::{LedgerMode, MeteringConfig};
use crate::error::MeteringError;
use crate::ledger::{FileBalanceRepository, LocalLedger, MemoryBalanceRepository};
use crate::rates::PricingCalculator;
use crate::remote::HttpBalanceAuthority;
use crate::transactions::{JsonlTransactionLog, MemoryTransactionLog, TransactionLog};
use crate::types::{
    Admission, MicroCredits, Reservation, SpendContext, SpendOutcome, TokenCategory, TokenUsage,
    Transaction,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Where charges land.
pub enum ChargeTarget {
    /// Usage is reported to the remote authority; admission goes through the cache.
    Remote(Arc<BalanceCache>),
    /// Usage is deducted from the local optimistic ledger.
    Local(Arc<LocalLedger>),
}

/// Records spends against whichever ledger is active.
pub struct SpendRecorder {
    pricing: PricingCalculator,
    log: Arc<dyn TransactionLog>,
    target: ChargeTarget,
}

impl SpendRecorder {
    pub fn new(
        pricing: PricingCalculator,
        log: Arc<dyn TransactionLog>,
        target: ChargeTarget,
    ) -> Self {
        Self {
            pricing,
            log,
            target,
        }
    }

    /// Build the recorder and its stores from configuration.
    ///
    /// In remote mode this also starts the cache eviction sweep.
    pub async fn from_config(config: &MeteringConfig) -> Result<Self, MeteringError> {
        config.pricing.validate()?;

        let log: Arc<dyn TransactionLog> = match &config.transaction_log_path {
            Some(path) => Arc::new(JsonlTransactionLog::new(path.clone())),
            None => Arc::new(MemoryTransactionLog::new()),
        };

        let target = match config.mode {
            LedgerMode::Remote => {
                let remote = config.remote.as_ref().ok_or_else(|| {
                    MeteringError::Config("remote mode requires a remote authority".into())
                })?;
                let authority = HttpBalanceAuthority::from_config(remote)?;
                let cache = Arc::new(BalanceCache::new(
                    Arc::new(authority),
                    config.cache.clone(),
                    remote.timeout,
                ));
                cache.spawn_sweeper();
                info!("Metering against remote authority at {}", remote.base_url);
                ChargeTarget::Remote(cache)
            }
            LedgerMode::Local => {
                let ledger = match &config.ledger.storage_path {
                    Some(path) => {
                        let repo = FileBalanceRepository::open(path.clone()).await?;
                        LocalLedger::new(Arc::new(repo), config.ledger.clone())
                    }
                    None => LocalLedger::new(
                        Arc::new(MemoryBalanceRepository::new()),
                        config.ledger.clone(),
                    ),
                };
                info!("Metering against local ledger");
                ChargeTarget::Local(Arc::new(ledger.with_audit(log.clone())))
            }
        };

        Ok(Self::new(
            PricingCalculator::new(config.pricing.clone()),
            log,
            target,
        ))
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    pub fn target(&self) -> &ChargeTarget {
        &self.target
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionLog> {
        &self.log
    }

    /// USD per million tokens for a model and category.
    pub fn price_of(&self, model: &str, category: TokenCategory) -> f64 {
        self.pricing.table().price_of(model, category)
    }

    /// Credits required to admit a message of `message_chars` characters.
    pub fn estimate(
        &self,
        model: &str,
        message_chars: usize,
        max_completion_tokens: Option<u64>,
    ) -> MicroCredits {
        self.pricing
            .estimate(model, message_chars, max_completion_tokens)
    }

    /// Admission check against the active ledger.
    pub async fn admit(
        &self,
        user_id: &str,
        required: MicroCredits,
    ) -> Result<Admission, MeteringError> {
        match &self.target {
            ChargeTarget::Remote(cache) => cache.reserve(user_id, required).await,
            ChargeTarget::Local(ledger) => ledger.check(user_id, required).await,
        }
    }

    /// Release a reservation obtained from [`admit`](Self::admit).
    pub async fn release(&self, reservation: &Reservation) {
        if let ChargeTarget::Remote(cache) = &self.target {
            cache.release(reservation).await;
        }
    }

    /// Price and charge one category of tokens.
    ///
    /// The transaction is appended before the ledger is touched. If the
    /// charge then fails the error is returned and the transaction stays.
    #[instrument(skip(self))]
    pub async fn record_spend(
        &self,
        user_id: &str,
        model: &str,
        category: TokenCategory,
        raw_tokens: u64,
        context: SpendContext,
    ) -> Result<SpendOutcome, MeteringError> {
        let priced = self.pricing.price(model, category, raw_tokens, context);

        let tx = Transaction::new(
            user_id,
            category.into(),
            raw_tokens,
            priced.rate,
            priced.credits,
            model,
            context.to_string(),
        );
        self.log.append(tx).await?;

        if priced.credits == 0 {
            return Ok(SpendOutcome {
                credits_charged: 0,
                new_balance: None,
            });
        }

        let new_balance = match &self.target {
            ChargeTarget::Remote(cache) => {
                let description = format!("{} {} tokens ({})", model, category, context);
                let receipt = cache
                    .authority()
                    .report_usage(user_id, priced.credits, &description)
                    .await
                    .map_err(|e| {
                        error!("Usage report for {} failed: {}", user_id, e);
                        MeteringError::from(e)
                    })?;
                cache
                    .apply_charge(user_id, priced.credits, receipt.balance)
                    .await;
                receipt.balance
            }
            ChargeTarget::Local(ledger) => {
                let record = ledger
                    .apply_delta(user_id, -priced.credits, None)
                    .await
                    .map_err(|e| {
                        error!("Ledger charge for {} failed: {}", user_id, e);
                        e
                    })?;
                Some(record.token_credits)
            }
        };

        Ok(SpendOutcome {
            credits_charged: priced.credits,
            new_balance,
        })
    }

    /// Record prompt and completion tokens of one call.
    ///
    /// Stops at the first failed charge; the prompt charge is not undone.
    pub async fn record_usage(
        &self,
        user_id: &str,
        model: &str,
        usage: TokenUsage,
        context: SpendContext,
    ) -> Result<SpendOutcome, MeteringError> {
        let prompt = self
            .record_spend(
                user_id,
                model,
                TokenCategory::Prompt,
                usage.prompt_tokens,
                context,
            )
            .await?;
        let completion = self
            .record_spend(
                user_id,
                model,
                TokenCategory::Completion,
                usage.completion_tokens,
                context,
            )
            .await?;

        Ok(SpendOutcome {
            credits_charged: prompt.credits_charged + completion.credits_charged,
            new_balance: completion.new_balance.or(prompt.new_balance),
        })
    }
}
