//! Prepaid credit metering for the chat gateway.
//!
//! Every request is admitted against the user's balance before the upstream
//! call and charged from the reported token usage afterwards.
//!
//! # Architecture
//!
//! ```text
//! admit ──► BalanceCache ──► BalanceAuthority (remote mode)
//!       └─► LocalLedger (local mode)
//! usage ──► PricingCalculator ──► TransactionLog ──► report / apply_delta
//! ```
//!
//! # Modules
//!
//! - [`rates`] - Rate table and charge rounding
//! - [`cache`] - Short-TTL balance cache with pending reservations
//! - [`ledger`] - Optimistic-concurrency local ledger
//! - [`remote`] - Remote balance authority client
//! - [`spend`] - Spend recorder tying pricing, audit and charging together
//! - [`transactions`] - Append-only audit log
//!
//! # Overspend window
//!
//! In remote mode admission is answered from a cached balance for up to
//! `cache.ttl`, and from a cache fetched up to `cache.max_staleness` ago
//! while the authority is unreachable. Within that window requests that were
//! admitted but not yet reported can overspend the authoritative balance.
//! The bound is per process; replicas do not share caches.

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod rates;
pub mod remote;
pub mod spend;
pub mod transactions;
pub mod types;

// Re-exports for convenience
pub use cache::{BalanceCache, BalanceSnapshot};
pub use config::{CacheConfig, LedgerConfig, LedgerMode, MeteringConfig, PricingConfig, RemoteConfig};
pub use error::{MeteringError, RemoteError};
pub use ledger::{BalanceRepository, FileBalanceRepository, LocalLedger, MemoryBalanceRepository};
pub use rates::{round_charge, ModelRates, PricedCharge, PricingCalculator, RateTable};
pub use remote::{BalanceAuthority, HttpBalanceAuthority, UsageReceipt};
pub use spend::{ChargeTarget, SpendRecorder};
pub use transactions::{JsonlTransactionLog, MemoryTransactionLog, TransactionLog};
pub use types::{
    format_credits, to_credits, to_micros, Admission, BalanceUpdate, IntervalUnit,
    LocalBalanceRecord, MicroCredits, Reservation, SpendContext, SpendOutcome, TokenCategory,
    TokenUsage, Transaction, TransactionType, UserId,
};
