//! Metered balance cache with pending-reservation accounting.
//!
//! Admission checks are answered from a short-lived copy of the remote
//! balance. Every granted check holds a reservation against that copy until
//! the charge is applied or the reservation expires, so concurrent requests
//! inside one cache window see each other's holds.
//!
//! The cache does not give strict consistency with the authority. Between
//! two authoritative fetches a user can overspend by at most the credits
//! admitted inside one TTL window, and the bound is per process.

use crate::config::CacheConfig;
use crate::error::{MeteringError, RemoteError};
use crate::remote::BalanceAuthority;
use crate::types::{Admission, MicroCredits, Reservation, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
struct PendingHold {
    amount: MicroCredits,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheEntry {
    remote_credits: MicroCredits,
    /// Last time the entry was used to admit a request or was rebuilt.
    observed_at: Instant,
    /// Last authoritative fetch (or authoritative receipt).
    fetched_at: Instant,
    holds: HashMap<u64, PendingHold>,
}

impl CacheEntry {
    fn new(remote_credits: MicroCredits, now: Instant) -> Self {
        Self {
            remote_credits,
            observed_at: now,
            fetched_at: now,
            holds: HashMap::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.holds.retain(|_, hold| hold.expires_at > now);
    }

    fn pending_reserved(&self) -> MicroCredits {
        self.holds.values().map(|hold| hold.amount).sum()
    }

    fn available(&self) -> MicroCredits {
        self.remote_credits - self.pending_reserved()
    }
}

/// Point-in-time view of a cached balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub remote_credits: MicroCredits,
    pub pending_reserved: MicroCredits,
    pub available: MicroCredits,
    /// Time since the last authoritative fetch.
    pub age: Duration,
}

/// Cache in front of a [`BalanceAuthority`].
pub struct BalanceCache {
    authority: Arc<dyn BalanceAuthority>,
    config: CacheConfig,
    call_timeout: Duration,
    entries: Mutex<HashMap<UserId, CacheEntry>>,
    next_ticket: AtomicU64,
}

impl BalanceCache {
    pub fn new(
        authority: Arc<dyn BalanceAuthority>,
        config: CacheConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            config,
            call_timeout,
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn authority(&self) -> &Arc<dyn BalanceAuthority> {
        &self.authority
    }

    /// Try to hold `required` credits for a user.
    ///
    /// Answers from a fresh entry when it covers the amount. Otherwise the
    /// authority is asked; if it cannot be reached, an entry fetched within
    /// `max_staleness` may still admit the request. Outstanding holds always
    /// count against the balance, including across a rebuild.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        user_id: &str,
        required: MicroCredits,
    ) -> Result<Admission, MeteringError> {
        if required <= 0 {
            return Ok(Admission::Granted(Reservation::untracked(user_id, 0)));
        }

        {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            if let Some(entry) = entries.get_mut(user_id) {
                entry.purge_expired(now);
                let fresh = now.duration_since(entry.observed_at) <= self.config.ttl;
                if fresh && entry.available() >= required {
                    return Ok(Admission::Granted(self.hold(entry, user_id, required, now)));
                }
            }
        }

        match self.fetch(user_id).await {
            Ok(remote_credits) => {
                let mut entries = self.entries.lock().await;
                let now = Instant::now();
                let entry = entries
                    .entry(user_id.to_string())
                    .or_insert_with(|| CacheEntry::new(remote_credits, now));
                entry.remote_credits = remote_credits;
                entry.observed_at = now;
                entry.fetched_at = now;
                entry.purge_expired(now);

                let available = entry.available();
                if available >= required {
                    Ok(Admission::Granted(self.hold(entry, user_id, required, now)))
                } else {
                    debug!(
                        "Insufficient balance for {}: {} available, {} required",
                        user_id, available, required
                    );
                    Ok(Admission::Insufficient {
                        balance: available,
                        required,
                    })
                }
            }
            Err(e) => {
                let mut entries = self.entries.lock().await;
                let now = Instant::now();
                if let Some(entry) = entries.get_mut(user_id) {
                    entry.purge_expired(now);
                    let age = now.duration_since(entry.fetched_at);
                    if age <= self.config.max_staleness && entry.available() >= required {
                        warn!(
                            "Balance authority unavailable for {} ({}); admitting from cache fetched {:?} ago",
                            user_id, e, age
                        );
                        return Ok(Admission::Granted(self.hold(entry, user_id, required, now)));
                    }
                }
                warn!("Balance authority unavailable for {}: {}", user_id, e);
                Err(MeteringError::from(e))
            }
        }
    }

    /// Drop a hold. Releasing twice, or releasing an expired hold, is a no-op.
    pub async fn release(&self, reservation: &Reservation) {
        let Some(ticket) = reservation.ticket else {
            return;
        };

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&reservation.user_id) {
            if entry.holds.remove(&ticket).is_some() {
                debug!(
                    "Released {} for {}",
                    reservation.amount, reservation.user_id
                );
            }
        }
    }

    /// Reflect a reported charge in the cached balance.
    ///
    /// When the authority returned the post-debit balance it replaces the
    /// cached value; otherwise the charge is subtracted locally.
    pub async fn apply_charge(
        &self,
        user_id: &str,
        amount: MicroCredits,
        reported_balance: Option<MicroCredits>,
    ) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get_mut(user_id) {
            match reported_balance {
                Some(balance) => {
                    entry.remote_credits = balance;
                    entry.fetched_at = now;
                }
                None => entry.remote_credits = (entry.remote_credits - amount).max(0),
            }
        } else if let Some(balance) = reported_balance {
            entries.insert(user_id.to_string(), CacheEntry::new(balance, now));
        }
    }

    /// Current cached view for a user, if any.
    pub async fn snapshot(&self, user_id: &str) -> Option<BalanceSnapshot> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let entry = entries.get_mut(user_id)?;
        entry.purge_expired(now);

        let pending_reserved = entry.pending_reserved();
        Some(BalanceSnapshot {
            remote_credits: entry.remote_credits,
            pending_reserved,
            available: entry.remote_credits - pending_reserved,
            age: now.duration_since(entry.fetched_at),
        })
    }

    /// Remove entries that can no longer admit anything: not fresh, too old
    /// for fallback, and holding no live reservations.
    pub async fn evict_stale(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();

        entries.retain(|_, entry| {
            entry.purge_expired(now);
            let fresh = now.duration_since(entry.observed_at) <= self.config.ttl;
            let fallback = now.duration_since(entry.fetched_at) <= self.config.max_staleness;
            fresh || fallback || !entry.holds.is_empty()
        });

        before - entries.len()
    }

    /// Start the periodic eviction sweep. Stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.evict_stale().await;
                if removed > 0 {
                    info!("Evicted {} stale balance cache entries", removed);
                }
            }
        })
    }

    fn hold(
        &self,
        entry: &mut CacheEntry,
        user_id: &str,
        amount: MicroCredits,
        now: Instant,
    ) -> Reservation {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        entry.holds.insert(
            ticket,
            PendingHold {
                amount,
                expires_at: now + self.config.pending_ttl(),
            },
        );
        entry.observed_at = now;
        Reservation::tracked(user_id, amount, ticket)
    }

    async fn fetch(&self, user_id: &str) -> Result<MicroCredits, RemoteError> {
        match tokio::time::timeout(self.call_timeout, self.authority.get_balance(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}
