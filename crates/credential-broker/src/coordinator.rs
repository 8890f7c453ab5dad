//! Single-flight credential refresh.
//!
//! [`RefreshCoordinator::get_valid_credential`] returns a bearer token that is
//! valid for at least the skew buffer. When the stored access token is too
//! close to expiry, exactly one refresh per user runs at a time; concurrent
//! callers await the same in-flight result.
//!
//! The refresh itself runs on a spawned task. A caller that is cancelled
//! while waiting only stops waiting; the refresh finishes for the others.
//! The pending entry is removed by a drop guard owned by that task, so it is
//! cleared on success, failure and panic alike.

use crate::cipher::SecretCipher;
use crate::config::RefreshConfig;
use crate::error::CredentialError;
use crate::exchange::{OAuthTokenClient, TokenExchange};
use crate::store::{upsert, CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::types::{BearerToken, Credential, CredentialKind, TokenGrant, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, instrument, warn};

/// Result shared between all waiters of one refresh. Failures carry the reason only.
type RefreshResult = Result<BearerToken, String>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshResult>>;

struct PendingEntry {
    generation: u64,
    refresh: PendingRefresh,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    cipher: SecretCipher,
    provider: String,
    skew_buffer: ChronoDuration,
    refresh_ttl: ChronoDuration,
    pending: Mutex<HashMap<UserId, PendingEntry>>,
    generation: AtomicU64,
}

/// Hands out valid bearer tokens, refreshing them at most once per user at a time.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

/// Removes the pending entry it was created for when dropped.
struct PendingGuard {
    inner: Arc<Inner>,
    user_id: UserId,
    generation: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.lock_pending();
        if pending
            .get(&self.user_id)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            pending.remove(&self.user_id);
        }
    }
}

/// Upper bound on any lifetime reported by the token endpoint (ten years).
const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn lifetime(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(MAX_LIFETIME_SECS) as i64)
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    lifetime(duration.as_secs())
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        cipher: SecretCipher,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                cipher,
                provider: config.provider.clone(),
                skew_buffer: to_chrono(config.skew_buffer),
                refresh_ttl: to_chrono(config.refresh_ttl),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Build the coordinator with the configured store, cipher and token client.
    pub async fn from_config(config: &RefreshConfig) -> Result<Self, CredentialError> {
        let cipher = SecretCipher::from_config_key(&config.encryption_key)?;
        let exchange = OAuthTokenClient::from_config(config)?;
        let store: Arc<dyn CredentialStore> = match &config.storage_path {
            Some(path) => Arc::new(FileCredentialStore::open(path.clone()).await?),
            None => Arc::new(MemoryCredentialStore::new()),
        };

        info!(
            "Credential refresh via {} (provider={}, skew={:?})",
            config.token_url, config.provider, config.skew_buffer
        );
        Ok(Self::new(store, Arc::new(exchange), cipher, config))
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// Number of refreshes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// A bearer token valid for at least the skew buffer.
    ///
    /// Fails with [`CredentialError::AuthRequired`] when the user has no
    /// credentials or the refresh failed; in the latter case both stored
    /// credentials have already been deleted.
    #[instrument(skip(self))]
    pub async fn get_valid_credential(&self, user_id: &str) -> Result<BearerToken, CredentialError> {
        let access = self
            .inner
            .store
            .find(user_id, CredentialKind::Access, &self.inner.provider)
            .await?
            .ok_or_else(|| CredentialError::auth_required("no access credential"))?;

        if let Some(token) = self.inner.usable(&access, Utc::now()) {
            return Ok(token);
        }

        debug!("Access credential for {} needs refresh", user_id);
        self.join_or_start(user_id)
            .await
            .map_err(CredentialError::auth_required)
    }

    /// Forget any cached state for a user so the next call refreshes.
    ///
    /// Used when the upstream rejected a token that looked valid. The stored
    /// access credential is marked expired unless a refresh replaced it after
    /// it was read; an in-flight refresh is detached and left to finish on
    /// its own.
    pub async fn invalidate(&self, user_id: &str) -> Result<(), CredentialError> {
        self.inner.lock_pending().remove(user_id);

        if let Some(access) = self
            .inner
            .store
            .find(user_id, CredentialKind::Access, &self.inner.provider)
            .await?
        {
            let read = access.ciphertext.clone();
            let expired = Credential {
                expires_at: Utc::now(),
                ..access
            };
            if self.inner.store.update_if_unchanged(read, expired).await? {
                info!("Invalidated access credential for {}", user_id);
            } else {
                debug!("Access credential for {} replaced concurrently, kept", user_id);
            }
        }
        Ok(())
    }

    /// Store a grant obtained outside the coordinator (for example the
    /// initial authorization-code exchange).
    pub async fn save_grant(
        &self,
        user_id: &str,
        grant: &TokenGrant,
    ) -> Result<BearerToken, CredentialError> {
        self.inner.save_grant(user_id, grant, Utc::now()).await
    }

    fn join_or_start(&self, user_id: &str) -> PendingRefresh {
        let mut pending = self.inner.lock_pending();
        if let Some(entry) = pending.get(user_id) {
            debug!("Joining in-flight refresh for {}", user_id);
            return entry.refresh.clone();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard {
            inner: self.inner.clone(),
            user_id: user_id.to_string(),
            generation,
        };

        // Spawned while the map is locked, so the guard cannot run before the
        // entry is inserted.
        let task = tokio::spawn(async move {
            let guard = guard;
            guard.inner.refresh(&guard.user_id).await
        });
        let refresh = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Credential refresh task failed: {}", e);
                    Err("credential refresh aborted".to_string())
                }
            }
        }
        .boxed()
        .shared();

        pending.insert(
            user_id.to_string(),
            PendingEntry {
                generation,
                refresh: refresh.clone(),
            },
        );
        refresh
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<UserId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn usable(&self, access: &Credential, now: DateTime<Utc>) -> Option<BearerToken> {
        if !access.is_fresh(now, self.skew_buffer) {
            return None;
        }
        match self.cipher.decrypt(&access.ciphertext) {
            Ok(secret) => Some(BearerToken::from(secret)),
            Err(e) => {
                warn!("Stored access credential for {} unreadable: {}", access.user_id, e);
                None
            }
        }
    }

    async fn refresh(&self, user_id: &str) -> RefreshResult {
        match self.try_refresh(user_id).await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!("Refresh for {} failed: {}", user_id, e);
                self.clear(user_id).await;
                match e {
                    CredentialError::AuthRequired { reason } => Err(reason),
                    other => Err(other.to_string()),
                }
            }
        }
    }

    async fn try_refresh(&self, user_id: &str) -> Result<BearerToken, CredentialError> {
        let now = Utc::now();

        // A refresh that settled just before this one started already did the work.
        if let Some(access) = self
            .store
            .find(user_id, CredentialKind::Access, &self.provider)
            .await?
        {
            if let Some(token) = self.usable(&access, now) {
                return Ok(token);
            }
        }

        let refresh = self
            .store
            .find(user_id, CredentialKind::Refresh, &self.provider)
            .await?
            .ok_or_else(|| CredentialError::auth_required("no refresh credential"))?;
        if refresh.is_expired(now) {
            return Err(CredentialError::auth_required("refresh credential expired"));
        }

        let secret = self.cipher.decrypt(&refresh.ciphertext)?;
        let grant = self.exchange.refresh(&secret).await?;

        let now = Utc::now();
        let token = self.save_grant(user_id, &grant, now).await?;
        info!("Refreshed access credential for {}", user_id);
        Ok(token)
    }

    async fn save_grant(
        &self,
        user_id: &str,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<BearerToken, CredentialError> {
        let refresh_expires_at = match &grant.refresh_token {
            Some(refresh_token) => {
                let ttl = grant
                    .refresh_token_expires_in
                    .map(lifetime)
                    .unwrap_or(self.refresh_ttl);
                let expires_at = now + ttl;
                let credential = Credential::new(
                    user_id,
                    &self.provider,
                    CredentialKind::Refresh,
                    self.cipher.encrypt(refresh_token.expose_secret())?,
                    expires_at,
                );
                upsert(self.store.as_ref(), credential).await?;
                Some(expires_at)
            }
            None => self
                .store
                .find(user_id, CredentialKind::Refresh, &self.provider)
                .await?
                .map(|r| r.expires_at),
        };

        // The access credential never outlives its refresh credential.
        let mut access_expires_at = now + lifetime(grant.expires_in);
        if let Some(limit) = refresh_expires_at {
            access_expires_at = access_expires_at.min(limit);
        }

        let access = Credential::new(
            user_id,
            &self.provider,
            CredentialKind::Access,
            self.cipher.encrypt(grant.access_token.expose_secret())?,
            access_expires_at,
        );
        upsert(self.store.as_ref(), access).await?;

        Ok(BearerToken::from(grant.access_token.clone()))
    }

    async fn clear(&self, user_id: &str) {
        match self.store.delete_many(user_id, &self.provider).await {
            Ok(removed) => info!("Deleted {} credentials for {}", removed, user_id),
            Err(e) => error!("Failed to delete credentials for {}: {}", user_id, e),
        }
    }
}
