//! Shared token cache: the persistence boundary between the flow engine
//! and the identity-provider client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Boxed error type for cache implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Provider account identifier.
///
/// For Entra ID this is the home-account id (`{uid}.{utid}`), falling back
/// to `{oid}.{tid}` or the raw `sub` claim when the provider omits
/// `client_info`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct AccountId(pub String);

/// One token-cache entry, keyed by account.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAccount {
    /// Account the tokens belong to.
    pub account_id: AccountId,
    /// Sign-in name (`preferred_username` claim), for display and logs.
    pub username: String,
    /// Bearer token for downstream API calls.
    pub access_token: String,
    /// Refresh token, when the provider issued one.
    pub refresh_token: Option<String>,
    /// Access-token expiry instant, when the provider reported one.
    pub expires_at: Option<OffsetDateTime>,
    /// Scopes the access token was granted for.
    pub scopes: Vec<String>,
}

impl CachedAccount {
    /// Whether the access token's reported lifetime has elapsed.
    ///
    /// Entries without an expiry are never considered expired; refresh
    /// policy is the caller's concern.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= OffsetDateTime::now_utc())
    }
}

/// Capability set of the shared token cache.
///
/// Implementations must be safe for concurrent use from many sessions
/// without external locking. The cache does not enforce per-session
/// isolation; callers match account identity to the acting session.
#[async_trait]
pub trait TokenCache: Send + Sync + 'static {
    /// Look up the entry for an account.
    async fn lookup(&self, account: &AccountId) -> Result<Option<CachedAccount>, StoreError>;

    /// Insert or replace the entry for the account the entry names.
    async fn upsert(&self, entry: CachedAccount) -> Result<(), StoreError>;

    /// Remove the entry for an account. Removing an absent account is not
    /// an error.
    async fn remove(&self, account: &AccountId) -> Result<(), StoreError>;

    /// All entries currently cached, in no particular order.
    async fn list_accounts(&self) -> Result<Vec<CachedAccount>, StoreError>;
}

/// Process-lifetime in-memory cache.
///
/// Entries live until explicitly removed or the process exits; there is no
/// eviction. Cloning shares the underlying store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTokenCache {
    entries: Arc<RwLock<HashMap<AccountId, CachedAccount>>>,
}

impl InMemoryTokenCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached accounts.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no accounts.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn lookup(&self, account: &AccountId) -> Result<Option<CachedAccount>, StoreError> {
        Ok(self.entries.read().await.get(account).cloned())
    }

    async fn upsert(&self, entry: CachedAccount) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(entry.account_id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, account: &AccountId) -> Result<(), StoreError> {
        self.entries.write().await.remove(account);
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<CachedAccount>, StoreError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
