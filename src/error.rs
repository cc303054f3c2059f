use crate::config::{ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_TENANT_ID};

/// Configuration failures.
///
/// Raised eagerly, before any flow step runs. These are fatal for the
/// request that triggered them and are never retried.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// One or more required settings are absent. The message names each
    /// missing setting and its environment key.
    #[error(
        "authentication essentials are not configured: {0}. \
         Set the environment variables or override them on AuthConfig before use"
    )]
    MissingSettings(String),

    /// The authority URL was requested without a tenant id.
    #[error("tenant id is not configured; set AZURE_TENANT_ID or call with_tenant_id")]
    MissingTenant,
}

impl ConfigError {
    /// Builds a [`ConfigError::MissingSettings`] from the essentials that
    /// failed validation.
    pub(crate) fn missing(client_id: bool, client_secret: bool, tenant_id: bool) -> Self {
        let mut missing = Vec::new();
        if client_id {
            missing.push(format!("client id ({ENV_CLIENT_ID})"));
        }
        if client_secret {
            missing.push(format!("client secret ({ENV_CLIENT_SECRET})"));
        }
        if tenant_id {
            missing.push(format!("tenant id ({ENV_TENANT_ID})"));
        }
        Self::MissingSettings(missing.join(", "))
    }
}

/// Failures of the authorization-code-for-token exchange.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The authorization response is inconsistent with the pending login
    /// flow: wrong or missing `state`, wrong id-token nonce, or no
    /// authorization code. Detected locally, without a network round trip.
    /// Covers CSRF attempts as well as stale or replayed callbacks.
    #[error("authorization response does not match the pending login flow")]
    StateMismatch,

    /// The identity provider returned an error payload instead of tokens.
    #[error("identity provider rejected the exchange: {error}: {description}")]
    ProviderRejected {
        /// Provider error code (e.g. `invalid_grant`).
        error: String,
        /// Human-readable provider description.
        description: String,
    },

    /// The token endpoint could not be reached or the request timed out.
    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
}
