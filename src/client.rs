//! Confidential-client adapter for the provider's authorization-code
//! endpoints: authorization-request construction, code-for-token exchange,
//! and cached-account enumeration/removal for logout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::cache::{AccountId, CachedAccount, TokenCache};
use crate::config::AuthConfig;
use crate::error::{ConfigError, ExchangeError};
use crate::pkce;

/// Claims decoded from an id token, keyed by claim name.
pub type ClaimsMap = HashMap<String, serde_json::Value>;

/// Scopes the provider requires for an id token and refresh token; always
/// merged into the requested scope set.
const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Deadline for any single token-endpoint request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque context linking a login initiation to its callback.
///
/// Exactly one lives per session at a time; it is consumed by the callback
/// exchange and never persisted beyond the session.
#[derive(Debug, Clone)]
pub struct PendingFlow {
    pub(crate) auth_url: String,
    pub(crate) state: String,
    pub(crate) nonce: String,
    pub(crate) code_verifier: String,
    pub(crate) redirect_uri: String,
}

impl PendingFlow {
    /// Authorization URL the user agent must be sent to.
    #[must_use]
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// CSRF-protection state the callback must echo.
    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }
}

/// The authorization response carried back on the callback, as handed to
/// the token exchange.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationResponse {
    /// Authorization code to exchange.
    pub code: Option<String>,
    /// Echoed CSRF-protection state.
    pub state: Option<String>,
    /// Provider account hint (base64url JSON `{uid, utid}`).
    pub client_info: Option<String>,
    /// Provider session marker, logged only.
    pub session_state: Option<String>,
}

/// Tokens and identity produced by a successful exchange.
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// Bearer token for downstream API calls.
    pub access_token: String,
    /// Claims decoded from the id token.
    pub claims: ClaimsMap,
    /// Cache key of the account that signed in.
    pub account_id: AccountId,
}

/// Wire shape of the token endpoint's reply; success and error payloads
/// share one body with disjoint fields populated.
#[derive(Debug, Deserialize)]
struct TokenEndpointPayload {
    access_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Confidential client for the provider's v2.0 authorization-code flow.
///
/// Shares the token cache with the session engine: successful exchanges
/// upsert an account entry, logout removes it.
pub struct AuthCodeClient {
    client_id: String,
    client_secret: String,
    authority: String,
    http: reqwest::Client,
    cache: Arc<dyn TokenCache>,
}

impl AuthCodeClient {
    /// Builds a client from resolved configuration and the shared cache.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the required identifiers are missing,
    /// validated here so every flow operation fails before touching the
    /// provider.
    pub fn new(config: &AuthConfig, cache: Arc<dyn TokenCache>) -> Result<Self, ConfigError> {
        config.ensure_configured()?;
        Ok(Self {
            client_id: config.client_id().to_string(),
            client_secret: config.client_secret().to_string(),
            authority: config.authority()?,
            http: reqwest::Client::new(),
            cache,
        })
    }

    /// Use a custom HTTP client (connection-pool reuse).
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Tenant-qualified authority this client talks to.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Constructs the authorization URL and the pending-flow context for
    /// one login attempt. Pure; no network I/O.
    #[must_use]
    pub fn build_authorization_request(
        &self,
        scopes: &[String],
        redirect_uri: &str,
    ) -> PendingFlow {
        let state = pkce::generate_state();
        let nonce = pkce::generate_nonce();
        let code_verifier = pkce::generate_code_verifier();
        let challenge = pkce::code_challenge(&code_verifier);

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &merged_scope(scopes))
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("client_info", "1")
            .finish();

        PendingFlow {
            auth_url: format!("{}/oauth2/v2.0/authorize?{query}", self.authority),
            state,
            nonce,
            code_verifier,
            redirect_uri: redirect_uri.to_string(),
        }
    }

    /// Exchanges an authorization response for tokens.
    ///
    /// The response is validated against the pending flow locally before
    /// any network call; on success the account's tokens are upserted into
    /// the shared cache.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::StateMismatch`] for a locally-detected
    /// inconsistency, [`ExchangeError::ProviderRejected`] when the provider
    /// returns an error payload, [`ExchangeError::Transport`] when the
    /// endpoint is unreachable.
    pub async fn exchange_code(
        &self,
        flow: &PendingFlow,
        response: &AuthorizationResponse,
        scopes: &[String],
    ) -> Result<TokenSet, ExchangeError> {
        let Some(state) = response.state.as_deref() else {
            tracing::warn!("authorization response carried no state");
            return Err(ExchangeError::StateMismatch);
        };
        if state != flow.state {
            tracing::warn!("authorization response state does not match the pending flow");
            return Err(ExchangeError::StateMismatch);
        }
        let Some(code) = response.code.as_deref() else {
            tracing::warn!("authorization response carried no code");
            return Err(ExchangeError::StateMismatch);
        };
        if let Some(session_state) = response.session_state.as_deref() {
            tracing::debug!(%session_state, "provider session marker received");
        }

        let scope = merged_scope(scopes);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", flow.redirect_uri.as_str()),
            ("code_verifier", flow.code_verifier.as_str()),
            ("scope", scope.as_str()),
        ];

        let reply = self
            .http
            .post(format!("{}/oauth2/v2.0/token", self.authority))
            .timeout(REQUEST_TIMEOUT)
            .form(&params)
            .send()
            .await?;
        let status = reply.status();
        let body = reply.text().await?;

        let payload: TokenEndpointPayload = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, status = status.as_u16(), "malformed token endpoint payload");
            ExchangeError::ProviderRejected {
                error: "invalid_response".into(),
                description: "token endpoint returned a malformed payload".into(),
            }
        })?;

        if let Some(error) = payload.error {
            let description = payload
                .error_description
                .unwrap_or_else(|| "Token acquisition failed.".into());
            tracing::warn!(error = %error, description = %description, "token exchange rejected");
            return Err(ExchangeError::ProviderRejected { error, description });
        }

        let (Some(access_token), Some(id_token)) = (payload.access_token, payload.id_token) else {
            tracing::error!(status = status.as_u16(), "token endpoint reply held no tokens");
            return Err(ExchangeError::ProviderRejected {
                error: "invalid_response".into(),
                description: "token endpoint returned no usable tokens".into(),
            });
        };

        let Some(claims) = decode_id_token_claims(&id_token) else {
            tracing::error!("token response did not include a decodable id_token");
            return Err(ExchangeError::ProviderRejected {
                error: "invalid_response".into(),
                description: "token response did not include a valid id token".into(),
            });
        };

        // The nonce the id token carries must be the one this flow sent.
        if claims.get("nonce").and_then(|v| v.as_str()) != Some(flow.nonce.as_str()) {
            tracing::warn!("id token nonce does not match the pending flow");
            return Err(ExchangeError::StateMismatch);
        }

        let Some(account_id) = derive_account_id(response.client_info.as_deref(), &claims) else {
            tracing::error!("no account identity in token response");
            return Err(ExchangeError::ProviderRejected {
                error: "invalid_response".into(),
                description: "id token carried no account identity".into(),
            });
        };

        let entry = CachedAccount {
            account_id: account_id.clone(),
            username: claims
                .get("preferred_username")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            access_token: access_token.clone(),
            refresh_token: payload.refresh_token,
            expires_at: payload
                .expires_in
                .map(|secs| OffsetDateTime::now_utc() + time::Duration::seconds(secs as i64)),
            scopes: scopes.to_vec(),
        };
        if let Err(e) = self.cache.upsert(entry).await {
            // A cache miss only costs logout-time revocation.
            tracing::warn!(error = %e, account = %account_id, "failed to cache account tokens");
        }

        tracing::info!(account = %account_id, "token exchange completed");
        Ok(TokenSet {
            access_token,
            claims,
            account_id,
        })
    }

    /// Accounts currently held in the shared cache. Enumeration failures
    /// are logged and read as "no accounts".
    pub async fn accounts(&self) -> Vec<CachedAccount> {
        match self.cache.list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(error = %e, "account enumeration failed");
                Vec::new()
            }
        }
    }

    /// Best-effort removal of an account from the shared cache. Failures
    /// are logged and swallowed; logout must not be blocked by cache
    /// cleanup.
    pub async fn revoke(&self, account: &AccountId) {
        if let Err(e) = self.cache.remove(account).await {
            tracing::warn!(error = %e, account = %account, "account revocation failed");
        }
    }

    /// Provider logout endpoint, with the post-logout redirect appended
    /// verbatim when one is configured.
    #[must_use]
    pub fn logout_url(&self, post_logout_redirect_uri: Option<&str>) -> String {
        let mut url = format!("{}/oauth2/v2.0/logout", self.authority);
        if let Some(uri) = post_logout_redirect_uri {
            url.push_str("?post_logout_redirect_uri=");
            url.push_str(uri);
        }
        url
    }
}

/// Merges the reserved provider scopes with the configured ones,
/// preserving configuration order and dropping duplicates.
fn merged_scope(scopes: &[String]) -> String {
    let mut merged: Vec<&str> = RESERVED_SCOPES.to_vec();
    for scope in scopes {
        if !merged.contains(&scope.as_str()) {
            merged.push(scope);
        }
    }
    merged.join(" ")
}

/// Decodes the claims object from an id token's payload segment.
///
/// The token arrives over the direct TLS channel to the token endpoint, so
/// the claims are read without signature verification, the segment split
/// and base64url decode mirroring the compact-token layout.
fn decode_id_token_claims(id_token: &str) -> Option<ClaimsMap> {
    let segments: Vec<&str> = id_token.split('.').collect();
    if segments.len() != 3 {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        serde_json::Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// Derives the cache key for the signed-in account: `client_info`'s
/// `{uid}.{utid}` when present, else `{oid}.{tid}`, else the `sub` claim.
fn derive_account_id(client_info: Option<&str>, claims: &ClaimsMap) -> Option<AccountId> {
    if let Some(id) = client_info.and_then(home_account_from_client_info) {
        return Some(id);
    }
    let claim = |key: &str| claims.get(key).and_then(|v| v.as_str());
    if let (Some(oid), Some(tid)) = (claim("oid"), claim("tid")) {
        return Some(AccountId(format!("{oid}.{tid}")));
    }
    claim("sub").map(|sub| AccountId(sub.to_string()))
}

fn home_account_from_client_info(raw: &str) -> Option<AccountId> {
    let bytes = URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let uid = value.get("uid")?.as_str()?;
    let utid = value.get("utid")?.as_str()?;
    Some(AccountId(format!("{uid}.{utid}")))
}
