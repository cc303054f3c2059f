//! Per-session authentication state machine.
//!
//! One [`AuthSession`] lives per logical user connection, moving between
//! unauthenticated, flow-pending, and authenticated as the host drives the
//! three flow operations. The host serializes operations per session; the
//! shared pieces (config, token cache) are safe across sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::cache::{AccountId, TokenCache};
use crate::client::{AuthCodeClient, AuthorizationResponse, ClaimsMap, PendingFlow};
use crate::config::AuthConfig;
use crate::error::{ConfigError, ExchangeError};

/// How long callback-failure notifications stay on screen.
pub const DEFAULT_TOAST_DURATION: Duration = Duration::from_secs(5);

/// Shown when a callback fails for a reason the user cannot act on.
const LOGIN_RETRY_MESSAGE: &str = "Login callback error. Please try logging in again.";

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ToastLevel {
    /// The operation failed; the message says why.
    Error,
}

/// Short user-facing notification, used only for callback failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    /// Display text. Never carries server-side failure detail.
    pub message: String,
    /// Severity marker.
    pub level: ToastLevel,
    /// How long to display the notification.
    pub duration: Duration,
}

impl Toast {
    /// An error toast with the default display duration.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: ToastLevel::Error,
            duration: DEFAULT_TOAST_DURATION,
        }
    }
}

/// What the host should do after a flow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowResult {
    /// Nothing to do; continue rendering.
    NoAction,
    /// Send the user agent to this URL.
    Redirect(String),
    /// Show this notification.
    Toast(Toast),
}

/// The page/router context of the inbound request, as seen by the host.
///
/// The engine only reads the request URL, to derive the external base the
/// provider must redirect back to.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_url: Url,
}

impl RequestContext {
    /// Wraps the full URL of the request being served.
    #[must_use]
    pub fn new(request_url: Url) -> Self {
        Self { request_url }
    }

    /// External origin of the request, without a trailing separator.
    fn external_base(&self) -> String {
        self.request_url
            .origin()
            .ascii_serialization()
            .trim_end_matches('/')
            .to_string()
    }

    /// The externally-visible callback URL for this request's origin.
    pub(crate) fn callback_url(&self, callback_path: &str) -> String {
        let base = self.external_base();
        if callback_path.starts_with('/') {
            format!("{base}{callback_path}")
        } else {
            format!("{base}/{callback_path}")
        }
    }
}

/// Query parameters the provider sends to the callback route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code, on success.
    pub code: Option<String>,
    /// Provider account hint.
    pub client_info: Option<String>,
    /// Echoed CSRF-protection state.
    pub state: Option<String>,
    /// Provider session marker.
    pub session_state: Option<String>,
    /// Provider error code, when authorization failed.
    pub error: Option<String>,
    /// Provider error description.
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parses the raw query string of a callback request.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error for a malformed query string.
    pub fn from_query(query: &str) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(query)
    }
}

/// Per-session authentication state and flow operations.
///
/// The provider client is built on first use and cached for the session's
/// lifetime; config and token cache are shared across sessions.
pub struct AuthSession {
    config: Arc<AuthConfig>,
    cache: Arc<dyn TokenCache>,
    client: Option<Arc<AuthCodeClient>>,
    claims: ClaimsMap,
    access_token: String,
    flow: Option<PendingFlow>,
    account_id: Option<AccountId>,
}

impl AuthSession {
    /// Creates an unauthenticated session sharing the given config and
    /// token cache.
    #[must_use]
    pub fn new(config: Arc<AuthConfig>, cache: Arc<dyn TokenCache>) -> Self {
        Self {
            config,
            cache,
            client: None,
            claims: HashMap::new(),
            access_token: String::new(),
            flow: None,
            account_id: None,
        }
    }

    /// Provider client for this session, built once on first use.
    fn client(&mut self) -> Result<Arc<AuthCodeClient>, ConfigError> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }
        let built = Arc::new(AuthCodeClient::new(&self.config, Arc::clone(&self.cache))?);
        self.client = Some(Arc::clone(&built));
        Ok(built)
    }

    // ── Flow operations ────────────────────────────────────────────

    /// Gate for protected resources: no-op when authenticated, otherwise
    /// starts a login and returns the authorization redirect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provider essentials are missing.
    pub fn require_auth(&mut self, ctx: &RequestContext) -> Result<FlowResult, ConfigError> {
        if self.is_authenticated() {
            return Ok(FlowResult::NoAction);
        }
        self.initiate_login(ctx)
    }

    /// Starts a login: derives the callback URL from the request origin,
    /// builds the authorization request, and stores the pending flow,
    /// overwriting and abandoning any stale one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provider essentials are missing.
    pub fn initiate_login(&mut self, ctx: &RequestContext) -> Result<FlowResult, ConfigError> {
        let client = self.client()?;
        let callback_url = ctx.callback_url(self.config.callback_path());
        let flow = client.build_authorization_request(self.config.scopes(), &callback_url);
        let auth_url = flow.auth_url().to_string();
        tracing::debug!(callback_url = %callback_url, "authorization code flow initiated");
        self.flow = Some(flow);
        Ok(FlowResult::Redirect(auth_url))
    }

    /// Handles the provider's redirect back to the callback route.
    ///
    /// A provider-reported authorization error short-circuits to an error
    /// toast without touching session state. Otherwise the stored pending
    /// flow is consumed for the token exchange: failure leaves the session
    /// unauthenticated with a toast, success stores the tokens and
    /// redirects to the configured post-login path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provider essentials are missing.
    pub async fn handle_callback(
        &mut self,
        params: &CallbackParams,
    ) -> Result<FlowResult, ConfigError> {
        if let Some(error) = &params.error {
            let description = params
                .error_description
                .clone()
                .unwrap_or_else(|| "Unknown error.".to_string());
            tracing::warn!(error = %error, description = %description, "authorization failed at the provider");
            return Ok(FlowResult::Toast(Toast::error(format!(
                "Login failed: {description}"
            ))));
        }

        let client = self.client()?;
        let Some(flow) = self.flow.take() else {
            tracing::warn!("callback received with no pending login flow");
            return Ok(FlowResult::Toast(Toast::error(LOGIN_RETRY_MESSAGE)));
        };

        let response = AuthorizationResponse {
            code: params.code.clone(),
            state: params.state.clone(),
            client_info: params.client_info.clone(),
            session_state: params.session_state.clone(),
        };

        match client
            .exchange_code(&flow, &response, self.config.scopes())
            .await
        {
            Ok(tokens) => {
                self.access_token = tokens.access_token;
                self.claims = tokens.claims;
                self.account_id = Some(tokens.account_id);
                tracing::info!(principal = %self.principal_email(), "login completed");
                Ok(FlowResult::Redirect(self.config.login_redirect().to_string()))
            }
            Err(err) => {
                tracing::warn!(error = %err, "token exchange failed");
                let message = match &err {
                    ExchangeError::ProviderRejected { description, .. } => {
                        format!("Login failed: {description}")
                    }
                    ExchangeError::StateMismatch => LOGIN_RETRY_MESSAGE.to_string(),
                    ExchangeError::Transport(_) => {
                        "Login failed: the identity provider could not be reached.".to_string()
                    }
                };
                Ok(FlowResult::Toast(Toast::error(message)))
            }
        }
    }

    /// Logs the session out: clears all local state first, then
    /// best-effort revokes this session's cached account, and returns the
    /// provider logout redirect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provider essentials are missing.
    pub async fn perform_logout(&mut self) -> Result<FlowResult, ConfigError> {
        let client = self.client()?;

        let account_id = self.account_id.take();
        self.claims.clear();
        self.access_token.clear();
        self.flow = None;

        // Revocation targets this session's own account, and only when the
        // cache actually holds entries. Failures never surface.
        if let Some(account_id) = account_id {
            if !client.accounts().await.is_empty() {
                client.revoke(&account_id).await;
            }
        }

        let url = client.logout_url(self.config.post_logout_redirect_uri());
        tracing::info!("session logged out");
        Ok(FlowResult::Redirect(url))
    }

    // ── Projections ────────────────────────────────────────────────

    /// Whether the session holds id-token claims.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.claims.is_empty()
    }

    /// Claims from the id token; empty when unauthenticated.
    #[must_use]
    pub fn claims(&self) -> &ClaimsMap {
        &self.claims
    }

    /// Access token for downstream API calls; empty when unauthenticated.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Display name (`name` claim), empty when absent.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.string_claim("name")
    }

    /// Sign-in name (`preferred_username` claim), empty when absent.
    #[must_use]
    pub fn principal_email(&self) -> String {
        self.string_claim("preferred_username")
    }

    /// Application roles (`roles` claim), empty when absent.
    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        self.claims
            .get("roles")
            .and_then(|v| v.as_array())
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| r.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn string_claim(&self, key: &str) -> String {
        self.claims
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::{CachedAccount, InMemoryTokenCache, StoreError};
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(authority_host: &str) -> Arc<AuthConfig> {
        Arc::new(
            AuthConfig::from_lookup(|_| None)
                .with_client_id("client-123")
                .with_client_secret("secret-456")
                .with_tenant_id("contoso")
                .with_scopes(vec!["User.Read".into()])
                .with_authority_host(authority_host),
        )
    }

    fn session_with(config: Arc<AuthConfig>) -> (AuthSession, Arc<InMemoryTokenCache>) {
        let cache = Arc::new(InMemoryTokenCache::new());
        (AuthSession::new(config, cache.clone()), cache)
    }

    fn ctx() -> RequestContext {
        RequestContext::new("https://app.example:8443/dashboard?tab=1".parse().unwrap())
    }

    fn fake_id_token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    fn assert_auth_invariant(session: &AuthSession) {
        assert_eq!(session.is_authenticated(), !session.claims().is_empty());
        if !session.access_token().is_empty() {
            assert!(!session.claims().is_empty());
        }
    }

    /// Drives a full login against a mock token endpoint; returns the
    /// result of the callback.
    async fn complete_login(session: &mut AuthSession, server: &MockServer) -> FlowResult {
        let result = session.require_auth(&ctx()).unwrap();
        assert!(matches!(result, FlowResult::Redirect(_)));

        let flow = session.flow.clone().unwrap();
        let id_token = fake_id_token(&json!({
            "sub": "sub-1",
            "oid": "oid-1",
            "tid": "tid-1",
            "name": "Ada Lovelace",
            "preferred_username": "ada@contoso.example",
            "roles": ["admin", "reader"],
            "nonce": flow.nonce,
        }));
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-123",
                "expires_in": 3600,
                "id_token": id_token,
            })))
            .mount(server)
            .await;

        let params = CallbackParams {
            code: Some("auth-code".into()),
            state: Some(flow.state.clone()),
            ..CallbackParams::default()
        };
        session.handle_callback(&params).await.unwrap()
    }

    #[test]
    fn callback_params_parse_from_a_query_string() {
        let params = CallbackParams::from_query(
            "code=abc&state=xyz&session_state=s1&error=access_denied\
             &error_description=User%20cancelled",
        )
        .unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("User cancelled"));
    }

    #[test]
    fn callback_url_derivation_normalizes_the_origin() {
        let ctx = ctx();
        assert_eq!(
            ctx.callback_url("/callback"),
            "https://app.example:8443/callback"
        );
        assert_eq!(
            ctx.callback_url("callback"),
            "https://app.example:8443/callback"
        );
    }

    #[test]
    fn flow_operations_fail_eagerly_when_unconfigured() {
        let (mut session, _) = session_with(Arc::new(AuthConfig::from_lookup(|_| None)));
        let result = session.require_auth(&ctx());
        assert!(matches!(result, Err(ConfigError::MissingSettings(_))));
        assert_auth_invariant(&session);
    }

    #[test]
    fn require_auth_starts_a_flow_when_unauthenticated() {
        let (mut session, _) = session_with(test_config("https://login.microsoftonline.com"));
        assert!(!session.is_authenticated());

        let result = session.require_auth(&ctx()).unwrap();
        let flow = session.flow.as_ref().unwrap();
        assert_eq!(result, FlowResult::Redirect(flow.auth_url().to_string()));
        assert!(flow
            .redirect_uri
            .starts_with("https://app.example:8443/callback"));
        assert_auth_invariant(&session);
    }

    #[test]
    fn require_auth_is_a_no_op_when_authenticated() {
        let (mut session, _) = session_with(test_config("https://login.microsoftonline.com"));
        session.claims.insert("name".into(), json!("Ada"));

        let result = session.require_auth(&ctx()).unwrap();
        assert_eq!(result, FlowResult::NoAction);
        assert!(session.flow.is_none());
        assert_eq!(session.display_name(), "Ada");
        assert_auth_invariant(&session);
    }

    #[test]
    fn initiating_again_overwrites_the_stale_flow() {
        let (mut session, _) = session_with(test_config("https://login.microsoftonline.com"));
        session.require_auth(&ctx()).unwrap();
        let first_state = session.flow.as_ref().unwrap().state.clone();

        session.require_auth(&ctx()).unwrap();
        let second_state = session.flow.as_ref().unwrap().state.clone();
        assert_ne!(first_state, second_state);
    }

    #[tokio::test]
    async fn provider_error_on_callback_becomes_a_toast_and_mutates_nothing() {
        let (mut session, _) = session_with(test_config("http://127.0.0.1:9"));
        session.require_auth(&ctx()).unwrap();

        let params = CallbackParams {
            error: Some("access_denied".into()),
            error_description: Some("User cancelled".into()),
            ..CallbackParams::default()
        };
        // An unreachable authority proves no exchange is attempted.
        let result = session.handle_callback(&params).await.unwrap();

        match result {
            FlowResult::Toast(toast) => {
                assert!(toast.message.contains("User cancelled"));
                assert_eq!(toast.level, ToastLevel::Error);
                assert_eq!(toast.duration, DEFAULT_TOAST_DURATION);
            }
            other => panic!("expected Toast, got {other:?}"),
        }
        assert!(!session.is_authenticated());
        assert!(session.flow.is_some(), "pending flow must remain as-is");
        assert_auth_invariant(&session);
    }

    #[tokio::test]
    async fn state_mismatch_resets_to_unauthenticated() {
        let (mut session, _) = session_with(test_config("http://127.0.0.1:9"));
        session.require_auth(&ctx()).unwrap();

        let params = CallbackParams {
            code: Some("auth-code".into()),
            state: Some("tampered".into()),
            ..CallbackParams::default()
        };
        let result = session.handle_callback(&params).await.unwrap();

        assert!(matches!(result, FlowResult::Toast(_)));
        assert!(!session.is_authenticated());
        assert!(session.flow.is_none(), "consumed flow must be cleared");
        assert_auth_invariant(&session);
    }

    #[tokio::test]
    async fn callback_without_a_pending_flow_is_rejected() {
        let (mut session, _) = session_with(test_config("http://127.0.0.1:9"));

        let params = CallbackParams {
            code: Some("auth-code".into()),
            state: Some("anything".into()),
            ..CallbackParams::default()
        };
        let result = session.handle_callback(&params).await.unwrap();
        assert!(matches!(result, FlowResult::Toast(_)));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn successful_callback_authenticates_and_redirects() {
        let server = MockServer::start().await;
        let (mut session, cache) = session_with(test_config(&server.uri()));

        let result = complete_login(&mut session, &server).await;

        assert_eq!(result, FlowResult::Redirect("/".to_string()));
        assert!(session.is_authenticated());
        assert!(session.flow.is_none());
        assert_eq!(session.access_token(), "at-123");
        assert_eq!(session.display_name(), "Ada Lovelace");
        assert_eq!(session.principal_email(), "ada@contoso.example");
        assert_eq!(session.roles(), ["admin", "reader"]);
        assert_eq!(cache.len().await, 1);
        assert_auth_invariant(&session);
    }

    #[tokio::test]
    async fn replaying_a_consumed_callback_fails_instead_of_reauthenticating() {
        let server = MockServer::start().await;
        let (mut session, _) = session_with(test_config(&server.uri()));
        complete_login(&mut session, &server).await;

        let replay = CallbackParams {
            code: Some("auth-code".into()),
            state: Some("whatever-it-was".into()),
            ..CallbackParams::default()
        };
        let result = session.handle_callback(&replay).await.unwrap();

        assert!(matches!(result, FlowResult::Toast(_)));
        // The earlier login stands; the replay just fails.
        assert!(session.is_authenticated());
        assert_auth_invariant(&session);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_a_generic_toast() {
        let (mut session, _) = session_with(test_config("http://127.0.0.1:9"));
        session.require_auth(&ctx()).unwrap();
        let flow = session.flow.clone().unwrap();

        let params = CallbackParams {
            code: Some("auth-code".into()),
            state: Some(flow.state.clone()),
            ..CallbackParams::default()
        };
        let result = session.handle_callback(&params).await.unwrap();

        match result {
            FlowResult::Toast(toast) => {
                assert!(toast.message.contains("could not be reached"));
                assert!(!toast.message.contains("127.0.0.1"), "no server detail leaks");
            }
            other => panic!("expected Toast, got {other:?}"),
        }
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn logout_clears_state_revokes_the_account_and_redirects() {
        let server = MockServer::start().await;
        let (mut session, cache) = session_with(test_config(&server.uri()));
        complete_login(&mut session, &server).await;
        assert_eq!(cache.len().await, 1);

        let result = session.perform_logout().await.unwrap();

        assert_eq!(
            result,
            FlowResult::Redirect(format!("{}/contoso/oauth2/v2.0/logout", server.uri()))
        );
        assert!(!session.is_authenticated());
        assert!(session.access_token().is_empty());
        assert!(session.flow.is_none());
        assert_eq!(cache.len().await, 0, "the session's account is revoked");
        assert_auth_invariant(&session);
    }

    #[tokio::test]
    async fn logout_appends_the_post_logout_redirect_only_when_configured() {
        let config = Arc::new(
            AuthConfig::from_lookup(|_| None)
                .with_client_id("client-123")
                .with_client_secret("secret-456")
                .with_tenant_id("contoso")
                .with_post_logout_redirect_uri("https://app.example/bye"),
        );
        let (mut session, _) = session_with(config);

        let result = session.perform_logout().await.unwrap();
        match result {
            FlowResult::Redirect(url) => {
                assert!(url.ends_with("?post_logout_redirect_uri=https://app.example/bye"));
            }
            other => panic!("expected Redirect, got {other:?}"),
        }
    }

    /// Cache whose mutations fail, for proving logout never depends on
    /// revocation succeeding.
    #[derive(Clone)]
    struct FailingCache {
        entry: CachedAccount,
    }

    #[async_trait]
    impl TokenCache for FailingCache {
        async fn lookup(&self, _: &AccountId) -> Result<Option<CachedAccount>, StoreError> {
            Ok(Some(self.entry.clone()))
        }
        async fn upsert(&self, _: CachedAccount) -> Result<(), StoreError> {
            Err("cache write refused".into())
        }
        async fn remove(&self, _: &AccountId) -> Result<(), StoreError> {
            Err("cache remove refused".into())
        }
        async fn list_accounts(&self) -> Result<Vec<CachedAccount>, StoreError> {
            Ok(vec![self.entry.clone()])
        }
    }

    #[tokio::test]
    async fn logout_completes_even_when_revocation_fails() {
        let entry = CachedAccount {
            account_id: AccountId("oid-1.tid-1".into()),
            username: "ada@contoso.example".into(),
            access_token: "at-123".into(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        };
        let config = test_config("https://login.microsoftonline.com");
        let mut session = AuthSession::new(config, Arc::new(FailingCache { entry }));

        session.claims.insert("name".into(), json!("Ada"));
        session.access_token = "at-123".into();
        session.account_id = Some(AccountId("oid-1.tid-1".into()));
        assert!(session.is_authenticated());

        let result = session.perform_logout().await.unwrap();

        assert!(matches!(result, FlowResult::Redirect(_)));
        assert!(!session.is_authenticated());
        assert!(session.access_token().is_empty());
        assert_auth_invariant(&session);
    }
}
