//! Provider configuration, resolved from environment variables with
//! optional programmatic overrides.

use crate::error::ConfigError;

/// Environment key for the application (client) id. Required.
pub const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
/// Environment key for the application client secret. Required.
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
/// Environment key for the directory (tenant) id. Required.
pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";
/// Environment key for the comma-separated scope list.
pub const ENV_SCOPES: &str = "AZURE_AUTH_SCOPES";
/// Environment key for the internal path to land on after login.
pub const ENV_LOGIN_REDIRECT_URL: &str = "AZURE_AUTH_LOGIN_REDIRECT_URL";
/// Environment key for the full post-logout redirect URL.
pub const ENV_POST_LOGOUT_REDIRECT_URI: &str = "AZURE_AUTH_POST_LOGOUT_REDIRECT_URI";
/// Environment key for the internal logout path.
pub const ENV_LOGOUT_ROUTE: &str = "AZURE_AUTH_LOGOUT_ROUTE";
/// Environment key for the internal callback path.
pub const ENV_CALLBACK_ROUTE: &str = "AZURE_AUTH_CALLBACK_ROUTE";
/// Environment key for the authority base URL (sovereign-cloud override).
pub const ENV_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";

/// Public-cloud authority base URL.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
/// Internal path to land on after a successful login.
pub const DEFAULT_LOGIN_REDIRECT: &str = "/";
/// Internal callback path.
pub const DEFAULT_CALLBACK_PATH: &str = "/callback";
/// Internal logout path.
pub const DEFAULT_LOGOUT_PATH: &str = "/logout";

/// Splits a comma-separated scope string, dropping empty entries.
fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolved provider settings.
///
/// Load from the environment with [`AuthConfig::from_env`], then apply any
/// explicit overrides via the consuming `with_*` methods; overrides take
/// precedence over environment values. Treat the value as read-only once
/// the first flow operation has run.
///
/// ```rust,ignore
/// use entra_sso::AuthConfig;
///
/// let config = AuthConfig::from_env()
///     .with_scopes(vec!["User.Read".into()])
///     .with_login_redirect("/dashboard");
/// config.ensure_configured()?;
/// ```
#[derive(Debug, Clone)]
pub struct AuthConfig {
    client_id: String,
    client_secret: String,
    tenant_id: String,
    scopes: Vec<String>,
    login_redirect: String,
    post_logout_redirect_uri: Option<String>,
    logout_path: String,
    callback_path: String,
    authority_host: String,
}

impl AuthConfig {
    /// Resolves settings from the process environment.
    ///
    /// Unset optional keys fall back to their documented defaults; the three
    /// required identifiers stay empty until provided and are validated by
    /// [`ensure_configured`](Self::ensure_configured).
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves settings from the process environment and validates the
    /// required identifiers in one step.
    ///
    /// Use [`from_env`](Self::from_env) instead when overrides must be
    /// applied before validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSettings`] naming each absent setting.
    pub fn resolve() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.ensure_configured()?;
        Ok(config)
    }

    /// Resolves settings from an arbitrary environment-style source.
    ///
    /// `from_env` is this with `std::env::var`; tests and hosts with their
    /// own config layer can supply any key/value lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            client_id: lookup(ENV_CLIENT_ID).unwrap_or_default(),
            client_secret: lookup(ENV_CLIENT_SECRET).unwrap_or_default(),
            tenant_id: lookup(ENV_TENANT_ID).unwrap_or_default(),
            scopes: lookup(ENV_SCOPES).as_deref().map(parse_scopes).unwrap_or_default(),
            login_redirect: lookup(ENV_LOGIN_REDIRECT_URL)
                .unwrap_or_else(|| DEFAULT_LOGIN_REDIRECT.into()),
            post_logout_redirect_uri: lookup(ENV_POST_LOGOUT_REDIRECT_URI),
            logout_path: lookup(ENV_LOGOUT_ROUTE).unwrap_or_else(|| DEFAULT_LOGOUT_PATH.into()),
            callback_path: lookup(ENV_CALLBACK_ROUTE)
                .unwrap_or_else(|| DEFAULT_CALLBACK_PATH.into()),
            authority_host: lookup(ENV_AUTHORITY_HOST)
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.into()),
        }
    }

    /// Override the application (client) id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Override the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = client_secret.into();
        self
    }

    /// Override the directory (tenant) id.
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Override the authorized scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Override the internal path to land on after login.
    #[must_use]
    pub fn with_login_redirect(mut self, path: impl Into<String>) -> Self {
        self.login_redirect = path.into();
        self
    }

    /// Override the provider-side post-logout redirect URL.
    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_logout_redirect_uri = Some(uri.into());
        self
    }

    /// Override the internal logout path.
    #[must_use]
    pub fn with_logout_path(mut self, path: impl Into<String>) -> Self {
        self.logout_path = path.into();
        self
    }

    /// Override the internal callback path.
    #[must_use]
    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into();
        self
    }

    /// Override the authority base URL (e.g. a sovereign cloud).
    #[must_use]
    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    /// Application (client) id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Application client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Directory (tenant) id.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Authorized scopes, in configuration order.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Internal path to land on after a successful login.
    #[must_use]
    pub fn login_redirect(&self) -> &str {
        &self.login_redirect
    }

    /// Provider-side post-logout redirect URL, if configured.
    #[must_use]
    pub fn post_logout_redirect_uri(&self) -> Option<&str> {
        self.post_logout_redirect_uri.as_deref()
    }

    /// Internal logout path the host should register.
    #[must_use]
    pub fn logout_path(&self) -> &str {
        &self.logout_path
    }

    /// Internal callback path the host should register.
    #[must_use]
    pub fn callback_path(&self) -> &str {
        &self.callback_path
    }

    /// Authority base URL.
    #[must_use]
    pub fn authority_host(&self) -> &str {
        &self.authority_host
    }

    /// Tenant-qualified authority URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTenant`] if the tenant id is empty.
    pub fn authority(&self) -> Result<String, ConfigError> {
        if self.tenant_id.is_empty() {
            return Err(ConfigError::MissingTenant);
        }
        Ok(format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        ))
    }

    /// Whether client id, client secret, and tenant id are all present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty() && !self.tenant_id.is_empty()
    }

    /// Validates the required identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSettings`] naming each absent setting.
    pub fn ensure_configured(&self) -> Result<(), ConfigError> {
        if self.is_configured() {
            return Ok(());
        }
        Err(ConfigError::missing(
            self.client_id.is_empty(),
            self.client_secret.is_empty(),
            self.tenant_id.is_empty(),
        ))
    }
}
