#![doc = include_str!("../README.md")]

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod pkce;
pub mod session;

// Re-exports for convenient access
pub use cache::{AccountId, CachedAccount, InMemoryTokenCache, StoreError, TokenCache};
pub use client::{AuthCodeClient, AuthorizationResponse, ClaimsMap, PendingFlow, TokenSet};
pub use config::AuthConfig;
pub use error::{ConfigError, ExchangeError};
pub use session::{
    AuthSession, CallbackParams, FlowResult, RequestContext, Toast, ToastLevel,
};
