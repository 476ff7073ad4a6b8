//! Direct-mode OIDC adapter interface.
//!
//! In direct mode the browser owns tokens through a Keycloak-style client
//! object that performs the low-level authorization-code and silent-SSO
//! iframe flow. That client is an external collaborator: the session manager
//! consumes this interface and never reimplements the flow.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IamResult;

/// Lifecycle notifications surfaced by the adapter, forwarded onto the
/// session manager's event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The adapter finished its own bootstrap.
    Ready {
        /// Resulting authentication state.
        authenticated: bool,
    },
    /// An authorization flow completed.
    AuthSuccess,
    /// An authorization flow failed.
    AuthError {
        /// Failure description.
        message: String,
    },
    /// A token refresh completed.
    AuthRefreshSuccess,
    /// A token refresh failed.
    AuthRefreshError,
    /// The adapter's session ended.
    Logout,
    /// The access token expired.
    TokenExpired,
}

/// Sink receiving [`AdapterEvent`]s.
pub type AdapterEventSink = Arc<dyn Fn(AdapterEvent) + Send + Sync>;

/// Options for the adapter's check-SSO bootstrap.
#[derive(Debug, Clone)]
pub struct CheckSsoOptions {
    /// PKCE method the adapter must use. Always `"S256"` here.
    pub pkce_method: String,
    /// Absolute URI of the static silent-SSO page the iframe loads.
    pub silent_check_sso_redirect_uri: String,
}

/// Keycloak-style OIDC client consumed by the session manager in direct
/// mode.
#[async_trait]
pub trait OidcAdapter: Send + Sync {
    /// Wire adapter lifecycle notifications into a sink. Called once, at
    /// configuration load.
    fn set_event_sink(&self, sink: AdapterEventSink);

    /// Whether `init` has already run for this adapter instance.
    fn is_initialized(&self) -> bool;

    /// Run the check-SSO flow (silent iframe) and resolve the resulting
    /// authentication state.
    ///
    /// # Errors
    /// Any failure of the underlying flow.
    async fn init(&self, options: CheckSsoOptions) -> IamResult<bool>;

    /// Refresh the access token if it expires within `min_validity_secs`.
    /// A negative value forces a refresh. Resolves `true` when a new token
    /// was obtained.
    ///
    /// # Errors
    /// Any failure of the refresh exchange.
    async fn update_token(&self, min_validity_secs: i64) -> IamResult<bool>;

    /// Current access token, when authenticated.
    fn token(&self) -> Option<String>;

    /// Current ID token, when present.
    fn id_token(&self) -> Option<String>;

    /// Whether the adapter currently holds a parsed session.
    fn authenticated(&self) -> bool;

    /// Redirect the browser to the login page.
    ///
    /// # Errors
    /// Any failure building or opening the authorization request.
    async fn login(&self, return_url: Option<&str>) -> IamResult<()>;

    /// End the adapter-held session.
    ///
    /// # Errors
    /// Any failure of the logout request.
    async fn logout(&self) -> IamResult<()>;
}
