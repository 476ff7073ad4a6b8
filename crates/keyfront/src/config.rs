//! Session manager configuration.
//!
//! Configuration is immutable once loaded: the first successful
//! `load_config` wins for the lifetime of a session manager instance, and
//! the operating mode is a tagged variant every public operation matches on.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::OidcAdapter;
use crate::enclave::EnclaveClient;
use crate::error::{IamError, IamResult};
use crate::platform::PlatformAdapter;

/// The three mutually exclusive authentication topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The browser holds tokens through an embedded OIDC client.
    Direct,
    /// The browser does PKCE/redirect only; a backend exchanges the code and
    /// keeps tokens server-side.
    Delegated,
    /// A native app opens the system browser and exchanges the code itself.
    External,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Delegated => write!(f, "delegated"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Custom headers for the delegated exchange request: a static map, or a
/// zero-argument producer (commonly used for anti-CSRF tokens minted per
/// request).
#[derive(Clone)]
pub enum HeaderSource {
    /// Fixed header map.
    Static(HashMap<String, String>),
    /// Producer invoked once per exchange request.
    Dynamic(Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>),
}

impl HeaderSource {
    /// Materialize the headers for one request.
    #[must_use]
    pub fn resolve(&self) -> HashMap<String, String> {
        match self {
            Self::Static(map) => map.clone(),
            Self::Dynamic(make) => make(),
        }
    }
}

impl std::fmt::Debug for HeaderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(map) => f.debug_tuple("Static").field(&map.len()).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Direct-mode collaborators.
#[derive(Clone)]
pub struct DirectConfig {
    /// The Keycloak-style OIDC client owning the low-level flow.
    pub adapter: Arc<dyn OidcAdapter>,
    /// Optional enclave capability for encrypt/decrypt.
    pub enclave: Option<Arc<dyn EnclaveClient>>,
}

impl std::fmt::Debug for DirectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConfig")
            .field("enclave", &self.enclave.is_some())
            .finish_non_exhaustive()
    }
}

/// Delegated-mode exchange coordinates.
#[derive(Debug, Clone)]
pub struct DelegatedConfig {
    /// Authorization endpoint the login redirect targets.
    pub auth_endpoint: String,
    /// Backend endpoint performing the code-for-token exchange.
    pub exchange_endpoint: String,
    /// Provider identifier sent alongside the exchange payload.
    pub provider: String,
    /// Extra headers for the exchange request.
    pub custom_headers: Option<HeaderSource>,
    /// Where to send the user when a callback arrives without a verifier
    /// (stale/refreshed callback page).
    pub fallback_url: Option<String>,
}

/// External-mode stored-token trust policy.
///
/// `Offline` trusts persisted tokens without any expiry or signature check.
/// That is an intentional trust boundary resting entirely on device-level
/// storage security; hosts choosing it accept that a readable store yields a
/// usable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Validate the stored access token's expiry at bootstrap, refreshing or
    /// discarding as needed. The default.
    #[default]
    Online,
    /// Trust stored tokens unconditionally.
    Offline,
}

/// External-mode collaborators and policy.
#[derive(Clone)]
pub struct ExternalConfig {
    /// Native-host capability object. Required; external mode cannot load
    /// without one.
    pub adapter: Arc<dyn PlatformAdapter>,
    /// Stored-token trust policy.
    pub session_mode: SessionMode,
    /// Provider-hosted page performing bridged enclave operations.
    pub enclave_page_url: Option<String>,
}

impl std::fmt::Debug for ExternalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConfig")
            .field("session_mode", &self.session_mode)
            .field("enclave_page_url", &self.enclave_page_url)
            .finish_non_exhaustive()
    }
}

/// Mode-specific configuration, as a sum type.
#[derive(Debug, Clone)]
pub enum ModeConfig {
    /// Browser-held tokens via the OIDC adapter.
    Direct(DirectConfig),
    /// Backend-mediated token exchange.
    Delegated(DelegatedConfig),
    /// Native app with system browser.
    External(ExternalConfig),
}

/// Immutable-once-loaded session manager configuration.
#[derive(Debug, Clone)]
pub struct IamConfig {
    /// Realm name.
    pub realm: String,
    /// Issuer base URL.
    pub auth_server_url: String,
    /// OIDC client identifier.
    pub client_id: String,
    /// Redirect URI for authorization flows. Defaults to the current page
    /// when absent.
    pub redirect_uri: Option<String>,
    /// Mode-specific sub-configuration.
    pub mode: ModeConfig,
}

impl IamConfig {
    /// The operating mode this configuration selects.
    #[must_use]
    pub fn mode(&self) -> Mode {
        match self.mode {
            ModeConfig::Direct(_) => Mode::Direct,
            ModeConfig::Delegated(_) => Mode::Delegated,
            ModeConfig::External(_) => Mode::External,
        }
    }

    /// Fail-fast validation, before any network activity.
    ///
    /// # Errors
    /// [`IamError::Config`] naming the missing field.
    pub fn validate(&self) -> IamResult<()> {
        if self.realm.trim().is_empty() {
            return Err(IamError::Config("realm must not be empty".to_string()));
        }
        if self.auth_server_url.trim().is_empty() {
            return Err(IamError::Config("authServerUrl must not be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(IamError::Config("clientId must not be empty".to_string()));
        }
        if let ModeConfig::Delegated(dc) = &self.mode {
            if dc.exchange_endpoint.trim().is_empty() {
                return Err(IamError::Config(
                    "delegated mode requires a token-exchange endpoint".to_string(),
                ));
            }
        }
        Ok(())
    }
}
