//! The session manager: multi-mode authentication state machine.
//!
//! One constructible service object orchestrates one of three mutually
//! exclusive modes atop the leaf components: *direct* (the browser owns
//! tokens through the OIDC adapter), *delegated* (the browser does PKCE, a
//! backend exchanges the code), and *external* (a native app opens the
//! system browser and exchanges the code itself). The manager owns the event
//! bus, mode dispatch and all session-lifecycle state; consumers read state
//! through getters or react to events, never mutating directly.
//!
//! Every lifecycle event is emitted after the state mutation it describes,
//! so a listener reading session state synchronously inside a handler
//! observes the post-transition value.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use url::Url;

use crate::adapter::{AdapterEvent, AdapterEventSink, CheckSsoOptions};
use crate::browser::BrowserContext;
use crate::config::{DelegatedConfig, DirectConfig, IamConfig, Mode, ModeConfig};
use crate::enclave::{self, DecryptItem, EncryptItem};
use crate::error::{IamError, IamResult};
use crate::events::{EventBus, EventKind, IamEvent, SubscriptionId};
use crate::external::{self, ExternalRuntime};
use crate::http::HttpJsonClient;
use crate::pkce::{generate_verifier, PkceTriple};
use crate::single_flight::SingleFlight;
use crate::token::{self, decode_payload, StoredTokens};

/// Cookie written on successful direct-mode authentication/refresh for
/// consumption by server-side middleware. Path `/`.
pub const TOKEN_COOKIE: &str = "kcToken";

/// Static page the silent-SSO iframe loads in direct mode.
const SILENT_SSO_PATH: &str = "/silent-check-sso.html";

/// Prefix marking a return URL embedded in the OAuth `state` parameter.
pub(crate) const STATE_URL_PREFIX: &str = "__url_";

/// Access tokens expiring within this many seconds are refreshed
/// proactively.
pub(crate) const REFRESH_BUFFER_SECS: i64 = 30;

/// Transient-storage keys, scoped to a single authorization attempt.
pub(crate) mod storage_keys {
    /// PKCE verifier awaiting the authorization callback.
    pub const VERIFIER: &str = "keyfront.pkce_verifier";
    /// Return URL persisted independently of the `state` parameter.
    pub const RETURN_URL: &str = "keyfront.return_url";
    /// Redirect URI used for the pending authorization attempt.
    pub const REDIRECT_URI: &str = "keyfront.redirect_uri";
}

/// Result of processing an incoming authorization redirect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackOutcome {
    /// Whether the current invocation recognized and consumed a callback.
    /// `false` means "not a callback page at all", which is not a failure.
    pub handled: bool,
    /// Authentication state after processing.
    pub authenticated: bool,
}

/// Parsed callback data for hosts driving their own exchange instead of the
/// built-in one.
#[derive(Debug, Clone, Default)]
pub struct HybridCallbackData {
    /// Whether the current URL carries authorization response parameters.
    pub is_callback: bool,
    /// Authorization code, when present.
    pub code: Option<String>,
    /// PKCE verifier read from transient storage.
    pub verifier: Option<String>,
    /// Redirect URI of the pending attempt.
    pub redirect_uri: Option<String>,
    /// Recovered return URL (`state` parameter preferred, storage fallback).
    pub return_url: Option<String>,
    /// Provider identifier from the delegated configuration.
    pub provider: Option<String>,
    /// OAuth error code, when the callback reports a failure.
    pub error: Option<String>,
    /// OAuth error description, when present.
    pub error_description: Option<String>,
}

/// Options for [`SessionManager::get_hybrid_callback_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackDataOptions {
    /// Consume the verifier and return URL from transient storage rather
    /// than peeking. A consumed verifier cannot be read a second time.
    pub consume: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) authenticated: bool,
    pub(crate) tokens: Option<StoredTokens>,
    pub(crate) return_url: Option<String>,
}

pub(crate) struct SessionInner {
    pub(crate) http: HttpJsonClient,
    pub(crate) browser: Option<Arc<dyn BrowserContext>>,
    pub(crate) bus: EventBus,
    pub(crate) config: OnceLock<IamConfig>,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) init_flight: SingleFlight<bool>,
    pub(crate) external: ExternalRuntime,
}

/// Multi-mode IAM session manager.
///
/// Construct one per application root with the collaborators it should use;
/// clones share the same state. A manager built without a browser context
/// models a server-side-rendering host: [`init_iam`] is then a documented
/// no-op resolving `false`.
///
/// [`init_iam`]: SessionManager::init_iam
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("mode", &self.mode())
            .field("authenticated", &self.is_logged_in())
            .finish()
    }
}

impl SessionManager {
    /// Create a manager bound to a browser-like runtime, or to none (SSR).
    #[must_use]
    pub fn new(browser: Option<Arc<dyn BrowserContext>>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                http: HttpJsonClient::new(),
                browser,
                bus: EventBus::new(),
                config: OnceLock::new(),
                state: RwLock::new(SessionState::default()),
                init_flight: SingleFlight::new(),
                external: ExternalRuntime::default(),
            }),
        }
    }

    /// The lifecycle event bus. Clones share the subscriber list.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.inner.bus.clone()
    }

    /// Convenience subscription for [`IamEvent::Ready`].
    pub fn on_ready<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.bus.on(EventKind::Ready, move |event| {
            if let IamEvent::Ready { authenticated } = event {
                handler(*authenticated);
            }
        })
    }

    /// Load configuration exactly once.
    ///
    /// Idempotent: returns the cached configuration when one is already
    /// loaded, ignoring the argument. Returns `None` and logs when the
    /// candidate fails validation. For direct mode, wires the adapter's
    /// lifecycle notifications into the event bus.
    pub fn load_config(&self, config: IamConfig) -> Option<&IamConfig> {
        if let Some(existing) = self.inner.config.get() {
            debug!("configuration already loaded; ignoring new candidate");
            return Some(existing);
        }

        if let Err(err) = config.validate() {
            error!(%err, "rejecting configuration");
            return None;
        }

        if let ModeConfig::Direct(direct) = &config.mode {
            let weak = Arc::downgrade(&self.inner);
            let sink: AdapterEventSink = Arc::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    forward_adapter_event(&inner, event);
                }
            });
            direct.adapter.set_event_sink(sink);
        }

        // A concurrent load may have won; first writer wins either way.
        let _ = self.inner.config.set(config);
        self.inner.config.get()
    }

    /// The active mode, once configuration is loaded.
    #[must_use]
    pub fn mode(&self) -> Option<Mode> {
        self.inner.config.get().map(IamConfig::mode)
    }

    /// Bootstrap the session. Called once by the host at startup; duplicate
    /// concurrent calls share the same in-flight work.
    ///
    /// Resolves the resulting authentication state. Failures surface as
    /// `InitError`/`AuthError` events rather than an error return, so UI
    /// layers need no try/catch of their own.
    pub async fn init_iam(&self, config: IamConfig) -> bool {
        if self.inner.browser.is_none() {
            debug!("no browser context; skipping IAM bootstrap");
            self.inner.bus.emit(&IamEvent::InitError {
                message: "no browser-capable runtime available".to_string(),
            });
            return false;
        }

        if self.load_config(config).is_none() {
            self.inner.bus.emit(&IamEvent::InitError {
                message: "configuration rejected; see logs".to_string(),
            });
            return false;
        }

        let Some(cfg) = self.inner.config.get() else {
            return false;
        };

        match &cfg.mode {
            ModeConfig::Direct(direct) => self.init_direct(direct.clone()).await,
            ModeConfig::Delegated(_) => {
                let inner = Arc::clone(&self.inner);
                self.inner
                    .init_flight
                    .get_or_run(move || run_delegated_bootstrap(inner).boxed())
                    .await
            }
            ModeConfig::External(ec) => {
                let inner = Arc::clone(&self.inner);
                let ec = ec.clone();
                self.inner
                    .init_flight
                    .get_or_run(move || external::run_external_bootstrap(inner, ec).boxed())
                    .await
            }
        }
    }

    async fn init_direct(&self, direct: DirectConfig) -> bool {
        if direct.adapter.is_initialized() {
            // Bootstrap already ran for this adapter; report current state.
            return direct.adapter.authenticated();
        }

        let silent_uri = self
            .inner
            .browser
            .as_ref()
            .and_then(|b| b.current_url())
            .map(|url| format!("{}{SILENT_SSO_PATH}", url.origin().ascii_serialization()))
            .unwrap_or_else(|| SILENT_SSO_PATH.to_string());

        let options = CheckSsoOptions {
            pkce_method: "S256".to_string(),
            silent_check_sso_redirect_uri: silent_uri,
        };

        match direct.adapter.init(options).await {
            Ok(authenticated) => {
                self.inner.state.write().authenticated = authenticated;
                if authenticated {
                    write_token_cookie(&self.inner);
                }
                self.inner.bus.emit(&IamEvent::Ready { authenticated });
                authenticated
            }
            Err(err) => {
                error!(%err, "direct-mode bootstrap failed");
                self.inner.bus.emit(&IamEvent::InitError { message: err.to_string() });
                self.inner.bus.emit(&IamEvent::Ready { authenticated: false });
                false
            }
        }
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.inner.state.read().authenticated
    }

    /// Return URL captured from the last completed authorization flow.
    #[must_use]
    pub fn return_url(&self) -> Option<String> {
        self.inner.state.read().return_url.clone()
    }

    /// Current access token.
    ///
    /// In external mode a token nearing expiry (30-second buffer) is
    /// refreshed first when a refresh token is available; a failed proactive
    /// refresh is reported via events and yields `None`.
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode, where tokens
    /// never touch the browser runtime.
    pub async fn get_token(&self) -> IamResult<Option<String>> {
        match self.mode_config()? {
            ModeConfig::Direct(d) => Ok(d.adapter.token()),
            ModeConfig::Delegated(_) => Err(IamError::NotAvailableInMode {
                operation: "getToken",
                mode: Mode::Delegated,
            }),
            ModeConfig::External(ec) => {
                let expiring = {
                    let state = self.inner.state.read();
                    state.tokens.as_ref().is_some_and(|t| {
                        t.refresh_token.is_some()
                            && t.expiry_seconds().is_some_and(|s| s <= REFRESH_BUFFER_SECS)
                    })
                };
                if expiring {
                    let ec = ec.clone();
                    if let Err(err) =
                        external::refresh(Arc::clone(&self.inner), ec, false).await
                    {
                        warn!(%err, "proactive refresh failed");
                    }
                }
                Ok(self.inner.state.read().tokens.as_ref().map(|t| t.access_token.clone()))
            }
        }
    }

    /// Seconds until the current access token expires. Zero when no token or
    /// expiry is known; negative when already expired.
    #[must_use]
    pub fn get_token_expiry_seconds(&self) -> i64 {
        self.current_access_token()
            .as_deref()
            .and_then(decode_payload)
            .as_ref()
            .and_then(token::expiry_seconds)
            .unwrap_or(0)
    }

    /// Current ID token, when the active mode holds one client-side.
    #[must_use]
    pub fn get_id_token(&self) -> Option<String> {
        match self.inner.config.get().map(|c| &c.mode) {
            Some(ModeConfig::Direct(d)) => d.adapter.id_token(),
            Some(ModeConfig::External(_)) => {
                self.inner.state.read().tokens.as_ref().and_then(|t| t.id_token.clone())
            }
            _ => None,
        }
    }

    /// Whether the access token carries a realm role.
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode.
    pub fn has_realm_role(&self, role: &str) -> IamResult<bool> {
        let payload = self.access_payload("hasRealmRole")?;
        Ok(payload.as_ref().is_some_and(|p| token::has_realm_role(p, role)))
    }

    /// Whether the access token carries a client role. Defaults to the
    /// configured client when `client_id` is absent.
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode.
    pub fn has_client_role(&self, role: &str, client_id: Option<&str>) -> IamResult<bool> {
        let payload = self.access_payload("hasClientRole")?;
        let default_client =
            self.inner.config.get().map(|c| c.client_id.clone()).unwrap_or_default();
        let client = client_id.unwrap_or(&default_client);
        Ok(payload.as_ref().is_some_and(|p| token::has_client_role(p, client, role)))
    }

    /// Look up a claim in the access token.
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode.
    pub fn get_claim(&self, key: &str) -> IamResult<Option<Value>> {
        let payload = self.access_payload("getClaim")?;
        Ok(payload.as_ref().and_then(|p| token::claim(p, key)).cloned())
    }

    /// Look up a claim in the ID token.
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode.
    pub fn get_id_claim(&self, key: &str) -> IamResult<Option<Value>> {
        if self.mode() == Some(Mode::Delegated) {
            return Err(IamError::NotAvailableInMode {
                operation: "getIdClaim",
                mode: Mode::Delegated,
            });
        }
        let payload = self.get_id_token().as_deref().and_then(decode_payload);
        Ok(payload.as_ref().and_then(|p| token::claim(p, key)).cloned())
    }

    /// Refresh the access token if it expires within the 30-second buffer.
    /// Resolves `true` when a new token was obtained.
    ///
    /// # Errors
    /// The refresh failure, after an `AuthRefreshError` emission. Delegated
    /// mode resolves `Ok(false)`: refresh is server-owned there.
    pub async fn refresh_token(&self) -> IamResult<bool> {
        self.refresh(REFRESH_BUFFER_SECS).await
    }

    /// Refresh the access token unconditionally.
    ///
    /// # Errors
    /// Same contract as [`Self::refresh_token`].
    pub async fn force_refresh_token(&self) -> IamResult<bool> {
        self.refresh(-1).await
    }

    async fn refresh(&self, min_validity_secs: i64) -> IamResult<bool> {
        match self.mode_config()? {
            ModeConfig::Direct(d) => {
                let adapter = Arc::clone(&d.adapter);
                // The middleware cookie is stale for the duration of the
                // refresh.
                if let Some(browser) = &self.inner.browser {
                    browser.clear_cookie(TOKEN_COOKIE);
                }
                match adapter.update_token(min_validity_secs).await {
                    Ok(refreshed) => {
                        write_token_cookie(&self.inner);
                        if refreshed {
                            self.inner.bus.emit(&IamEvent::AuthRefreshSuccess);
                        }
                        Ok(refreshed)
                    }
                    Err(err) => {
                        error!(%err, "direct-mode refresh failed");
                        self.clear_session();
                        self.inner.bus.emit(&IamEvent::AuthRefreshError);
                        Err(err)
                    }
                }
            }
            ModeConfig::Delegated(_) => {
                debug!("refresh is not client-visible in delegated mode");
                Ok(false)
            }
            ModeConfig::External(ec) => {
                let ec = ec.clone();
                external::refresh(Arc::clone(&self.inner), ec, min_validity_secs < 0).await
            }
        }
    }

    /// Start an interactive login.
    ///
    /// Direct mode delegates to the adapter; delegated mode generates PKCE,
    /// persists the verifier and return URL in transient storage and
    /// navigates to the authorization endpoint; external mode opens the
    /// system browser through the platform adapter.
    ///
    /// # Errors
    /// Configuration or collaborator failures building the request.
    pub async fn login(&self, return_url: Option<&str>) -> IamResult<()> {
        match self.mode_config()? {
            ModeConfig::Direct(d) => d.adapter.login(return_url).await,
            ModeConfig::Delegated(dc) => {
                let dc = dc.clone();
                self.delegated_login(&dc, return_url)
            }
            ModeConfig::External(ec) => {
                let ec = ec.clone();
                external::login(
                    Arc::clone(&self.inner),
                    ec,
                    return_url.map(str::to_string),
                )
                .await
            }
        }
    }

    fn delegated_login(&self, dc: &DelegatedConfig, return_url: Option<&str>) -> IamResult<()> {
        let browser = self
            .inner
            .browser
            .as_ref()
            .ok_or_else(|| IamError::Config("login requires a browser context".to_string()))?;
        let cfg = self.require_config()?;

        let pkce = PkceTriple::generate();
        browser.storage_set(storage_keys::VERIFIER, &pkce.verifier);

        let redirect_uri = cfg
            .redirect_uri
            .clone()
            .or_else(|| browser.current_url().map(|u| page_without_query(&u)))
            .ok_or_else(|| IamError::Config("no redirect URI available".to_string()))?;
        browser.storage_set(storage_keys::REDIRECT_URI, &redirect_uri);

        // The state parameter may be rewritten by identity brokers, so the
        // return URL is persisted independently as a fallback source.
        let state = match return_url {
            Some(target) => {
                browser.storage_set(storage_keys::RETURN_URL, target);
                format!("{STATE_URL_PREFIX}{}", urlencoding::encode(target))
            }
            None => generate_verifier(32),
        };

        let query = [
            ("response_type", "code"),
            ("client_id", cfg.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", "openid"),
            ("state", state.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", pkce.method),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        browser.navigate(&format!("{}?{query}", dc.auth_endpoint));
        Ok(())
    }

    /// Terminate the session: clear state, cookie and transient storage,
    /// emit `Logout`, and tear down mode-held credentials.
    ///
    /// # Errors
    /// Collaborator failures during teardown; local state is cleared first
    /// regardless.
    pub async fn logout(&self) -> IamResult<()> {
        self.clear_session();
        self.inner.init_flight.reset();
        self.inner.bus.emit(&IamEvent::Logout);

        match self.inner.config.get().map(|c| &c.mode) {
            Some(ModeConfig::Direct(d)) => d.adapter.logout().await,
            Some(ModeConfig::External(ec)) => {
                self.inner.external.reset();
                ec.adapter.delete_tokens().await
            }
            _ => Ok(()),
        }
    }

    /// Encrypt a batch of tagged items.
    ///
    /// Every tag of every item must be covered by a `_tide_<tag>.selfencrypt`
    /// role on the active session; a single missing tag rejects the whole
    /// batch before any network activity (single-item retry is always
    /// possible; partial-batch authorization is not supported).
    ///
    /// # Errors
    /// [`IamError::NotAvailableInMode`] in delegated mode,
    /// [`IamError::TagUnauthorized`] naming the first unauthorized tag, or
    /// the enclave/bridge failure.
    pub async fn encrypt(&self, items: &[EncryptItem]) -> IamResult<Vec<String>> {
        match self.mode_config()? {
            ModeConfig::Delegated(_) => Err(IamError::NotAvailableInMode {
                operation: "encrypt",
                mode: Mode::Delegated,
            }),
            ModeConfig::Direct(d) => {
                self.ensure_tag_roles(
                    items.iter().flat_map(|i| i.tags.iter()),
                    enclave::self_encrypt_role,
                )?;
                let client = d.enclave.clone().ok_or_else(|| {
                    IamError::Config("no enclave client configured".to_string())
                })?;
                client.encrypt(items).await
            }
            ModeConfig::External(ec) => {
                self.ensure_tag_roles(
                    items.iter().flat_map(|i| i.tags.iter()),
                    enclave::self_encrypt_role,
                )?;
                let ec = ec.clone();
                let payload = serde_json::to_string(items)?;
                external::bridge_operation(Arc::clone(&self.inner), ec, "encrypt", payload).await
            }
        }
    }

    /// Decrypt a batch of tagged items. Mirrors [`Self::encrypt`] with
    /// `_tide_<tag>.selfdecrypt` roles.
    ///
    /// # Errors
    /// Same contract as [`Self::encrypt`].
    pub async fn decrypt(&self, items: &[DecryptItem]) -> IamResult<Vec<String>> {
        match self.mode_config()? {
            ModeConfig::Delegated(_) => Err(IamError::NotAvailableInMode {
                operation: "decrypt",
                mode: Mode::Delegated,
            }),
            ModeConfig::Direct(d) => {
                self.ensure_tag_roles(
                    items.iter().flat_map(|i| i.tags.iter()),
                    enclave::self_decrypt_role,
                )?;
                let client = d.enclave.clone().ok_or_else(|| {
                    IamError::Config("no enclave client configured".to_string())
                })?;
                client.decrypt(items).await
            }
            ModeConfig::External(ec) => {
                self.ensure_tag_roles(
                    items.iter().flat_map(|i| i.tags.iter()),
                    enclave::self_decrypt_role,
                )?;
                let ec = ec.clone();
                let payload = serde_json::to_string(items)?;
                external::bridge_operation(Arc::clone(&self.inner), ec, "decrypt", payload).await
            }
        }
    }

    /// Read the current authorization callback data without running the
    /// built-in exchange, for hosts driving their own.
    #[must_use]
    pub fn get_hybrid_callback_data(&self, options: CallbackDataOptions) -> HybridCallbackData {
        let Some(browser) = self.inner.browser.as_ref() else {
            return HybridCallbackData::default();
        };
        let Some(url) = browser.current_url() else {
            return HybridCallbackData::default();
        };

        let params = query_params(&url);
        let code = params.get("code").cloned();
        let error = params.get("error").cloned();

        let verifier = if options.consume {
            browser.storage_remove(storage_keys::VERIFIER)
        } else {
            browser.storage_get(storage_keys::VERIFIER)
        };
        let stored_return_url = if options.consume {
            browser.storage_remove(storage_keys::RETURN_URL)
        } else {
            browser.storage_get(storage_keys::RETURN_URL)
        };

        let cfg = self.inner.config.get();
        let redirect_uri = cfg
            .and_then(|c| c.redirect_uri.clone())
            .or_else(|| browser.storage_get(storage_keys::REDIRECT_URI))
            .or_else(|| Some(page_without_query(&url)));
        let provider = cfg.and_then(|c| match &c.mode {
            ModeConfig::Delegated(dc) => Some(dc.provider.clone()),
            _ => None,
        });

        let return_url = params
            .get("state")
            .and_then(|s| decode_state_return_url(s))
            .or(stored_return_url);

        HybridCallbackData {
            is_callback: code.is_some() || error.is_some(),
            code,
            verifier,
            redirect_uri,
            return_url,
            provider,
            error,
            error_description: params.get("error_description").cloned(),
        }
    }

    fn mode_config(&self) -> IamResult<&ModeConfig> {
        self.require_config().map(|c| &c.mode)
    }

    fn require_config(&self) -> IamResult<&IamConfig> {
        self.inner
            .config
            .get()
            .ok_or_else(|| IamError::Config("configuration not loaded".to_string()))
    }

    fn current_access_token(&self) -> Option<String> {
        match self.inner.config.get().map(|c| &c.mode) {
            Some(ModeConfig::Direct(d)) => d.adapter.token(),
            Some(ModeConfig::External(_)) => {
                self.inner.state.read().tokens.as_ref().map(|t| t.access_token.clone())
            }
            _ => None,
        }
    }

    fn access_payload(&self, operation: &'static str) -> IamResult<Option<Value>> {
        if self.mode() == Some(Mode::Delegated) {
            return Err(IamError::NotAvailableInMode { operation, mode: Mode::Delegated });
        }
        Ok(self.current_access_token().as_deref().and_then(decode_payload))
    }

    fn ensure_tag_roles<'a, I, F>(&self, tags: I, role_for: F) -> IamResult<()>
    where
        I: Iterator<Item = &'a String>,
        F: Fn(&str) -> String,
    {
        let payload = self.access_payload("encrypt/decrypt")?;
        let payload = payload.ok_or(IamError::NotAuthenticated)?;
        for tag in tags {
            if !token::has_realm_role(&payload, &role_for(tag)) {
                return Err(IamError::TagUnauthorized { tag: tag.clone() });
            }
        }
        Ok(())
    }

    fn clear_session(&self) {
        let mut state = self.inner.state.write();
        state.authenticated = false;
        state.tokens = None;
        state.return_url = None;
        drop(state);

        if let Some(browser) = &self.inner.browser {
            browser.clear_cookie(TOKEN_COOKIE);
            browser.storage_remove(storage_keys::VERIFIER);
            browser.storage_remove(storage_keys::RETURN_URL);
            browser.storage_remove(storage_keys::REDIRECT_URI);
        }
    }
}

/// Delegated-mode bootstrap: run the callback subroutine, or report the
/// current state when the page is not a callback.
async fn run_delegated_bootstrap(inner: Arc<SessionInner>) -> bool {
    let outcome = handle_delegated_callback(&inner).await;
    if outcome.handled {
        return outcome.authenticated;
    }
    let authenticated = inner.state.read().authenticated;
    inner.bus.emit(&IamEvent::Ready { authenticated });
    authenticated
}

/// Delegated-mode authorization callback handling. The most
/// failure-sensitive subroutine in the crate; see the outcome table in the
/// module docs of [`crate::error`] for the named failure conditions.
async fn handle_delegated_callback(inner: &Arc<SessionInner>) -> CallbackOutcome {
    let Some(browser) = inner.browser.clone() else {
        return CallbackOutcome::default();
    };
    let Some(cfg) = inner.config.get() else {
        return CallbackOutcome::default();
    };
    let ModeConfig::Delegated(dc) = &cfg.mode else {
        return CallbackOutcome::default();
    };
    let Some(url) = browser.current_url() else {
        return CallbackOutcome::default();
    };

    let params = query_params(&url);

    if let Some(code) = params.get("error") {
        let message = match params.get("error_description") {
            Some(desc) => format!("authorization failed: {code}: {desc}"),
            None => format!("authorization failed: {code}"),
        };
        inner.state.write().authenticated = false;
        inner.bus.emit(&IamEvent::AuthError { message });
        inner.bus.emit(&IamEvent::Ready { authenticated: false });
        return CallbackOutcome { handled: true, authenticated: false };
    }

    let Some(code) = params.get("code") else {
        // Not a callback page; callers must not treat this as failure.
        return CallbackOutcome::default();
    };

    // Exactly-once consumption: the verifier is deleted before any network
    // call so no retry can reuse it.
    let Some(verifier) = browser.storage_remove(storage_keys::VERIFIER) else {
        // Code present, verifier gone: a stale or replayed callback (page
        // refresh), named distinctly from exchange failure.
        warn!("authorization code present but verifier missing; stale callback");
        if let Some(fallback) = &dc.fallback_url {
            browser.navigate(fallback);
        }
        inner.state.write().authenticated = false;
        inner
            .bus
            .emit(&IamEvent::AuthError { message: IamError::MissingVerifier.to_string() });
        inner.bus.emit(&IamEvent::Ready { authenticated: false });
        return CallbackOutcome { handled: true, authenticated: false };
    };

    let redirect_uri = cfg
        .redirect_uri
        .clone()
        .or_else(|| browser.storage_remove(storage_keys::REDIRECT_URI))
        .unwrap_or_else(|| page_without_query(&url));

    // Backends expecting an opaque "access token" field receive the exchange
    // parameters as a single JSON string.
    let exchange = json!({
        "code": code,
        "code_verifier": verifier,
        "redirect_uri": redirect_uri,
    });
    let body = json!({
        "accessToken": exchange.to_string(),
        "provider": dc.provider,
    });
    let headers = dc.custom_headers.as_ref().map(|h| h.resolve()).unwrap_or_default();

    match inner.http.post_json(&dc.exchange_endpoint, &body, &headers).await {
        Ok(_) => {
            let return_url = params
                .get("state")
                .and_then(|s| decode_state_return_url(s))
                .or_else(|| browser.storage_remove(storage_keys::RETURN_URL));

            {
                let mut state = inner.state.write();
                state.authenticated = true;
                state.return_url = return_url;
            }
            inner.bus.emit(&IamEvent::AuthSuccess);
            strip_oidc_params(browser.as_ref(), &url);
            inner.bus.emit(&IamEvent::Ready { authenticated: true });
            CallbackOutcome { handled: true, authenticated: true }
        }
        Err(err) => {
            error!(%err, "delegated token exchange failed");
            inner.state.write().authenticated = false;
            inner.bus.emit(&IamEvent::AuthError { message: err.to_string() });
            inner.bus.emit(&IamEvent::Ready { authenticated: false });
            CallbackOutcome { handled: true, authenticated: false }
        }
    }
}

fn forward_adapter_event(inner: &Arc<SessionInner>, event: AdapterEvent) {
    match event {
        AdapterEvent::Ready { authenticated } => {
            inner.state.write().authenticated = authenticated;
            inner.bus.emit(&IamEvent::Ready { authenticated });
        }
        AdapterEvent::AuthSuccess => {
            inner.state.write().authenticated = true;
            write_token_cookie(inner);
            inner.bus.emit(&IamEvent::AuthSuccess);
        }
        AdapterEvent::AuthError { message } => {
            inner.bus.emit(&IamEvent::AuthError { message });
        }
        AdapterEvent::AuthRefreshSuccess => {
            write_token_cookie(inner);
            inner.bus.emit(&IamEvent::AuthRefreshSuccess);
        }
        AdapterEvent::AuthRefreshError => {
            inner.bus.emit(&IamEvent::AuthRefreshError);
        }
        AdapterEvent::Logout => {
            {
                let mut state = inner.state.write();
                state.authenticated = false;
                state.tokens = None;
            }
            if let Some(browser) = &inner.browser {
                browser.clear_cookie(TOKEN_COOKIE);
            }
            inner.bus.emit(&IamEvent::Logout);
        }
        AdapterEvent::TokenExpired => {
            inner.bus.emit(&IamEvent::TokenExpired);
        }
    }
}

/// Persist the direct-mode access token for server-side middleware.
fn write_token_cookie(inner: &SessionInner) {
    let Some(browser) = &inner.browser else {
        return;
    };
    let Some(ModeConfig::Direct(direct)) = inner.config.get().map(|c| &c.mode) else {
        return;
    };
    if let Some(access_token) = direct.adapter.token() {
        let max_age = decode_payload(&access_token)
            .as_ref()
            .and_then(token::expiry_seconds)
            .unwrap_or(300)
            .max(0);
        browser.set_cookie(TOKEN_COOKIE, &access_token, max_age);
    }
}

pub(crate) fn query_params(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

/// Return URL embedded in the `state` parameter, when it carries the
/// recognized prefix.
pub(crate) fn decode_state_return_url(state: &str) -> Option<String> {
    state.strip_prefix(STATE_URL_PREFIX).map(|encoded| {
        urlencoding::decode(encoded)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| encoded.to_string())
    })
}

fn page_without_query(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.to_string()
}

/// Remove OIDC response parameters from the visible URL without navigating.
fn strip_oidc_params(browser: &dyn BrowserContext, url: &Url) {
    const OIDC_PARAMS: [&str; 6] =
        ["code", "state", "session_state", "iss", "error", "error_description"];

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(name, _)| !OIDC_PARAMS.contains(&name.as_str()))
        .collect();

    let mut stripped = url.clone();
    stripped.set_query(None);
    if !retained.is_empty() {
        let mut pairs = stripped.query_pairs_mut();
        for (name, value) in &retained {
            pairs.append_pair(name, value);
        }
    }
    browser.replace_url(&stripped);
}
