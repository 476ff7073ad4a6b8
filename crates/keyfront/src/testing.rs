//! Configurable mock collaborators for tests and host-integration
//! prototyping.
//!
//! Each mock records the calls it receives and returns responses installed
//! through `set_*` methods, so tests can drive every branch of the session
//! manager without a real identity provider, native host or enclave.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::adapter::{AdapterEvent, AdapterEventSink, CheckSsoOptions, OidcAdapter};
use crate::enclave::{DecryptItem, EnclaveClient, EncryptItem};
use crate::error::{IamError, IamResult};
use crate::platform::{ExternalCallback, IssuerCoordinates, PlatformAdapter};
use crate::token::StoredTokens;

#[derive(Default)]
struct OidcState {
    sink: Option<AdapterEventSink>,
    initialized: bool,
    authenticated: bool,
    token: Option<String>,
    id_token: Option<String>,
    init_response: Option<Result<bool, String>>,
    update_response: Option<Result<bool, String>>,
    init_calls: usize,
    update_calls: usize,
    last_min_validity: Option<i64>,
    login_return_urls: Vec<Option<String>>,
    logout_calls: usize,
}

/// Scriptable [`OidcAdapter`] double.
#[derive(Default)]
pub struct MockOidcAdapter {
    state: Mutex<OidcState>,
}

impl MockOidcAdapter {
    /// Create an adapter with no scripted responses (everything resolves
    /// unauthenticated).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of the next `init` calls.
    pub fn set_init_response(&self, response: Result<bool, String>) {
        self.state.lock().init_response = Some(response);
    }

    /// Script the outcome of the next `update_token` calls.
    pub fn set_update_response(&self, response: Result<bool, String>) {
        self.state.lock().update_response = Some(response);
    }

    /// Install the access token the adapter reports.
    pub fn set_token(&self, token: Option<&str>) {
        self.state.lock().token = token.map(str::to_string);
    }

    /// Install the ID token the adapter reports.
    pub fn set_id_token(&self, token: Option<&str>) {
        self.state.lock().id_token = token.map(str::to_string);
    }

    /// Force the authenticated flag without going through `init`.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.state.lock().authenticated = authenticated;
    }

    /// Push a lifecycle event through the sink wired at configuration load.
    pub fn emit(&self, event: AdapterEvent) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Number of `init` invocations observed.
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.state.lock().init_calls
    }

    /// Number of `update_token` invocations observed.
    #[must_use]
    pub fn update_calls(&self) -> usize {
        self.state.lock().update_calls
    }

    /// The `min_validity_secs` of the most recent `update_token` call.
    #[must_use]
    pub fn last_min_validity(&self) -> Option<i64> {
        self.state.lock().last_min_validity
    }

    /// Return URLs passed to `login`, in call order.
    #[must_use]
    pub fn login_return_urls(&self) -> Vec<Option<String>> {
        self.state.lock().login_return_urls.clone()
    }

    /// Whether `logout` was invoked.
    #[must_use]
    pub fn was_logout_called(&self) -> bool {
        self.state.lock().logout_calls > 0
    }
}

#[async_trait]
impl OidcAdapter for MockOidcAdapter {
    fn set_event_sink(&self, sink: AdapterEventSink) {
        self.state.lock().sink = Some(sink);
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    async fn init(&self, _options: CheckSsoOptions) -> IamResult<bool> {
        let mut state = self.state.lock();
        state.init_calls += 1;
        state.initialized = true;
        match state.init_response.clone().unwrap_or(Ok(false)) {
            Ok(authenticated) => {
                state.authenticated = authenticated;
                Ok(authenticated)
            }
            Err(message) => Err(IamError::Adapter(message)),
        }
    }

    async fn update_token(&self, min_validity_secs: i64) -> IamResult<bool> {
        let mut state = self.state.lock();
        state.update_calls += 1;
        state.last_min_validity = Some(min_validity_secs);
        match state.update_response.clone().unwrap_or(Ok(false)) {
            Ok(refreshed) => Ok(refreshed),
            Err(message) => Err(IamError::Adapter(message)),
        }
    }

    fn token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    fn id_token(&self) -> Option<String> {
        self.state.lock().id_token.clone()
    }

    fn authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    async fn login(&self, return_url: Option<&str>) -> IamResult<()> {
        self.state.lock().login_return_urls.push(return_url.map(str::to_string));
        Ok(())
    }

    async fn logout(&self) -> IamResult<()> {
        let mut state = self.state.lock();
        state.logout_calls += 1;
        state.authenticated = false;
        state.token = None;
        state.id_token = None;
        Ok(())
    }
}

struct PlatformState {
    issuer: IssuerCoordinates,
    stored: Option<StoredTokens>,
    opened_urls: Vec<String>,
    open_response: Result<(), String>,
    supports_encryption: bool,
    proof_header_name: Option<String>,
    receiver: Option<mpsc::UnboundedReceiver<ExternalCallback>>,
}

/// Scriptable [`PlatformAdapter`] double with an owned callback channel.
pub struct MockPlatformAdapter {
    state: Mutex<PlatformState>,
    sender: mpsc::UnboundedSender<ExternalCallback>,
}

impl MockPlatformAdapter {
    /// Create an adapter pointing at the given issuer endpoints.
    #[must_use]
    pub fn new(authorization_endpoint: &str, token_endpoint: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(PlatformState {
                issuer: IssuerCoordinates {
                    authorization_endpoint: authorization_endpoint.to_string(),
                    token_endpoint: token_endpoint.to_string(),
                },
                stored: None,
                opened_urls: Vec::new(),
                open_response: Ok(()),
                supports_encryption: false,
                proof_header_name: None,
                receiver: Some(receiver),
            }),
            sender,
        }
    }

    /// Seed device storage with a token set, as if a prior session left one.
    pub fn set_stored_tokens(&self, tokens: Option<StoredTokens>) {
        self.state.lock().stored = tokens;
    }

    /// Script the outcome of `open_url`.
    pub fn set_open_response(&self, response: Result<(), String>) {
        self.state.lock().open_response = response;
    }

    /// Advertise encryption-callback support.
    pub fn set_supports_encryption(&self, supported: bool) {
        self.state.lock().supports_encryption = supported;
    }

    /// Attach a proof-of-possession header carrying the server nonce (or
    /// `"initial"` before one is known) as its value.
    pub fn set_proof_header(&self, name: Option<&str>) {
        self.state.lock().proof_header_name = name.map(str::to_string);
    }

    /// Deliver a callback as the native host would.
    pub fn deliver(&self, callback: ExternalCallback) {
        let _ = self.sender.send(callback);
    }

    /// Current contents of the mock device storage.
    #[must_use]
    pub fn stored_tokens(&self) -> Option<StoredTokens> {
        self.state.lock().stored.clone()
    }

    /// URLs passed to `open_url`, in call order.
    #[must_use]
    pub fn opened_urls(&self) -> Vec<String> {
        self.state.lock().opened_urls.clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockPlatformAdapter {
    fn issuer(&self) -> IssuerCoordinates {
        self.state.lock().issuer.clone()
    }

    async fn open_url(&self, url: &str) -> IamResult<()> {
        let mut state = self.state.lock();
        state.opened_urls.push(url.to_string());
        state.open_response.clone().map_err(IamError::Adapter)
    }

    async fn store_tokens(&self, tokens: &StoredTokens) -> IamResult<()> {
        self.state.lock().stored = Some(tokens.clone());
        Ok(())
    }

    async fn retrieve_tokens(&self) -> IamResult<Option<StoredTokens>> {
        Ok(self.state.lock().stored.clone())
    }

    async fn delete_tokens(&self) -> IamResult<()> {
        self.state.lock().stored = None;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExternalCallback> {
        // One live receiver per adapter; later subscribers get a dead
        // channel rather than stealing deliveries.
        self.state
            .lock()
            .receiver
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    fn supports_encryption_callbacks(&self) -> bool {
        self.state.lock().supports_encryption
    }

    fn proof_header(&self, nonce: Option<&str>) -> Option<(String, String)> {
        let name = self.state.lock().proof_header_name.clone()?;
        Some((name, nonce.unwrap_or("initial").to_string()))
    }
}

#[derive(Default)]
struct EnclaveState {
    encrypt_response: Option<Result<Vec<String>, String>>,
    decrypt_response: Option<Result<Vec<String>, String>>,
    encrypt_batches: Vec<Vec<EncryptItem>>,
    decrypt_batches: Vec<Vec<DecryptItem>>,
}

/// Scriptable [`EnclaveClient`] double.
#[derive(Default)]
pub struct MockEnclave {
    state: Mutex<EnclaveState>,
}

impl MockEnclave {
    /// Create an enclave whose operations resolve to empty batches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of `encrypt`.
    pub fn set_encrypt_response(&self, response: Result<Vec<String>, String>) {
        self.state.lock().encrypt_response = Some(response);
    }

    /// Script the outcome of `decrypt`.
    pub fn set_decrypt_response(&self, response: Result<Vec<String>, String>) {
        self.state.lock().decrypt_response = Some(response);
    }

    /// Batches passed to `encrypt`, in call order.
    #[must_use]
    pub fn encrypt_batches(&self) -> Vec<Vec<EncryptItem>> {
        self.state.lock().encrypt_batches.clone()
    }

    /// Whether any enclave operation was invoked.
    #[must_use]
    pub fn was_called(&self) -> bool {
        let state = self.state.lock();
        !state.encrypt_batches.is_empty() || !state.decrypt_batches.is_empty()
    }
}

#[async_trait]
impl EnclaveClient for MockEnclave {
    async fn encrypt(&self, items: &[EncryptItem]) -> IamResult<Vec<String>> {
        let mut state = self.state.lock();
        state.encrypt_batches.push(items.to_vec());
        state
            .encrypt_response
            .clone()
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(IamError::Bridge)
    }

    async fn decrypt(&self, items: &[DecryptItem]) -> IamResult<Vec<String>> {
        let mut state = self.state.lock();
        state.decrypt_batches.push(items.to_vec());
        state
            .decrypt_response
            .clone()
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(IamError::Bridge)
    }
}

/// Build a JWT-shaped string with the given JSON payload and a fake
/// signature, for tests that only need a decodable claim set.
#[must_use]
pub fn fake_jwt(payload: &serde_json::Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{header}.{body}.signature")
}
