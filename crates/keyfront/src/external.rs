//! External/native mode runtime.
//!
//! A native host opens the system browser for authorization and delivers
//! redirects back over the platform adapter's callback channel. The app
//! exchanges the code against the token endpoint itself and persists the
//! resulting token set in device storage; the session manager owns the
//! in-memory copy and the refresh lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ExternalConfig, SessionMode};
use crate::error::{IamError, IamResult};
use crate::events::IamEvent;
use crate::pkce::{generate_verifier, PkceTriple};
use crate::platform::ExternalCallback;
use crate::session::{
    decode_state_return_url, CallbackOutcome, SessionInner, REFRESH_BUFFER_SECS, STATE_URL_PREFIX,
};
use crate::token::StoredTokens;

/// How long a bridged enclave operation may wait for its callback.
pub(crate) const PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// Authorization attempt awaiting its redirect callback.
#[derive(Debug)]
pub(crate) struct PendingLogin {
    verifier: String,
    redirect_uri: String,
    return_url: Option<String>,
}

/// Mutable external-mode state held by the session manager.
#[derive(Default)]
pub(crate) struct ExternalRuntime {
    pending_login: Mutex<Option<PendingLogin>>,
    pending_ops: Mutex<HashMap<String, oneshot::Sender<IamResult<Vec<String>>>>>,
    // A callback already consumed exactly once must not re-submit its
    // single-use code when the host replays it.
    callback_handled: AtomicBool,
    callback_processing: AtomicBool,
    listener_started: AtomicBool,
}

impl ExternalRuntime {
    /// Drop all pending work, on logout.
    pub(crate) fn reset(&self) {
        *self.pending_login.lock() = None;
        self.pending_ops.lock().clear();
        self.callback_handled.store(false, Ordering::SeqCst);
        self.callback_processing.store(false, Ordering::SeqCst);
    }
}

/// External-mode bootstrap: restore stored tokens per the trust policy,
/// start the callback listener, emit `Ready`.
pub(crate) async fn run_external_bootstrap(inner: Arc<SessionInner>, ec: ExternalConfig) -> bool {
    let mut authenticated = false;

    match ec.adapter.retrieve_tokens().await {
        Ok(Some(tokens)) => match ec.session_mode {
            SessionMode::Offline => {
                // Offline trusts device storage unconditionally.
                install_tokens(&inner, tokens);
                authenticated = true;
            }
            SessionMode::Online => {
                authenticated = validate_or_refresh(&inner, &ec, tokens).await;
            }
        },
        Ok(None) => {}
        Err(err) => warn!(%err, "failed to read platform token storage"),
    }

    if !inner.external.listener_started.swap(true, Ordering::SeqCst) {
        let receiver = ec.adapter.subscribe();
        tokio::spawn(listen_callbacks(Arc::clone(&inner), ec.clone(), receiver));
    }

    inner.bus.emit(&IamEvent::Ready { authenticated });
    authenticated
}

fn install_tokens(inner: &SessionInner, tokens: StoredTokens) {
    let mut state = inner.state.write();
    state.tokens = Some(tokens);
    state.authenticated = true;
}

/// Online-mode restore: accept an unexpired token, refresh an expired one
/// with a refresh token, discard otherwise.
async fn validate_or_refresh(
    inner: &Arc<SessionInner>,
    ec: &ExternalConfig,
    tokens: StoredTokens,
) -> bool {
    match tokens.expiry_seconds() {
        Some(secs) if secs > 0 => {
            install_tokens(inner, tokens);
            true
        }
        Some(_) if tokens.refresh_token.is_some() => {
            // Installed first so the refresh path can read the refresh token;
            // a failed refresh clears it again.
            install_tokens(inner, tokens);
            refresh(Arc::clone(inner), ec.clone(), true).await.is_ok()
        }
        // Expired without a fallback, or an undecodable access token.
        _ => {
            discard_stored(inner, ec).await;
            false
        }
    }
}

async fn discard_stored(inner: &SessionInner, ec: &ExternalConfig) {
    if let Err(err) = ec.adapter.delete_tokens().await {
        warn!(%err, "failed to delete stored tokens");
    }
    let mut state = inner.state.write();
    state.authenticated = false;
    state.tokens = None;
}

/// Refresh the external-mode token set against the token endpoint.
///
/// Skips the request when the token is not within the refresh buffer unless
/// `force`. A failed refresh clears the session (there is no silent
/// recovery path in a native app) and surfaces `AuthRefreshError`.
pub(crate) async fn refresh(
    inner: Arc<SessionInner>,
    ec: ExternalConfig,
    force: bool,
) -> IamResult<bool> {
    let (refresh_token, expiring) = {
        let state = inner.state.read();
        let tokens = state.tokens.as_ref().ok_or(IamError::NotAuthenticated)?;
        (
            tokens.refresh_token.clone(),
            tokens.expiry_seconds().map_or(true, |secs| secs <= REFRESH_BUFFER_SECS),
        )
    };
    if !force && !expiring {
        return Ok(false);
    }
    let refresh_token = refresh_token.ok_or(IamError::NoRefreshToken)?;

    let client_id = inner.config.get().map(|c| c.client_id.clone()).unwrap_or_default();
    let params = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("client_id".to_string(), client_id),
        ("refresh_token".to_string(), refresh_token),
    ];

    match token_request(&inner, &ec, &params).await {
        Ok(body) => {
            let tokens = parse_token_response(&body)?;
            if let Err(err) = ec.adapter.store_tokens(&tokens).await {
                warn!(%err, "failed to persist refreshed tokens");
            }
            install_tokens(&inner, tokens);
            inner.bus.emit(&IamEvent::AuthRefreshSuccess);
            Ok(true)
        }
        Err(err) => {
            error!(%err, "token refresh failed; clearing session");
            discard_stored(&inner, &ec).await;
            inner.bus.emit(&IamEvent::AuthRefreshError);
            Err(err)
        }
    }
}

/// POST to the token endpoint with the adapter's proof-of-possession header,
/// retrying exactly once when the server demands a fresh nonce.
async fn token_request(
    inner: &SessionInner,
    ec: &ExternalConfig,
    params: &[(String, String)],
) -> IamResult<Value> {
    let endpoint = ec.adapter.issuer().token_endpoint;

    let mut headers = HashMap::new();
    if let Some((name, value)) = ec.adapter.proof_header(None) {
        headers.insert(name, value);
    }

    match inner.http.post_form(&endpoint, params, &headers).await {
        Err(IamError::Http { body, .. }) if wants_fresh_nonce(&body) => {
            let nonce = body.get("nonce").and_then(Value::as_str).map(str::to_string);
            debug!("token endpoint demanded a fresh proof nonce; retrying once");
            let mut retry_headers = HashMap::new();
            if let Some((name, value)) = ec.adapter.proof_header(nonce.as_deref()) {
                retry_headers.insert(name, value);
            }
            inner.http.post_form(&endpoint, params, &retry_headers).await
        }
        other => other,
    }
}

fn wants_fresh_nonce(body: &Value) -> bool {
    body.get("error").and_then(Value::as_str) == Some("use_dpop_nonce")
}

fn parse_token_response(body: &Value) -> IamResult<StoredTokens> {
    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            IamError::Serialization("token response missing access_token".to_string())
        })?
        .to_string();
    let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
    Ok(StoredTokens {
        access_token,
        id_token: field("id_token"),
        refresh_token: field("refresh_token"),
        doken: field("doken"),
    })
}

/// Open the system browser on the authorization endpoint, remembering the
/// PKCE verifier for the redirect callback.
pub(crate) async fn login(
    inner: Arc<SessionInner>,
    ec: ExternalConfig,
    return_url: Option<String>,
) -> IamResult<()> {
    let cfg = inner
        .config
        .get()
        .ok_or_else(|| IamError::Config("configuration not loaded".to_string()))?;
    let redirect_uri = cfg.redirect_uri.clone().ok_or_else(|| {
        IamError::Config("external mode login requires a redirect URI".to_string())
    })?;

    let pkce = PkceTriple::generate();
    *inner.external.pending_login.lock() = Some(PendingLogin {
        verifier: pkce.verifier.clone(),
        redirect_uri: redirect_uri.clone(),
        return_url: return_url.clone(),
    });
    inner.external.callback_handled.store(false, Ordering::SeqCst);
    inner.external.callback_processing.store(false, Ordering::SeqCst);

    let state = match &return_url {
        Some(target) => format!("{STATE_URL_PREFIX}{}", urlencoding::encode(target)),
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

    let url = format!("{}?{query}", ec.adapter.issuer().authorization_endpoint);
    ec.adapter.open_url(&url).await
}

/// Consume the platform adapter's callback channel for the life of the
/// process.
async fn listen_callbacks(
    inner: Arc<SessionInner>,
    ec: ExternalConfig,
    mut receiver: mpsc::UnboundedReceiver<ExternalCallback>,
) {
    while let Some(callback) = receiver.recv().await {
        match callback {
            ExternalCallback::Auth { params } => {
                let _ = handle_auth_callback(Arc::clone(&inner), ec.clone(), params).await;
            }
            ExternalCallback::Encryption { request_id, result } => {
                let Some(sender) = inner.external.pending_ops.lock().remove(&request_id) else {
                    debug!(%request_id, "no pending operation for encryption callback");
                    continue;
                };
                let _ = sender.send(result.map_err(IamError::Bridge));
            }
        }
    }
    debug!("platform callback channel closed");
}

/// Process one authorization redirect. Replays of an already-handled
/// callback, and callbacks arriving while the first is mid-exchange, are
/// absorbed without a second code submission.
pub(crate) async fn handle_auth_callback(
    inner: Arc<SessionInner>,
    ec: ExternalConfig,
    params: HashMap<String, String>,
) -> CallbackOutcome {
    if inner.external.callback_handled.load(Ordering::SeqCst)
        || inner.external.callback_processing.swap(true, Ordering::SeqCst)
    {
        return CallbackOutcome {
            handled: true,
            authenticated: inner.state.read().authenticated,
        };
    }

    let outcome = process_auth_callback(&inner, &ec, &params).await;
    if outcome.handled {
        inner.external.callback_handled.store(true, Ordering::SeqCst);
    }
    inner.external.callback_processing.store(false, Ordering::SeqCst);
    outcome
}

async fn process_auth_callback(
    inner: &Arc<SessionInner>,
    ec: &ExternalConfig,
    params: &HashMap<String, String>,
) -> CallbackOutcome {
    if let Some(code) = params.get("error") {
        let message = match params.get("error_description") {
            Some(desc) => format!("authorization failed: {code}: {desc}"),
            None => format!("authorization failed: {code}"),
        };
        inner.state.write().authenticated = false;
        inner.bus.emit(&IamEvent::AuthError { message });
        return CallbackOutcome { handled: true, authenticated: false };
    }

    let Some(code) = params.get("code") else {
        return CallbackOutcome::default();
    };

    let Some(login) = inner.external.pending_login.lock().take() else {
        warn!("authorization callback without a pending login");
        inner
            .bus
            .emit(&IamEvent::AuthError { message: IamError::MissingVerifier.to_string() });
        return CallbackOutcome { handled: true, authenticated: false };
    };

    let client_id = inner.config.get().map(|c| c.client_id.clone()).unwrap_or_default();
    let form = vec![
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("client_id".to_string(), client_id),
        ("code".to_string(), code.clone()),
        ("redirect_uri".to_string(), login.redirect_uri),
        ("code_verifier".to_string(), login.verifier),
    ];

    match token_request(inner, ec, &form).await {
        Ok(body) => match parse_token_response(&body) {
            Ok(tokens) => {
                if let Err(err) = ec.adapter.store_tokens(&tokens).await {
                    warn!(%err, "failed to persist exchanged tokens");
                }
                {
                    let mut state = inner.state.write();
                    state.tokens = Some(tokens);
                    state.authenticated = true;
                    state.return_url = params
                        .get("state")
                        .and_then(|s| decode_state_return_url(s))
                        .or(login.return_url);
                }
                inner.bus.emit(&IamEvent::AuthSuccess);
                CallbackOutcome { handled: true, authenticated: true }
            }
            Err(err) => {
                error!(%err, "malformed token response");
                inner.bus.emit(&IamEvent::AuthError { message: err.to_string() });
                CallbackOutcome { handled: true, authenticated: false }
            }
        },
        Err(err) => {
            error!(%err, "external token exchange failed");
            inner.state.write().authenticated = false;
            inner.bus.emit(&IamEvent::AuthError { message: err.to_string() });
            CallbackOutcome { handled: true, authenticated: false }
        }
    }
}

/// Run one enclave operation through the system browser and await its
/// callback.
///
/// Dispatch is fire-and-forget from the host's perspective: the operation is
/// correlated by a generated request id, and the single response settles a
/// oneshot. A callback that never arrives times out after
/// [`PENDING_TIMEOUT`] and the pending entry is dropped.
pub(crate) async fn bridge_operation(
    inner: Arc<SessionInner>,
    ec: ExternalConfig,
    operation: &'static str,
    payload: String,
) -> IamResult<Vec<String>> {
    if !ec.adapter.supports_encryption_callbacks() {
        return Err(IamError::Bridge(
            "platform adapter does not deliver encryption callbacks".to_string(),
        ));
    }
    let page = ec
        .enclave_page_url
        .clone()
        .ok_or_else(|| IamError::Config("no enclave page URL configured".to_string()))?;

    let doken = inner.state.read().tokens.as_ref().and_then(|t| t.doken.clone());
    let request_id = Uuid::new_v4().to_string();
    let (sender, receiver) = oneshot::channel();
    inner.external.pending_ops.lock().insert(request_id.clone(), sender);

    let mut url = format!(
        "{page}?request_id={request_id}&operation={operation}&payload={}",
        urlencoding::encode(&payload)
    );
    if let Some(doken) = doken {
        url.push_str(&format!("&doken={}", urlencoding::encode(&doken)));
    }

    if let Err(err) = ec.adapter.open_url(&url).await {
        inner.external.pending_ops.lock().remove(&request_id);
        return Err(err);
    }

    match tokio::time::timeout(PENDING_TIMEOUT, receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(IamError::Bridge("encryption callback channel closed".to_string())),
        Err(_) => {
            inner.external.pending_ops.lock().remove(&request_id);
            Err(IamError::Timeout { operation })
        }
    }
}
