//! End-to-end session manager scenarios across all three modes, with
//! wiremock standing in for the backend exchange and token endpoints and
//! mock collaborators standing in for the OIDC adapter, native host and
//! enclave.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keyfront::browser::{BrowserContext, MemoryBrowser};
use keyfront::enclave::EncryptItem;
use keyfront::testing::{fake_jwt, MockEnclave, MockOidcAdapter, MockPlatformAdapter};
use keyfront::{
    DelegatedConfig, DirectConfig, EventBus, EventKind, ExternalConfig, IamConfig, IamError,
    ModeConfig, SessionManager, SessionMode, StoredTokens, TOKEN_COOKIE,
};

const VERIFIER_KEY: &str = "keyfront.pkce_verifier";

fn delegated_config(exchange_endpoint: &str) -> IamConfig {
    IamConfig {
        realm: "customers".to_string(),
        auth_server_url: "https://idp.example.com".to_string(),
        client_id: "app".to_string(),
        redirect_uri: None,
        mode: ModeConfig::Delegated(DelegatedConfig {
            auth_endpoint: "https://idp.example.com/auth".to_string(),
            exchange_endpoint: exchange_endpoint.to_string(),
            provider: "keycloak".to_string(),
            custom_headers: None,
            fallback_url: Some("https://app.example.com/login".to_string()),
        }),
    }
}

fn external_config(
    adapter: &Arc<MockPlatformAdapter>,
    session_mode: SessionMode,
    enclave_page_url: Option<&str>,
) -> IamConfig {
    IamConfig {
        realm: "customers".to_string(),
        auth_server_url: "https://idp.example.com".to_string(),
        client_id: "app".to_string(),
        redirect_uri: Some("myapp://callback".to_string()),
        mode: ModeConfig::External(ExternalConfig {
            adapter: Arc::clone(adapter) as _,
            session_mode,
            enclave_page_url: enclave_page_url.map(str::to_string),
        }),
    }
}

fn spy(bus: &EventBus, kind: EventKind, label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) {
    let log = Arc::clone(log);
    bus.on(kind, move |_| log.lock().push(label));
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Full delegated callback flow.
///
/// # Test Steps
/// 1. Park the page on a callback URL carrying a code and a `__url_` state.
/// 2. Seed the stored PKCE verifier.
/// 3. Bootstrap and assert the exchange body, the recovered return URL, the
///    stripped page URL and the event order.
#[tokio::test(flavor = "multi_thread")]
async fn test_delegated_callback_exchanges_code_and_recovers_return_url() {
    let server = MockServer::start().await;
    let expected_access_token =
        json!({
            "code": "abc123",
            "code_verifier": "v1",
            "redirect_uri": "https://app.example.com/cb",
        })
        .to_string();
    Mock::given(method("POST"))
        .and(path("/api/authenticate"))
        .and(body_json(json!({
            "accessToken": expected_access_token,
            "provider": "keycloak",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let browser = Arc::new(MemoryBrowser::with_url(
        "https://app.example.com/cb?code=abc123&state=__url_%2Fdashboard&session_state=s1",
    ));
    browser.storage_set(VERIFIER_KEY, "v1");

    let manager = SessionManager::new(Some(browser.clone() as _));
    let log = Arc::new(Mutex::new(Vec::new()));
    spy(&manager.events(), EventKind::AuthSuccess, "auth_success", &log);
    spy(&manager.events(), EventKind::Ready, "ready", &log);

    let authenticated =
        manager.init_iam(delegated_config(&format!("{}/api/authenticate", server.uri()))).await;

    assert!(authenticated);
    assert!(manager.is_logged_in());
    assert_eq!(manager.return_url().as_deref(), Some("/dashboard"));
    // State mutation and AuthSuccess precede Ready.
    assert_eq!(*log.lock(), vec!["auth_success", "ready"]);
    // OIDC response parameters are gone from the visible URL.
    let after = browser.current_url().unwrap();
    assert_eq!(after.query(), None);
    // The verifier was consumed.
    assert_eq!(browser.storage_get(VERIFIER_KEY), None);
}

/// Two concurrent bootstraps (StrictMode-style double invocation) submit the
/// single-use code exactly once and observe the same result.
#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_bootstrap_shares_one_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/authenticate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/cb?code=once"));
    browser.storage_set(VERIFIER_KEY, "v1");

    let manager = SessionManager::new(Some(browser as _));
    let config = delegated_config(&format!("{}/api/authenticate", server.uri()));

    let (first, second) = tokio::join!(
        manager.init_iam(config.clone()),
        manager.init_iam(config.clone()),
    );
    assert!(first);
    assert!(second);

    // A later call reuses the settled result rather than re-exchanging.
    assert!(manager.init_iam(config).await);
}

/// A callback carrying a code but no stored verifier is a replayed page, not
/// an exchange failure: no network call, fallback navigation, `AuthError`.
#[tokio::test(flavor = "multi_thread")]
async fn test_callback_without_verifier_is_treated_as_replay() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/cb?code=stale"));
    let manager = SessionManager::new(Some(browser.clone() as _));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    manager.events().on(EventKind::AuthError, move |event| {
        if let keyfront::IamEvent::AuthError { message } = event {
            sink.lock().push(message.clone());
        }
    });

    let authenticated =
        manager.init_iam(delegated_config(&format!("{}/api/authenticate", server.uri()))).await;

    assert!(!authenticated);
    assert_eq!(browser.last_navigation().as_deref(), Some("https://app.example.com/login"));
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("verifier"));
}

/// An IdP error callback surfaces `AuthError` without touching the exchange
/// endpoint, and a plain page bootstraps silently to unauthenticated.
#[tokio::test(flavor = "multi_thread")]
async fn test_idp_error_and_plain_page_bootstraps() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;
    let config = delegated_config(&format!("{}/api/authenticate", server.uri()));

    let browser = Arc::new(MemoryBrowser::with_url(
        "https://app.example.com/cb?error=access_denied&error_description=user%20cancelled",
    ));
    let manager = SessionManager::new(Some(browser as _));
    let log = Arc::new(Mutex::new(Vec::new()));
    spy(&manager.events(), EventKind::AuthError, "auth_error", &log);
    assert!(!manager.init_iam(config.clone()).await);
    assert_eq!(*log.lock(), vec!["auth_error"]);

    // A page with no authorization parameters emits no AuthError at all.
    let plain = SessionManager::new(Some(Arc::new(MemoryBrowser::with_url(
        "https://app.example.com/home",
    )) as _));
    let plain_log = Arc::new(Mutex::new(Vec::new()));
    spy(&plain.events(), EventKind::AuthError, "auth_error", &plain_log);
    spy(&plain.events(), EventKind::Ready, "ready", &plain_log);
    assert!(!plain.init_iam(config).await);
    assert_eq!(*plain_log.lock(), vec!["ready"]);
}

/// The first loaded configuration wins for the manager's lifetime; invalid
/// candidates are rejected without state change.
#[tokio::test(flavor = "multi_thread")]
async fn test_config_load_is_idempotent_and_validated() {
    let manager =
        SessionManager::new(Some(Arc::new(MemoryBrowser::with_url("https://a.example.com")) as _));

    // Blank client id fails validation.
    let mut invalid = delegated_config("/api/authenticate");
    invalid.client_id = String::new();
    assert!(manager.load_config(invalid).is_none());
    assert_eq!(manager.mode(), None);

    assert!(manager.load_config(delegated_config("/api/authenticate")).is_some());
    // A second load keeps the first configuration.
    let mut other = delegated_config("/api/other");
    other.realm = "different".to_string();
    let kept = manager.load_config(other).unwrap();
    assert_eq!(kept.realm, "customers");
}

/// Delegated mode has no client-side token surface: token getters error
/// synchronously, refresh resolves `Ok(false)` and expiry reads zero.
#[tokio::test(flavor = "multi_thread")]
async fn test_delegated_mode_guards_token_surface() {
    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/home"));
    let manager = SessionManager::new(Some(browser as _));
    assert!(manager.load_config(delegated_config("/api/authenticate")).is_some());

    match manager.get_token().await {
        Err(IamError::NotAvailableInMode { operation, .. }) => assert_eq!(operation, "getToken"),
        other => panic!("expected mode-mismatch error, got {other:?}"),
    }
    assert!(manager.has_realm_role("user").is_err());
    assert!(manager.get_claim("sub").is_err());
    assert_eq!(manager.get_token_expiry_seconds(), 0);
    assert_eq!(manager.get_id_token(), None);

    // Refresh is server-owned: benign no-op, never an error.
    assert!(!manager.refresh_token().await.unwrap());
    assert!(!manager.force_refresh_token().await.unwrap());
}

/// Direct-mode bootstrap reports the adapter's state and writes the
/// middleware cookie; roles and claims come from the adapter's token.
#[tokio::test(flavor = "multi_thread")]
async fn test_direct_bootstrap_writes_middleware_cookie() {
    let adapter = Arc::new(MockOidcAdapter::new());
    let access = fake_jwt(&json!({
        "exp": chrono::Utc::now().timestamp() + 300,
        "sub": "user-1",
        "realm_access": {"roles": ["user"]},
        "resource_access": {"app": {"roles": ["editor"]}},
    }));
    adapter.set_init_response(Ok(true));
    adapter.set_token(Some(&access));

    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/home"));
    let manager = SessionManager::new(Some(browser.clone() as _));
    let config = IamConfig {
        realm: "customers".to_string(),
        auth_server_url: "https://idp.example.com".to_string(),
        client_id: "app".to_string(),
        redirect_uri: None,
        mode: ModeConfig::Direct(DirectConfig {
            adapter: Arc::clone(&adapter) as _,
            enclave: None,
        }),
    };

    assert!(manager.init_iam(config.clone()).await);
    assert!(manager.is_logged_in());
    assert_eq!(browser.cookie(TOKEN_COOKIE).as_deref(), Some(access.as_str()));
    assert_eq!(adapter.init_calls(), 1);

    assert_eq!(manager.get_token().await.unwrap().as_deref(), Some(access.as_str()));
    assert!(manager.get_token_expiry_seconds() > 290);
    assert!(manager.has_realm_role("user").unwrap());
    assert!(manager.has_client_role("editor", None).unwrap());
    assert!(!manager.has_client_role("editor", Some("other")).unwrap());
    assert_eq!(manager.get_claim("sub").unwrap(), Some(json!("user-1")));

    // A second bootstrap short-circuits on the already-initialized adapter.
    assert!(manager.init_iam(config).await);
    assert_eq!(adapter.init_calls(), 1);
}

/// Direct-mode force refresh passes a negative min-validity, rewrites the
/// cookie with the rotated token and emits `AuthRefreshSuccess`.
#[tokio::test(flavor = "multi_thread")]
async fn test_direct_force_refresh_rewrites_cookie() {
    let adapter = Arc::new(MockOidcAdapter::new());
    adapter.set_init_response(Ok(true));
    adapter.set_token(Some(&fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() + 60}))));

    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/home"));
    let manager = SessionManager::new(Some(browser.clone() as _));
    manager
        .init_iam(IamConfig {
            realm: "customers".to_string(),
            auth_server_url: "https://idp.example.com".to_string(),
            client_id: "app".to_string(),
            redirect_uri: None,
            mode: ModeConfig::Direct(DirectConfig {
                adapter: Arc::clone(&adapter) as _,
                enclave: None,
            }),
        })
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    spy(&manager.events(), EventKind::AuthRefreshSuccess, "refresh_success", &log);

    let rotated = fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() + 600}));
    adapter.set_update_response(Ok(true));
    adapter.set_token(Some(&rotated));

    assert!(manager.force_refresh_token().await.unwrap());
    assert_eq!(adapter.last_min_validity(), Some(-1));
    assert_eq!(browser.cookie(TOKEN_COOKIE).as_deref(), Some(rotated.as_str()));
    assert_eq!(*log.lock(), vec!["refresh_success"]);

    // Within-buffer refresh forwards the 30-second threshold.
    adapter.set_update_response(Ok(false));
    assert!(!manager.refresh_token().await.unwrap());
    assert_eq!(adapter.last_min_validity(), Some(30));
}

/// Offline external mode trusts stored tokens without any validation or
/// network traffic, even when the access token is long expired.
#[tokio::test(flavor = "multi_thread")]
async fn test_external_offline_trusts_stored_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let adapter = Arc::new(MockPlatformAdapter::new(
        &format!("{}/auth", server.uri()),
        &format!("{}/token", server.uri()),
    ));
    adapter.set_stored_tokens(Some(StoredTokens {
        access_token: fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() - 3600})),
        id_token: None,
        refresh_token: None,
        doken: None,
    }));

    let manager = SessionManager::new(Some(Arc::new(MemoryBrowser::new()) as _));
    let authenticated =
        manager.init_iam(external_config(&adapter, SessionMode::Offline, None)).await;

    assert!(authenticated);
    assert!(manager.is_logged_in());
    assert!(manager.get_token().await.unwrap().is_some());
}

/// Online external mode discards an expired token set that carries no
/// refresh token, deleting it from device storage.
#[tokio::test(flavor = "multi_thread")]
async fn test_external_online_discards_expired_tokens_without_refresh() {
    let server = MockServer::start().await;
    let adapter = Arc::new(MockPlatformAdapter::new(
        &format!("{}/auth", server.uri()),
        &format!("{}/token", server.uri()),
    ));
    adapter.set_stored_tokens(Some(StoredTokens {
        access_token: fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() - 3600})),
        id_token: None,
        refresh_token: None,
        doken: None,
    }));

    let manager = SessionManager::new(Some(Arc::new(MemoryBrowser::new()) as _));
    let authenticated =
        manager.init_iam(external_config(&adapter, SessionMode::Online, None)).await;

    assert!(!authenticated);
    assert!(!manager.is_logged_in());
    assert!(adapter.stored_tokens().is_none());
}

/// Full external login: the system browser is opened with PKCE parameters,
/// the redirect callback is exchanged against the token endpoint, tokens are
/// persisted, and a replayed callback never re-submits the code.
#[tokio::test(flavor = "multi_thread")]
async fn test_external_login_and_callback_establish_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=xyz"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() + 300})),
            "refresh_token": "rt-1",
            "id_token": fake_jwt(&json!({"sub": "user-1"})),
            "doken": "dk-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = Arc::new(MockPlatformAdapter::new(
        &format!("{}/auth", server.uri()),
        &format!("{}/token", server.uri()),
    ));
    let manager = SessionManager::new(Some(Arc::new(MemoryBrowser::new()) as _));
    assert!(!manager.init_iam(external_config(&adapter, SessionMode::Online, None)).await);

    manager.login(Some("/home")).await.unwrap();
    let opened = adapter.opened_urls();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].starts_with(&format!("{}/auth?", server.uri())));
    assert!(opened[0].contains("response_type=code"));
    assert!(opened[0].contains("code_challenge="));
    assert!(opened[0].contains("code_challenge_method=S256"));

    let params = std::collections::HashMap::from([
        ("code".to_string(), "xyz".to_string()),
        ("state".to_string(), "__url_%2Fhome".to_string()),
    ]);
    adapter.deliver(keyfront::platform::ExternalCallback::Auth { params: params.clone() });

    let probe = manager.clone();
    assert!(wait_until(move || probe.is_logged_in()).await, "session never established");
    assert_eq!(manager.return_url().as_deref(), Some("/home"));
    assert!(adapter.stored_tokens().is_some());
    assert_eq!(manager.get_id_claim("sub").unwrap(), Some(json!("user-1")));

    // A replayed redirect is absorbed without a second exchange.
    adapter.deliver(keyfront::platform::ExternalCallback::Auth { params });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.is_logged_in());
}

/// A token endpoint demanding a fresh proof-of-possession nonce is retried
/// exactly once with the server-provided nonce.
#[tokio::test(flavor = "multi_thread")]
async fn test_proof_nonce_demand_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("dpop", "initial"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "use_dpop_nonce", "nonce": "n1"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("dpop", "n1"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() + 900})),
            "refresh_token": "rt-2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = Arc::new(MockPlatformAdapter::new(
        &format!("{}/auth", server.uri()),
        &format!("{}/token", server.uri()),
    ));
    adapter.set_proof_header(Some("dpop"));
    adapter.set_stored_tokens(Some(StoredTokens {
        access_token: fake_jwt(&json!({"exp": chrono::Utc::now().timestamp() - 60})),
        id_token: None,
        refresh_token: Some("rt-1".to_string()),
        doken: None,
    }));

    let manager = SessionManager::new(Some(Arc::new(MemoryBrowser::new()) as _));
    // Offline trust installs the stale token set without touching the
    // network; the explicit refresh below drives the nonce handshake.
    assert!(manager.init_iam(external_config(&adapter, SessionMode::Offline, None)).await);

    assert!(manager.force_refresh_token().await.unwrap());
    assert!(manager.get_token_expiry_seconds() > 800);
    assert_eq!(
        adapter.stored_tokens().and_then(|t| t.refresh_token).as_deref(),
        Some("rt-2")
    );
}

/// One unauthorized tag rejects the whole encrypt batch before the enclave
/// is reached, naming the tag.
#[tokio::test(flavor = "multi_thread")]
async fn test_encrypt_rejects_whole_batch_on_missing_tag_role() {
    let adapter = Arc::new(MockOidcAdapter::new());
    adapter.set_token(Some(&fake_jwt(&json!({
        "exp": chrono::Utc::now().timestamp() + 300,
        "realm_access": {"roles": ["_tide_email.selfencrypt"]},
    }))));
    adapter.set_authenticated(true);
    let enclave = Arc::new(MockEnclave::new());

    let manager = SessionManager::new(Some(Arc::new(MemoryBrowser::new()) as _));
    manager
        .load_config(IamConfig {
            realm: "customers".to_string(),
            auth_server_url: "https://idp.example.com".to_string(),
            client_id: "app".to_string(),
            redirect_uri: None,
            mode: ModeConfig::Direct(DirectConfig {
                adapter: Arc::clone(&adapter) as _,
                enclave: Some(Arc::clone(&enclave) as _),
            }),
        })
        .unwrap();

    let items = vec![
        EncryptItem { data: "a@example.com".to_string(), tags: vec!["email".to_string()] },
        EncryptItem { data: "1990-01-01".to_string(), tags: vec!["dob".to_string()] },
    ];
    match manager.encrypt(&items).await {
        Err(IamError::TagUnauthorized { tag }) => assert_eq!(tag, "dob"),
        other => panic!("expected tag rejection, got {other:?}"),
    }
    assert!(!enclave.was_called());

    // With every tag authorized the batch reaches the enclave.
    enclave.set_encrypt_response(Ok(vec!["ct-1".to_string()]));
    let authorized =
        vec![EncryptItem { data: "a@example.com".to_string(), tags: vec!["email".to_string()] }];
    assert_eq!(manager.encrypt(&authorized).await.unwrap(), vec!["ct-1".to_string()]);
    assert!(enclave.was_called());
}

/// Logout clears state, cookie and transient storage, emits `Logout`, and a
/// later bootstrap starts fresh instead of reusing the settled one.
#[tokio::test(flavor = "multi_thread")]
async fn test_logout_clears_session_and_resets_bootstrap() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/cb?code=abc"));
    browser.storage_set(VERIFIER_KEY, "v1");

    let manager = SessionManager::new(Some(browser.clone() as _));
    let config = delegated_config(&format!("{}/api/authenticate", server.uri()));
    assert!(manager.init_iam(config.clone()).await);

    let log = Arc::new(Mutex::new(Vec::new()));
    spy(&manager.events(), EventKind::Logout, "logout", &log);

    manager.logout().await.unwrap();
    assert!(!manager.is_logged_in());
    assert_eq!(manager.return_url(), None);
    assert_eq!(*log.lock(), vec!["logout"]);

    // The page no longer carries a code, so the fresh bootstrap resolves
    // unauthenticated rather than replaying the settled result.
    assert!(!manager.init_iam(config).await);
}

/// Hosts driving their own exchange read the callback pieces without the
/// built-in flow consuming them, unless consumption is requested.
#[tokio::test(flavor = "multi_thread")]
async fn test_hybrid_callback_data_peek_and_consume() {
    let browser = Arc::new(MemoryBrowser::with_url(
        "https://app.example.com/cb?code=abc&state=__url_%2Fsettings",
    ));
    browser.storage_set(VERIFIER_KEY, "v1");

    let manager = SessionManager::new(Some(browser.clone() as _));
    manager.load_config(delegated_config("/api/authenticate")).unwrap();

    let peeked = manager.get_hybrid_callback_data(keyfront::CallbackDataOptions::default());
    assert!(peeked.is_callback);
    assert_eq!(peeked.code.as_deref(), Some("abc"));
    assert_eq!(peeked.verifier.as_deref(), Some("v1"));
    assert_eq!(peeked.return_url.as_deref(), Some("/settings"));
    assert_eq!(peeked.provider.as_deref(), Some("keycloak"));
    // Peeking left the verifier in place.
    assert_eq!(browser.storage_get(VERIFIER_KEY).as_deref(), Some("v1"));

    let consumed =
        manager.get_hybrid_callback_data(keyfront::CallbackDataOptions { consume: true });
    assert_eq!(consumed.verifier.as_deref(), Some("v1"));
    assert_eq!(browser.storage_get(VERIFIER_KEY), None);
}

/// Delegated login stores the verifier, embeds the return URL in the state
/// parameter and navigates to the authorization endpoint.
#[tokio::test(flavor = "multi_thread")]
async fn test_delegated_login_builds_authorization_request() {
    let browser = Arc::new(MemoryBrowser::with_url("https://app.example.com/home"));
    let manager = SessionManager::new(Some(browser.clone() as _));
    manager.load_config(delegated_config("/api/authenticate")).unwrap();

    manager.login(Some("/dashboard")).await.unwrap();

    let target = browser.last_navigation().unwrap();
    assert!(target.starts_with("https://idp.example.com/auth?"));
    assert!(target.contains("response_type=code"));
    assert!(target.contains("client_id=app"));
    assert!(target.contains("code_challenge_method=S256"));
    assert!(target.contains("state=__url_%252Fdashboard"));
    assert!(browser.storage_get(VERIFIER_KEY).is_some());
    assert_eq!(browser.storage_get("keyfront.return_url").as_deref(), Some("/dashboard"));
}
