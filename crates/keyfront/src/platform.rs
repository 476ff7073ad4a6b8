//! External/native mode platform adapter interface.
//!
//! A native host supplies this capability object: it opens URLs in the
//! system browser (never an embedded webview), persists token sets in
//! device storage, and delivers asynchronous callbacks (auth redirects and
//! encryption-bridge results) over a channel the session manager subscribes
//! to at bootstrap.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IamResult;
use crate::token::StoredTokens;

/// Identity-provider endpoints supplied by the platform adapter.
#[derive(Debug, Clone)]
pub struct IssuerCoordinates {
    /// Authorization endpoint the external browser is opened against.
    pub authorization_endpoint: String,
    /// Token endpoint the native app exchanges codes against directly.
    pub token_endpoint: String,
}

/// An asynchronous notification delivered by the platform adapter.
#[derive(Debug)]
pub enum ExternalCallback {
    /// The external browser redirected back with authorization parameters.
    Auth {
        /// Query parameters of the redirect (code, state, error, ...).
        params: HashMap<String, String>,
    },
    /// The external browser completed a bridged encryption operation.
    Encryption {
        /// Correlation id generated when the operation was dispatched.
        request_id: String,
        /// Positional outputs, or a provider error description.
        result: Result<Vec<String>, String>,
    },
}

/// Native-host capabilities consumed in external mode.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Identity-provider endpoints for this installation.
    fn issuer(&self) -> IssuerCoordinates;

    /// Open `url` in the system browser.
    ///
    /// # Errors
    /// Any failure launching the browser.
    async fn open_url(&self, url: &str) -> IamResult<()>;

    /// Persist a token set in device storage.
    ///
    /// # Errors
    /// Any storage failure.
    async fn store_tokens(&self, tokens: &StoredTokens) -> IamResult<()>;

    /// Load the persisted token set, when one exists.
    ///
    /// # Errors
    /// Any storage failure. A missing token set is `Ok(None)`, not an error.
    async fn retrieve_tokens(&self) -> IamResult<Option<StoredTokens>>;

    /// Delete the persisted token set.
    ///
    /// # Errors
    /// Any storage failure.
    async fn delete_tokens(&self) -> IamResult<()>;

    /// Subscribe to the adapter's callback channel. Called once, at
    /// bootstrap; the session manager consumes the receiver for the life of
    /// the process.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExternalCallback>;

    /// Whether this host can deliver [`ExternalCallback::Encryption`]
    /// notifications (required for the encryption bridge).
    fn supports_encryption_callbacks(&self) -> bool {
        false
    }

    /// Optional proof-of-possession header for token-endpoint requests.
    /// Called a second time with the server-provided nonce when the server
    /// demands a fresh one.
    fn proof_header(&self, nonce: Option<&str>) -> Option<(String, String)> {
        let _ = nonce;
        None
    }
}
