//! Client-side identity and session SDK for Keycloak-compatible providers.
//!
//! The crate centers on [`SessionManager`], a multi-mode authentication
//! session state machine. A host constructs one manager, loads an
//! [`IamConfig`] selecting exactly one mode, and drives the session through
//! a small set of operations (`init_iam`, `login`, `logout`, token getters,
//! role checks, encrypt/decrypt) while observing lifecycle changes on a
//! typed [`EventBus`].
//!
//! The three modes:
//! - **Direct** — the browser owns tokens through a Keycloak-style
//!   [`OidcAdapter`](adapter::OidcAdapter); the manager wires its lifecycle
//!   into the event bus and maintains a middleware cookie.
//! - **Delegated** — the browser performs the PKCE redirect only; a backend
//!   exchanges the authorization code and keeps tokens server-side. Token
//!   access is deliberately unavailable client-side in this mode.
//! - **External** — a native app opens the system browser through a
//!   [`PlatformAdapter`](platform::PlatformAdapter), exchanges the code
//!   itself and persists tokens in device storage.
//!
//! Token inspection ([`token::decode_payload`]) never verifies signatures;
//! verification belongs to server-side middleware.

pub mod adapter;
pub mod browser;
pub mod config;
pub mod enclave;
pub mod error;
pub mod events;
mod external;
pub mod http;
pub mod pkce;
pub mod platform;
pub mod session;
pub mod single_flight;
pub mod testing;
pub mod token;

pub use config::{
    DelegatedConfig, DirectConfig, ExternalConfig, HeaderSource, IamConfig, Mode, ModeConfig,
    SessionMode,
};
pub use error::{IamError, IamResult};
pub use events::{EventBus, EventKind, IamEvent, SubscriptionId};
pub use session::{
    CallbackDataOptions, CallbackOutcome, HybridCallbackData, SessionManager, TOKEN_COOKIE,
};
pub use token::StoredTokens;
