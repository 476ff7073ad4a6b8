//! Typed lifecycle event bus.
//!
//! Session lifecycle notifications are a tagged union ([`IamEvent`]) rather
//! than stringly-typed names with variadic arguments. Handlers subscribe per
//! event kind and are invoked synchronously in registration order; a
//! panicking handler is caught and logged so one faulty listener never
//! breaks delivery to the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// A session lifecycle event with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamEvent {
    /// Bootstrap finished; carries the resulting authentication state.
    Ready {
        /// Whether a session is established.
        authenticated: bool,
    },
    /// Bootstrap could not run or failed before mode dispatch.
    InitError {
        /// Human-readable failure description.
        message: String,
    },
    /// An authorization flow completed successfully.
    AuthSuccess,
    /// An authorization flow failed.
    AuthError {
        /// Human-readable failure description.
        message: String,
    },
    /// A token refresh completed successfully.
    AuthRefreshSuccess,
    /// A token refresh failed.
    AuthRefreshError,
    /// The session was terminated.
    Logout,
    /// The access token expired. Never emitted in delegated mode, where
    /// refresh is not client-visible.
    TokenExpired,
}

impl IamEvent {
    /// Discriminant of this event, for subscription filtering.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::InitError { .. } => EventKind::InitError,
            Self::AuthSuccess => EventKind::AuthSuccess,
            Self::AuthError { .. } => EventKind::AuthError,
            Self::AuthRefreshSuccess => EventKind::AuthRefreshSuccess,
            Self::AuthRefreshError => EventKind::AuthRefreshError,
            Self::Logout => EventKind::Logout,
            Self::TokenExpired => EventKind::TokenExpired,
        }
    }
}

/// Event discriminant used when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`IamEvent::Ready`].
    Ready,
    /// See [`IamEvent::InitError`].
    InitError,
    /// See [`IamEvent::AuthSuccess`].
    AuthSuccess,
    /// See [`IamEvent::AuthError`].
    AuthError,
    /// See [`IamEvent::AuthRefreshSuccess`].
    AuthRefreshSuccess,
    /// See [`IamEvent::AuthRefreshError`].
    AuthRefreshError,
    /// See [`IamEvent::Logout`].
    Logout,
    /// See [`IamEvent::TokenExpired`].
    TokenExpired,
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
///
/// Closures have no stable identity in Rust, so removal is by handle rather
/// than by handler reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&IamEvent) + Send + Sync>;

struct BusInner {
    next_id: u64,
    // Registration order is delivery order.
    handlers: Vec<(SubscriptionId, EventKind, Handler)>,
}

/// Synchronous pub/sub bus for [`IamEvent`]s. Cheap to clone; clones share
/// the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("handlers", &self.inner.lock().handlers.len()).finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(BusInner { next_id: 0, handlers: Vec::new() })) }
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&IamEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.handlers.push((id, kind, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns `false` when the
    /// subscription was already removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(sub, _, _)| *sub != id);
        inner.handlers.len() != before
    }

    /// Synchronously deliver an event to every matching handler, in
    /// registration order. A panicking handler is caught and logged; it
    /// never interrupts delivery to its siblings or unwinds into the
    /// emitter.
    pub fn emit(&self, event: &IamEvent) {
        let kind = event.kind();
        // Snapshot under the lock so a handler may (un)subscribe reentrantly.
        let handlers: Vec<Handler> = self
            .inner
            .lock()
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?kind, "event handler panicked; continuing delivery");
            }
        }
    }
}
