//! Browser runtime abstraction.
//!
//! The session manager never touches a global `window`; it talks to a
//! [`BrowserContext`] injected at construction. A manager constructed
//! without one models a server-side-rendering host, where bootstrap is a
//! documented no-op. [`MemoryBrowser`] backs tests and native hosts.
//!
//! Transient storage entries (PKCE verifier, return URL, redirect URI) are
//! scoped to a single authorization attempt: write once, read once, delete.

use std::collections::HashMap;

use parking_lot::Mutex;
use url::Url;

/// Capabilities of a browser-like runtime.
pub trait BrowserContext: Send + Sync {
    /// The page's current URL, when one exists.
    fn current_url(&self) -> Option<Url>;

    /// Replace the visible URL without a navigation (history replace).
    fn replace_url(&self, url: &Url);

    /// Navigate the current context to `url`.
    fn navigate(&self, url: &str);

    /// Write a cookie readable by server-side middleware.
    fn set_cookie(&self, name: &str, value: &str, max_age_secs: i64);

    /// Expire a cookie immediately.
    fn clear_cookie(&self, name: &str);

    /// Read a transient-storage value without consuming it.
    fn storage_get(&self, key: &str) -> Option<String>;

    /// Write a transient-storage value.
    fn storage_set(&self, key: &str, value: &str);

    /// Consume a transient-storage value: retrieve and delete atomically.
    fn storage_remove(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default)]
struct MemoryBrowserState {
    url: Option<Url>,
    cookies: HashMap<String, String>,
    storage: HashMap<String, String>,
    navigations: Vec<String>,
}

/// In-memory [`BrowserContext`] for tests and non-browser hosts.
#[derive(Debug, Default)]
pub struct MemoryBrowser {
    state: Mutex<MemoryBrowserState>,
}

impl MemoryBrowser {
    /// Create a context with no current URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context whose page sits at `url`.
    ///
    /// # Panics
    /// Panics when `url` is not parseable; intended for test setup.
    #[must_use]
    pub fn with_url(url: &str) -> Self {
        let browser = Self::new();
        #[allow(clippy::unwrap_used)] // test/setup convenience
        browser.set_current_url(Url::parse(url).unwrap());
        browser
    }

    /// Point the context at a new page URL.
    pub fn set_current_url(&self, url: Url) {
        self.state.lock().url = Some(url);
    }

    /// Read back a cookie value.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.state.lock().cookies.get(name).cloned()
    }

    /// The most recent `navigate` target, if any.
    #[must_use]
    pub fn last_navigation(&self) -> Option<String> {
        self.state.lock().navigations.last().cloned()
    }
}

impl BrowserContext for MemoryBrowser {
    fn current_url(&self) -> Option<Url> {
        self.state.lock().url.clone()
    }

    fn replace_url(&self, url: &Url) {
        self.state.lock().url = Some(url.clone());
    }

    fn navigate(&self, url: &str) {
        let mut state = self.state.lock();
        state.navigations.push(url.to_string());
        if let Ok(parsed) = Url::parse(url) {
            state.url = Some(parsed);
        }
    }

    fn set_cookie(&self, name: &str, value: &str, _max_age_secs: i64) {
        self.state.lock().cookies.insert(name.to_string(), value.to_string());
    }

    fn clear_cookie(&self, name: &str) {
        self.state.lock().cookies.remove(name);
    }

    fn storage_get(&self, key: &str) -> Option<String> {
        self.state.lock().storage.get(key).cloned()
    }

    fn storage_set(&self, key: &str, value: &str) {
        self.state.lock().storage.insert(key.to_string(), value.to_string());
    }

    fn storage_remove(&self, key: &str) -> Option<String> {
        self.state.lock().storage.remove(key)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the in-memory browser context.
    use super::*;

    #[test]
    fn test_storage_remove_consumes_exactly_once() {
        let browser = MemoryBrowser::new();
        browser.storage_set("verifier", "v1");

        assert_eq!(browser.storage_get("verifier").as_deref(), Some("v1"));
        assert_eq!(browser.storage_remove("verifier").as_deref(), Some("v1"));
        assert_eq!(browser.storage_remove("verifier"), None);
        assert_eq!(browser.storage_get("verifier"), None);
    }

    #[test]
    fn test_cookie_lifecycle() {
        let browser = MemoryBrowser::new();
        browser.set_cookie("kcToken", "abc", 300);
        assert_eq!(browser.cookie("kcToken").as_deref(), Some("abc"));
        browser.clear_cookie("kcToken");
        assert_eq!(browser.cookie("kcToken"), None);
    }

    #[test]
    fn test_replace_url_keeps_no_navigation_record() {
        let browser = MemoryBrowser::with_url("https://app.example.com/cb?code=x");
        let stripped = Url::parse("https://app.example.com/cb").unwrap();
        browser.replace_url(&stripped);

        assert_eq!(browser.current_url().unwrap(), stripped);
        assert_eq!(browser.last_navigation(), None);
    }
}
