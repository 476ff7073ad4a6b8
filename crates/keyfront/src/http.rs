//! Thin JSON HTTP client with uniform error surfacing.
//!
//! Every non-2xx response becomes an [`IamError::Http`] carrying the numeric
//! status and either the parsed JSON error body or the raw text, so callers
//! can distinguish "transport succeeded, semantic failure" from total
//! failure by inspecting the carried status.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::{IamError, IamResult};

/// Request timeout applied to the shared client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-speaking HTTP client shared by the session manager.
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    client: Client,
}

impl Default for HttpJsonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpJsonClient {
    /// Create a client with the standard request timeout.
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// POST a JSON body with optional extra headers and parse the response.
    ///
    /// # Errors
    /// [`IamError::Http`] for non-2xx responses (status plus parsed or raw
    /// body), [`IamError::Transport`] when no response was produced.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &HashMap<String, String>,
    ) -> IamResult<Value> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// POST form-encoded parameters (OAuth token endpoint convention) with
    /// optional extra headers and parse the response.
    ///
    /// # Errors
    /// Same contract as [`Self::post_json`].
    pub async fn post_form(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &HashMap<String, String>,
    ) -> IamResult<Value> {
        let mut request = self.client.post(url).form(params);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// GET a JSON document.
    ///
    /// # Errors
    /// Same contract as [`Self::post_json`].
    pub async fn get_json(&self, url: &str) -> IamResult<Value> {
        let response = self.client.get(url).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response(response: reqwest::Response) -> IamResult<Value> {
        let status = response.status().as_u16();
        let text = response.text().await?;

        if (200..300).contains(&status) {
            if text.trim().is_empty() {
                // 2xx with an empty body is a valid outcome, not a parse error.
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|err| {
                IamError::Transport(format!("invalid JSON in {status} response: {err}"))
            });
        }

        let body =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));
        Err(IamError::Http { status, body })
    }
}
