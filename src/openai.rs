//! Blocking client for OpenAI-compatible HTTP APIs.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error};

use crate::{
    config::Settings,
    error::{Error, Result},
};

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Credentials and transport shared by the embedding and chat backends.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    /// Build a client from settings. A missing API key is `Error::Config`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings.require_api_key()?.to_string();
        Self::new(&settings.api_base_url, api_key)
    }

    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("API key must not be empty".to_string()));
        }
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` as JSON to `<base_url>/<path>` and decode the reply.
    ///
    /// Non-success statuses are turned into an error by `on_failure`, which
    /// receives the status and the provider's error message.
    pub fn post_json<B, R>(
        &self,
        path: &str,
        body: &B,
        on_failure: fn(String) -> Error,
    ) -> Result<R>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%url, "sending API request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            error!(%url, %status, "API error");
            return Err(on_failure(format!("API returned {status}: {detail}")));
        }

        Ok(response.json()?)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
