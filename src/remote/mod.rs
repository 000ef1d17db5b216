//! Clients for the remote embedding and adjudication services.
//!
//! Both speak the OpenAI-compatible JSON API over blocking HTTP, with a
//! per-call timeout and retry on connect errors, timeouts, 429 and 5xx.

pub mod chat;
pub mod embeddings;
pub mod retry;

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PosmapError, Result};
use crate::settings::RemoteSettings;
use retry::{with_retry, Attempt, RetryPolicy};

pub struct JsonClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl JsonClient {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let mut base = settings.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| PosmapError::Settings(format!("Invalid base_url {}: {e}", settings.base_url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()?;

        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty());

        Ok(Self {
            http,
            base_url,
            api_key,
            retry: RetryPolicy::with_retries(settings.max_retries),
        })
    }

    pub fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|e| PosmapError::Settings(format!("Invalid endpoint {path}: {e}")))?;

        with_retry(&self.retry, endpoint.as_str(), || {
            let mut req = self.http.post(endpoint.clone()).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Attempt::Transient(e.into())
                } else {
                    Attempt::Fatal(e.into())
                }
            })?;

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(Attempt::Transient(PosmapError::Remote(format!(
                    "POST {endpoint} returned {status}"
                ))));
            }
            if !status.is_success() {
                let text = resp.text().unwrap_or_default();
                return Err(Attempt::Fatal(PosmapError::Remote(format!(
                    "POST {endpoint} returned {status}: {text}"
                ))));
            }
            resp.json::<T>().map_err(|e| Attempt::Fatal(e.into()))
        })
    }
}
