//! FivetranRestClient and generic utilities to help with Fivetran
//! API requests

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use groupsync_core::config::HttpClientConfig;

const DEFAULT_BASE_URL: &str = "https://api.fivetran.com/v1";

/// A non-2xx answer from the API, preserving the status and the response
/// body's code/message pair.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fivetran API error {} ({}): {}",
            self.status, self.code, self.message
        )
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub(crate) fn is_conflict(&self) -> bool {
        self.status == StatusCode::CONFLICT || self.code == "UserExists"
    }

    pub(crate) fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// Every Fivetran response wraps its payload the same way.
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// Cursor-paginated list payload.
#[derive(Deserialize)]
pub(crate) struct Paged<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Wrapper struct for http functionality
#[derive(Debug)]
pub(crate) struct FivetranRestClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    http_client: reqwest::Client,
}

impl FivetranRestClient {
    /// Initialize a new FivetranRestClient
    pub(crate) fn new(
        base_url: Option<String>,
        api_key: String,
        api_secret: String,
        http: &HttpClientConfig,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(http.hystrix.timeout_ms))
            .connect_timeout(Duration::from_secs(http.connection_pool.timeout_secs))
            .tcp_keepalive(Duration::from_secs(http.connection_pool.keep_alive_secs))
            .pool_max_idle_per_host(http.connection_pool.max_idle_connections)
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            api_key,
            api_secret,
            http_client,
        })
    }

    fn build_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> reqwest::RequestBuilder {
        let request_url = format!["{}/{}", self.base_url, endpoint];
        let mut req = self
            .http_client
            .request(method, request_url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .header("Accept", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }
        req
    }

    /// Issue a request and unwrap the response envelope. Non-2xx turns
    /// into an [`ApiError`] carrying the body's code and message.
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        debug!(%method, endpoint, "fivetran request");
        let resp = self
            .build_request(method, endpoint, body)
            .send()
            .await
            .context("making request")?;

        let status = resp.status();
        let envelope: Envelope<T> = resp.json().await.context("parsing json response")?;
        if !status.is_success() {
            bail!(ApiError {
                status,
                code: envelope.code.unwrap_or_default(),
                message: envelope.message.unwrap_or_default(),
            });
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("response is missing the data payload"))
    }

    /// Like [`request`](Self::request) for endpoints whose success payload
    /// we do not care about (deletes, membership mutations).
    pub(crate) async fn request_no_content(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        debug!(%method, endpoint, "fivetran request");
        let resp = self
            .build_request(method, endpoint, body)
            .send()
            .await
            .context("making request")?;

        let status = resp.status();
        if !status.is_success() {
            let envelope: Envelope<serde_json::Value> =
                resp.json().await.unwrap_or(Envelope {
                    code: None,
                    message: None,
                    data: None,
                });
            bail!(ApiError {
                status,
                code: envelope.code.unwrap_or_default(),
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Fetch every page of a cursor-paginated listing.
    pub(crate) async fn get_paginated<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let endpoint_with_cursor = match &cursor {
                Some(c) => format!("{endpoint}?cursor={c}"),
                None => endpoint.to_owned(),
            };
            let page: Paged<T> = self
                .request(Method::GET, &endpoint_with_cursor, None)
                .await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }
}
