//! GitlabRestClient and generic utilities to help with GitLab API
//! requests

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use groupsync_core::config::HttpClientConfig;

/// A non-2xx answer from the API.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gitlab API error {}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub(crate) fn is_conflict(&self) -> bool {
        self.status == StatusCode::CONFLICT
    }

    pub(crate) fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// Wrapper struct for http functionality
#[derive(Debug)]
pub(crate) struct GitlabRestClient {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl GitlabRestClient {
    /// Initialize a new GitlabRestClient against `<url>/api/v4`.
    pub(crate) fn new(url: &str, token: String, http: &HttpClientConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(http.hystrix.timeout_ms))
            .connect_timeout(Duration::from_secs(http.connection_pool.timeout_secs))
            .tcp_keepalive(Duration::from_secs(http.connection_pool.keep_alive_secs))
            .pool_max_idle_per_host(http.connection_pool.max_idle_connections)
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: format!("{}/api/v4", url.trim_end_matches('/')),
            token,
            http_client,
        })
    }

    fn build_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> reqwest::RequestBuilder {
        let request_url = format!("{}/{}", self.base_url, endpoint);
        let mut req = self
            .http_client
            .request(method, request_url)
            .header("PRIVATE-TOKEN", &self.token)
            .header("Accept", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }
        req
    }

    /// Issue a request and deserialize the response body.
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        debug!(%method, endpoint, "gitlab request");
        let resp = self
            .build_request(method, endpoint, body)
            .send()
            .await
            .context("making request")?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            bail!(ApiError { status, message });
        }
        resp.json().await.context("parsing json response")
    }

    /// Like [`request`](Self::request) when the response body is
    /// irrelevant.
    pub(crate) async fn request_no_content(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        debug!(%method, endpoint, "gitlab request");
        let resp = self
            .build_request(method, endpoint, body)
            .send()
            .await
            .context("making request")?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            bail!(ApiError { status, message });
        }
        Ok(())
    }

    /// Fetch every page of a page-numbered listing, following the
    /// `x-next-page` response header GitLab sets.
    pub(crate) async fn get_paginated<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let sep = if endpoint.contains('?') { '&' } else { '?' };
            let paged_endpoint = format!("{endpoint}{sep}page={page}&per_page=100");
            let resp = self
                .build_request(Method::GET, &paged_endpoint, None)
                .send()
                .await
                .context("making request")?;

            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                bail!(ApiError { status, message });
            }

            let next_page: Option<u32> = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());

            let page_items: Vec<T> = resp.json().await.context("parsing json response")?;
            items.extend(page_items);

            match next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(items)
    }
}
