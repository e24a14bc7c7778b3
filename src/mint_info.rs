//! HTTP client for a mint's `/v1/info` endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    content::{info_url, normalize_info, MintInfo},
    retry::RetryPolicy,
};

/// Hard per-request timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Source of external mint metadata.
#[async_trait]
pub trait MintInfoFetcher: Send + Sync {
    /// Fetch and normalize metadata for the mint at `mint_url`.
    async fn fetch_info(&self, mint_url: &str) -> Result<MintInfo>;
}

/// `reqwest` client with timeout and exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpMintInfo {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpMintInfo {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cashumints/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
            timeout: FETCH_TIMEOUT,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_once(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MintInfoFetcher for HttpMintInfo {
    async fn fetch_info(&self, mint_url: &str) -> Result<MintInfo> {
        let url = info_url(mint_url);
        let target = url.as_str();
        let raw = self
            .retry
            .run(target, move || self.fetch_once(target))
            .await
            .with_context(|| format!("fetching {url}"))?;
        debug!(%url, "mint info fetched");
        Ok(normalize_info(&raw, mint_url))
    }
}

/// Fetch metadata, degrading to [`MintInfo::placeholder`] once retries are spent.
pub async fn fetch_or_placeholder(fetcher: &dyn MintInfoFetcher, mint_url: &str) -> MintInfo {
    match fetcher.fetch_info(mint_url).await {
        Ok(info) => info,
        Err(e) => {
            warn!(mint = %mint_url, "using placeholder info: {e:#}");
            MintInfo::placeholder(mint_url)
        }
    }
}
