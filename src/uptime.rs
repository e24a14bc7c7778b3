//! Uptime monitor lookups.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{keys, Cache, UPTIME_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UptimeWindow {
    #[serde(rename = "last24hours")]
    pub last_24_hours: f64,
    #[serde(rename = "last30days")]
    pub last_30_days: f64,
}

/// Availability as reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UptimeReport {
    /// 1 when up.
    pub status: u8,
    pub uptime: UptimeWindow,
    /// Round trip in milliseconds.
    pub ping: u64,
}

impl Default for UptimeReport {
    /// Reported when no monitor is configured or it cannot be reached.
    fn default() -> Self {
        Self {
            status: 1,
            uptime: UptimeWindow {
                last_24_hours: 100.0,
                last_30_days: 100.0,
            },
            ping: 0,
        }
    }
}

impl UptimeReport {
    /// Read a monitor response, taking defaults for missing fields.
    pub fn from_value(val: &Value) -> Self {
        let d = Self::default();
        let f = |v: Option<&Value>, dflt: f64| v.and_then(Value::as_f64).unwrap_or(dflt);
        Self {
            status: val
                .get("status")
                .and_then(Value::as_u64)
                .map_or(d.status, |s| s.min(u64::from(u8::MAX)) as u8),
            uptime: UptimeWindow {
                last_24_hours: f(val.pointer("/uptime/last24hours"), d.uptime.last_24_hours),
                last_30_days: f(val.pointer("/uptime/last30days"), d.uptime.last_30_days),
            },
            ping: val.get("ping").and_then(Value::as_u64).unwrap_or(d.ping),
        }
    }
}

#[derive(Debug, Clone)]
struct Monitor {
    url: String,
    api_key: String,
}

#[derive(Debug, Clone)]
pub struct UptimeClient {
    client: reqwest::Client,
    monitor: Option<Monitor>,
    cache: Cache,
}

impl UptimeClient {
    /// Without both a URL and an API key every lookup returns the default.
    pub fn new(url: Option<String>, api_key: Option<String>, cache: Cache) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        let monitor = match (url, api_key) {
            (Some(url), Some(api_key)) if !url.is_empty() && !api_key.is_empty() => {
                Some(Monitor { url, api_key })
            }
            _ => None,
        };
        Ok(Self {
            client,
            monitor,
            cache,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.monitor.is_some()
    }

    pub async fn uptime(&self, mint_url: &str) -> UptimeReport {
        let Some(monitor) = &self.monitor else {
            return UptimeReport::default();
        };
        let key = keys::uptime(mint_url);
        if let Some(report) = self.cache.get(&key, Some(UPTIME_TTL)) {
            return report;
        }
        match self.query(monitor, mint_url).await {
            Ok(report) => {
                debug!(mint = %mint_url, status = report.status, "uptime fetched");
                if let Err(e) = self.cache.set(&key, &report) {
                    warn!("caching uptime failed: {e}");
                }
                report
            }
            Err(e) => {
                warn!(mint = %mint_url, "uptime lookup failed: {e:#}");
                UptimeReport::default()
            }
        }
    }

    async fn query(&self, monitor: &Monitor, mint_url: &str) -> Result<UptimeReport> {
        let val: Value = self
            .client
            .get(&monitor.url)
            .query(&[("url", mint_url)])
            .bearer_auth(&monitor.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(UptimeReport::from_value(&val))
    }
}
