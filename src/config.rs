//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Relays used when `RELAYS` is empty or unset.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.primal.net",
    "wss://relay.satoshidnc.com",
    "wss://relay.snort.social",
    "wss://relay.damus.io",
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the persistent cache.
    pub cache_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7780`.
    pub bind_http: String,
    /// Relays to read from and publish to.
    pub relays: Vec<String>,
    /// Network assumed for announcements without an `n` tag.
    pub default_network: String,
    /// Default cache entry lifetime.
    pub cache_duration: Duration,
    /// Hex secret key used to sign published events.
    pub secret_key: Option<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub uptime_url: Option<String>,
    pub uptime_api_key: Option<String>,
    /// Spacing between background metadata fetches.
    pub metadata_interval: Duration,
    /// Announcement batch limit.
    pub mint_limit: u32,
    /// Wallet-connect service used to pay zaps.
    pub nwc_wallet_pubkey: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let cache_root = PathBuf::from(env::var("CACHE_ROOT").context("CACHE_ROOT")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let mut relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        if relays.is_empty() {
            relays = DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect();
        }
        let default_network = optional("DEFAULT_NETWORK").unwrap_or_else(|| "mainnet".into());
        let cache_duration = Duration::from_millis(number("CACHE_DURATION", 3_600_000));
        let metadata_interval = Duration::from_millis(number("METADATA_INTERVAL", 5_000));
        let mint_limit = u32::try_from(number("MINT_LIMIT", 100)).unwrap_or(u32::MAX);
        Ok(Self {
            cache_root,
            bind_http,
            relays,
            default_network,
            cache_duration,
            secret_key: optional("SECRET_KEY"),
            tor_socks: optional("TOR_SOCKS"),
            uptime_url: optional("UPTIME_URL"),
            uptime_api_key: optional("UPTIME_API_KEY"),
            metadata_interval,
            mint_limit,
            nwc_wallet_pubkey: optional("NWC_WALLET_PUBKEY"),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Numeric setting; unparsable values fall back to `default`.
fn number(key: &str, default: u64) -> u64 {
    optional(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
