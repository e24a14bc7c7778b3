//! Wiring of settings into the running components.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    broadcast::{Outbox, RelayPublisher},
    cache::Cache,
    config::Settings,
    discussion::Discussion,
    index::{IndexConfig, IndexDeps, MintIndex},
    live::{run_live, LiveModels},
    mint_info::{HttpMintInfo, MintInfoFetcher},
    notify::Notifier,
    queue::{spawn_metadata_queue, MetadataQueueHandle, View},
    reactions::Reactions,
    relay::RelayPool,
    signer::{Keys, NoIdentity, Signer},
    source::EventSource,
    uptime::UptimeClient,
    zap::{InvoiceClient, NwcPayer, PaymentMethod, Zapper, DEFAULT_INVOICE_ENDPOINT},
};

/// Window in which live announcements share one reload.
pub const RELOAD_COALESCE: Duration = Duration::from_secs(2);

/// External collaborators, swappable in tests.
pub struct Parts {
    pub source: Arc<dyn EventSource>,
    pub publisher: Arc<dyn RelayPublisher>,
    pub signer: Arc<dyn Signer>,
    pub info: Arc<dyn MintInfoFetcher>,
}

impl Parts {
    /// Relay pool for reads and writes, HTTP mint info, and the configured key.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let pool = Arc::new(RelayPool::new(
            settings.relays.clone(),
            settings.tor_socks.clone(),
        ));
        let signer: Arc<dyn Signer> = match &settings.secret_key {
            Some(secret) => Arc::new(Keys::from_hex(secret).context("SECRET_KEY")?),
            None => Arc::new(NoIdentity),
        };
        Ok(Self {
            source: pool.clone(),
            publisher: pool,
            signer,
            info: Arc::new(HttpMintInfo::new()?),
        })
    }
}

/// Every component of a running instance.
pub struct App {
    pub settings: Settings,
    pub source: Arc<dyn EventSource>,
    pub cache: Cache,
    pub notifier: Notifier,
    pub outbox: Outbox,
    pub index: Arc<MintIndex>,
    pub discussion: Arc<Discussion>,
    pub reactions: Arc<Reactions>,
    pub uptime: UptimeClient,
    pub zapper: Zapper,
}

impl App {
    pub fn build(settings: Settings) -> Result<Self> {
        let parts = Parts::from_settings(&settings)?;
        Self::from_parts(settings, parts)
    }

    pub fn from_parts(settings: Settings, parts: Parts) -> Result<Self> {
        let cache = Cache::new(settings.cache_root.clone(), settings.cache_duration);
        cache.init()?;
        let notifier = Notifier::new();
        let outbox = Outbox::new(parts.signer, parts.publisher);
        let index = Arc::new(MintIndex::new(
            IndexDeps {
                source: parts.source.clone(),
                outbox: outbox.clone(),
                cache: cache.clone(),
                info: parts.info,
                notifier: notifier.clone(),
            },
            IndexConfig {
                default_network: settings.default_network.clone(),
                mint_limit: settings.mint_limit,
            },
        ));
        let discussion = Arc::new(Discussion::new(
            parts.source.clone(),
            outbox.clone(),
            index.profiles().clone(),
            notifier.clone(),
        ));
        let reactions = Arc::new(Reactions::new(
            parts.source.clone(),
            outbox.clone(),
            notifier.clone(),
        ));
        let uptime = UptimeClient::new(
            settings.uptime_url.clone(),
            settings.uptime_api_key.clone(),
            cache.clone(),
        )?;
        let mut methods: Vec<Arc<dyn PaymentMethod>> = vec![];
        if let Some(wallet) = &settings.nwc_wallet_pubkey {
            methods.push(Arc::new(NwcPayer::new(
                parts.source.clone(),
                outbox.clone(),
                wallet.clone(),
            )));
        }
        let zapper = Zapper::new(
            outbox.clone(),
            InvoiceClient::new(DEFAULT_INVOICE_ENDPOINT)?,
            methods,
        );
        Ok(Self {
            settings,
            source: parts.source,
            cache,
            notifier,
            outbox,
            index,
            discussion,
            reactions,
            uptime,
            zapper,
        })
    }

    /// Start the metadata queue, feed it every list change, and follow the
    /// live feed. The queue starts armed for the home view.
    pub fn start_background(&self) -> Background {
        let (queue, queue_task) =
            spawn_metadata_queue(self.index.clone(), self.settings.metadata_interval);
        queue.set_view(&View::Home);

        let feeder = {
            let index = self.index.clone();
            let queue = queue.clone();
            let mut changes = index.changes();
            tokio::spawn(async move {
                queue.enqueue(index.metadata_candidates());
                while changes.changed().await.is_ok() {
                    let ids = index.metadata_candidates();
                    debug!(count = ids.len(), "queueing metadata candidates");
                    queue.enqueue(ids);
                }
            })
        };

        let models = LiveModels {
            index: self.index.clone(),
            discussion: self.discussion.clone(),
            reactions: self.reactions.clone(),
        };
        let live = tokio::spawn(run_live(models, self.source.clone(), RELOAD_COALESCE));
        info!(relays = self.settings.relays.len(), "background tasks started");
        Background {
            queue,
            tasks: vec![queue_task, feeder, live],
        }
    }
}

/// Handles to the background tasks.
pub struct Background {
    pub queue: MetadataQueueHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    /// Cancel the in-flight fetch and stop every task.
    pub fn shutdown(self) {
        self.queue.cancel_in_flight();
        self.queue.shutdown();
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        cache::{keys, METADATA_TTL},
        content::MintInfo,
        index::tests::{announcement, StubInfo},
        source::tests::MemorySource,
    };
    use std::path::Path;
    use tempfile::TempDir;

    pub(crate) fn settings(root: &Path) -> Settings {
        Settings {
            cache_root: root.to_path_buf(),
            bind_http: "127.0.0.1:0".into(),
            relays: vec!["memory://relay".into()],
            default_network: "mainnet".into(),
            cache_duration: Duration::from_secs(3600),
            secret_key: None,
            tor_socks: None,
            uptime_url: None,
            uptime_api_key: None,
            metadata_interval: Duration::from_millis(10),
            mint_limit: 100,
            nwc_wallet_pubkey: None,
        }
    }

    pub(crate) fn memory_app(root: &Path, source: Arc<MemorySource>) -> App {
        App::from_parts(
            settings(root),
            Parts {
                source: source.clone(),
                publisher: source,
                signer: Arc::new(NoIdentity),
                info: Arc::new(StubInfo::default()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn background_fetches_metadata_after_load() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(vec![
            announcement("e1", "https://a.io", Some("a")),
            announcement("e2", "https://b.io", Some("b")),
        ]));
        let app = memory_app(dir.path(), source);
        let bg = app.start_background();
        app.index.load_mints().await.unwrap();

        for _ in 0..200 {
            let done = ["a", "b"]
                .iter()
                .all(|id| app.index.mint(id).is_some_and(|m| m.last_fetched.is_some()));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.index.mint("b").unwrap().name, "Info b.io");
        assert!(app
            .cache
            .get::<MintInfo>(&keys::mint_info("a"), Some(METADATA_TTL))
            .is_some());
        bg.shutdown();
    }

    #[test]
    fn bad_secret_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = settings(dir.path());
        cfg.secret_key = Some("not-hex".into());
        assert!(Parts::from_settings(&cfg).is_err());
        cfg.secret_key = Some("01".repeat(32));
        assert!(Parts::from_settings(&cfg).unwrap().signer.public_key().is_some());
    }
}
