//! Command line interface for the mint index.

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::bail;
use cashumints::{
    app::App,
    cache::Cache,
    config::{Settings, DEFAULT_RELAYS},
    mint::MintQuery,
    server::{self, HttpState},
    zap::ZapRequest,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "cashumints",
    author,
    version,
    about = "Nostr-backed index of Cashu mints",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` if missing and create the cache directory.
    Init,
    /// Load announcements and print the mint list.
    List {
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        nut: Option<String>,
        /// Search term matched against name, url and description.
        #[arg(long)]
        q: Option<String>,
    },
    /// Print the metadata a mint reports about itself.
    Info { id: String },
    /// Publish a review of a mint.
    Review {
        id: String,
        /// Rating from 1 to 5.
        #[arg(long, default_value_t = 5)]
        rating: u8,
        #[arg(default_value = "")]
        text: String,
    },
    /// Retract one of your reviews.
    DeleteReview { review_id: String },
    /// Zap a public key.
    Zap {
        pubkey: String,
        sats: u64,
        /// Event being zapped.
        #[arg(long)]
        event: Option<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Serve the HTTP API and keep the index current.
    Serve,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            Cache::new(cfg.cache_root.clone(), cfg.cache_duration).init()?;
            println!("cache ready at {}", cfg.cache_root.display());
        }
        Commands::List { network, nut, q } => {
            let app = App::build(cfg)?;
            app.index.load_mints().await?;
            let query = MintQuery {
                network,
                nut,
                search: q,
            };
            for mint in app.index.mints().iter().filter(|m| query.matches(m)) {
                println!(
                    "{}\t{}\t{}\t{:.1} ({} reviews)",
                    mint.id,
                    mint.name,
                    mint.url,
                    mint.rating,
                    mint.recommendations.len()
                );
            }
        }
        Commands::Info { id } => {
            let app = App::build(cfg)?;
            app.index.load_mints().await?;
            if app.index.mint(&id).is_none() {
                bail!("unknown mint: {id}");
            }
            match app.index.get_mint_info(&id).await {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => bail!("no metadata available for {id}"),
            }
        }
        Commands::Review { id, rating, text } => {
            let app = App::build(cfg)?;
            app.index.load_mints().await?;
            let event = app.index.submit_review(&id, &text, rating).await?;
            println!("{}", event.id);
        }
        Commands::DeleteReview { review_id } => {
            let app = App::build(cfg)?;
            app.index.load_mints().await?;
            app.index.delete_review(&review_id).await?;
        }
        Commands::Zap {
            pubkey,
            sats,
            event,
            comment,
        } => {
            let app = App::build(cfg)?;
            let request = ZapRequest {
                recipient: pubkey,
                amount_msats: sats.saturating_mul(1000),
                relays: app.settings.relays.clone(),
                event_id: event,
                comment,
            };
            let outcome = app.zapper.zap(&request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let app = Arc::new(App::build(cfg)?);
            let background = app.start_background();
            let index = app.index.clone();
            tokio::spawn(async move {
                if let Err(e) = index.load_mints().await {
                    warn!("initial load failed: {e:#}");
                }
            });
            info!(%http_addr, "serving");
            let state = HttpState {
                app,
                queue: background.queue.clone(),
            };
            let result = server::serve_http(http_addr, state, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
            background.shutdown();
            result?;
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_root = base_dir.join("cashumints-data");
    let mut content = String::new();
    content.push_str(&format!("CACHE_ROOT={}\n", cache_root.to_string_lossy()));
    content.push_str("BIND_HTTP=127.0.0.1:7780\n");
    content.push_str(&format!("RELAYS={}\n", DEFAULT_RELAYS.join(",")));
    content.push_str("DEFAULT_NETWORK=mainnet\n");
    content.push_str("CACHE_DURATION=3600000\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("UPTIME_URL=\n");
    content.push_str("UPTIME_API_KEY=\n");
    content.push_str("METADATA_INTERVAL=5000\n");
    content.push_str("MINT_LIMIT=100\n");
    content.push_str("NWC_WALLET_PUBKEY=\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "cashumints=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let cli = Cli::parse();
    run(cli).await
}
