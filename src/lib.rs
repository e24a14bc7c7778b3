//! Nostr-backed index of Cashu mints.
//!
//! Mint announcements and reviews are read from relays and folded into a
//! rated mint list. External mint metadata is fetched lazily in the
//! background, and reviews, comments and reactions are published back to
//! the same relays.

pub mod app;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod content;
pub mod discussion;
pub mod event;
pub mod filter;
pub mod index;
pub mod live;
pub mod mint;
pub mod mint_info;
pub mod notify;
pub mod profiles;
pub mod queue;
pub mod rating;
pub mod reactions;
pub mod relay;
pub mod retry;
pub mod reviews;
pub mod server;
pub mod signer;
pub mod source;
pub mod uptime;
pub mod zap;
