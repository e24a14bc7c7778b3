//! Nostr event model and the kinds this index understands.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Event kinds consumed or produced by the index.
pub mod kinds {
    /// Profile metadata (JSON content).
    pub const METADATA: u32 = 0;
    /// Short text note, used for mint discussion comments.
    pub const TEXT_NOTE: u32 = 1;
    /// Deletion marker referencing other events through `e` tags.
    pub const DELETION: u32 = 5;
    /// Emoji reaction.
    pub const REACTION: u32 = 7;
    /// Zap request handed to a lightning address service.
    pub const ZAP_REQUEST: u32 = 9734;
    /// Wallet-connect payment request.
    pub const NWC_REQUEST: u32 = 23194;
    /// Wallet-connect payment response.
    pub const NWC_RESPONSE: u32 = 23195;
    /// Recommendation (review) of a mint announcement.
    pub const RECOMMENDATION: u32 = 38000;
    /// Cashu mint announcement.
    pub const MINT_ANNOUNCEMENT: u32 = 38172;
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry data, e.g.
/// `["u", "https://mint.example"]` or `["a", "38172:<mint id>"]`. Tags are
/// kept verbatim so unknown tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string slices.
    pub fn new(parts: &[&str]) -> Self {
        Tag(parts.iter().map(|p| p.to_string()).collect())
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as delivered by relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "c0ff…",
///   "kind": 38172,
///   "created_at": 1700000000,
///   "tags": [["u", "https://mint.example"], ["d", "mint-1"]],
///   "content": "{\"name\":\"Example\"}",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, see [`kinds`].
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tag list.
    pub tags: Vec<Tag>,
    /// Free text or JSON body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }
}

/// Event draft awaiting a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Start a draft stamped with the current time.
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags: vec![],
            content: content.into(),
        }
    }

    /// Append a tag.
    pub fn tag(mut self, parts: &[&str]) -> Self {
        self.tags.push(Tag::new(parts));
        self
    }

    /// Value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }
}

/// Deletion marker for `target_id`, optionally naming the target's kind.
pub fn deletion(target_id: &str, target_kind: Option<u32>) -> UnsignedEvent {
    let draft = UnsignedEvent::new(kinds::DELETION, "").tag(&["e", target_id]);
    match target_kind {
        Some(k) => draft.tag(&["k", &k.to_string()]),
        None => draft,
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Compute the NIP-01 event hash from its serialized fields.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
