//! Signing identities.

use anyhow::{anyhow, Context, Result};
use secp256k1::{All, Keypair, Message, Secp256k1};

use crate::event::{event_hash, Event, UnsignedEvent};

/// Turns drafts into signed events on behalf of one identity.
pub trait Signer: Send + Sync {
    /// Hex public key of the identity, if one is configured.
    fn public_key(&self) -> Option<String>;

    /// Sign a draft, filling in `id`, `pubkey` and `sig`.
    fn sign(&self, draft: UnsignedEvent) -> Result<Event>;
}

/// Local secp256k1 key pair.
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
}

impl Keys {
    /// Load a key pair from a hex-encoded 32-byte secret key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim()).context("decoding secret key")?;
        Self::from_slice(&bytes)
    }

    /// Load a key pair from raw secret key bytes.
    pub fn from_slice(secret: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret).context("invalid secret key")?;
        Ok(Self { secp, keypair })
    }

    /// Hex x-only public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }
}

impl Signer for Keys {
    fn public_key(&self) -> Option<String> {
        Some(self.public_key_hex())
    }

    fn sign(&self, draft: UnsignedEvent) -> Result<Event> {
        let pubkey = self.public_key_hex();
        let hash = event_hash(
            &pubkey,
            draft.created_at,
            draft.kind,
            &draft.tags,
            &draft.content,
        )?;
        let msg = Message::from_digest_slice(&hash)?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: draft.kind,
            created_at: draft.created_at,
            tags: draft.tags,
            content: draft.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Placeholder used when no secret key is configured; every signature fails.
pub struct NoIdentity;

impl Signer for NoIdentity {
    fn public_key(&self) -> Option<String> {
        None
    }

    fn sign(&self, _draft: UnsignedEvent) -> Result<Event> {
        Err(anyhow!("no signing identity configured"))
    }
}
