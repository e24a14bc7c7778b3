//! Fan-out publishing of one signed event to many relays.
//!
//! Every relay is attempted in parallel. The call returns as soon as the
//! [`PublishPolicy`] is satisfied; the remaining attempts keep running in the
//! background and their outcome is only logged.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    event::{Event, UnsignedEvent},
    signer::Signer,
};

/// Delivery target for signed events.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Relays currently known to the publisher.
    fn relays(&self) -> Vec<String>;

    /// Publish to a single relay, failing if it rejects the event.
    async fn publish_to(&self, relay: &str, event: &Event) -> Result<()>;
}

/// How many relay acceptances make a publish successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Succeed on the first acceptance.
    #[default]
    FirstSuccess,
    /// Succeed once `n` relays accepted (capped at the relay count).
    Quorum(usize),
    /// Every relay must accept.
    All,
}

impl PublishPolicy {
    fn required(self, relays: usize) -> usize {
        match self {
            PublishPolicy::FirstSuccess => 1,
            PublishPolicy::Quorum(n) => n.clamp(1, relays.max(1)),
            PublishPolicy::All => relays.max(1),
        }
    }
}

/// Per-relay outcome observed before the call returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("no relays configured")]
    NoRelays,
    #[error("publish accepted by {accepted} of {required} required relays")]
    PolicyNotMet {
        required: usize,
        accepted: usize,
        report: BroadcastReport,
    },
}

/// Why a user-initiated publish did not go out.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("sign in to publish")]
    NotAuthenticated,
    #[error("{0} cannot be empty")]
    EmptyContent(&'static str),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("unknown {kind} {id}")]
    UnknownTarget { kind: &'static str, id: String },
    #[error("{0}")]
    Refused(String),
    #[error("signing failed: {0}")]
    Signing(anyhow::Error),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Signs drafts with the configured identity and broadcasts them.
#[derive(Clone)]
pub struct Outbox {
    signer: Arc<dyn Signer>,
    publisher: Arc<dyn RelayPublisher>,
    policy: PublishPolicy,
}

impl Outbox {
    pub fn new(signer: Arc<dyn Signer>, publisher: Arc<dyn RelayPublisher>) -> Self {
        Self {
            signer,
            publisher,
            policy: PublishPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Public key of the signing identity, if any.
    pub fn public_key(&self) -> Option<String> {
        self.signer.public_key()
    }

    /// Public key, or [`PublishError::NotAuthenticated`].
    pub fn require_identity(&self) -> Result<String, PublishError> {
        self.public_key().ok_or(PublishError::NotAuthenticated)
    }

    pub fn sign(&self, draft: UnsignedEvent) -> Result<Event, PublishError> {
        self.signer.sign(draft).map_err(PublishError::Signing)
    }

    /// Broadcast an already signed event.
    pub async fn send(&self, event: &Event) -> Result<BroadcastReport, PublishError> {
        let report = broadcast(self.publisher.clone(), event, self.policy).await?;
        debug!(id = %event.id, accepted = report.accepted.len(), "event published");
        Ok(report)
    }

    /// Sign and broadcast `draft`.
    pub async fn publish(&self, draft: UnsignedEvent) -> Result<Event, PublishError> {
        let event = self.sign(draft)?;
        self.send(&event).await?;
        Ok(event)
    }
}

/// Publish `event` to every relay of `publisher` under `policy`.
pub async fn broadcast(
    publisher: Arc<dyn RelayPublisher>,
    event: &Event,
    policy: PublishPolicy,
) -> Result<BroadcastReport, BroadcastError> {
    let relays = publisher.relays();
    if relays.is_empty() {
        return Err(BroadcastError::NoRelays);
    }
    let required = policy.required(relays.len());
    let (tx, mut rx) = mpsc::channel(relays.len());
    for relay in relays.iter().cloned() {
        let publisher = publisher.clone();
        let event = event.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = publisher.publish_to(&relay, &event).await;
            match &outcome {
                Ok(()) => debug!(relay = %relay, id = %event.id, "event accepted"),
                Err(e) => warn!(relay = %relay, id = %event.id, "publish failed: {e}"),
            }
            // The receiver is gone once the policy was met; stragglers are fine.
            let _ = tx.send((relay, outcome.map_err(|e| e.to_string()))).await;
        });
    }
    drop(tx);

    let mut report = BroadcastReport::default();
    while let Some((relay, outcome)) = rx.recv().await {
        match outcome {
            Ok(()) => report.accepted.push(relay),
            Err(e) => report.rejected.push((relay, e)),
        }
        if report.accepted.len() >= required {
            return Ok(report);
        }
    }
    Err(BroadcastError::PolicyNotMet {
        required,
        accepted: report.accepted.len(),
        report,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::{collections::HashMap, time::Duration};

    /// Scripted relays: `Ok` after a delay, or a rejection.
    #[derive(Default)]
    pub(crate) struct ScriptedRelays {
        pub script: HashMap<String, (Duration, bool)>,
        pub published: Mutex<Vec<(String, Event)>>,
    }

    impl ScriptedRelays {
        pub(crate) fn new(entries: &[(&str, u64, bool)]) -> Self {
            Self {
                script: entries
                    .iter()
                    .map(|(r, ms, ok)| (r.to_string(), (Duration::from_millis(*ms), *ok)))
                    .collect(),
                published: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl RelayPublisher for ScriptedRelays {
        fn relays(&self) -> Vec<String> {
            let mut relays: Vec<String> = self.script.keys().cloned().collect();
            relays.sort();
            relays
        }

        async fn publish_to(&self, relay: &str, event: &Event) -> Result<()> {
            let (delay, ok) = self.script[relay];
            tokio::time::sleep(delay).await;
            if ok {
                self.published.lock().push((relay.to_string(), event.clone()));
                Ok(())
            } else {
                Err(anyhow!("blocked"))
            }
        }
    }

    pub(crate) fn sample_event() -> Event {
        Event {
            id: "ee".into(),
            pubkey: "p".into(),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: "hi".into(),
            sig: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_returns_before_slow_relays() {
        let relays = Arc::new(ScriptedRelays::new(&[
            ("wss://bad", 10, false),
            ("wss://fast", 50, true),
            ("wss://slow", 10_000, true),
        ]));
        let started = tokio::time::Instant::now();
        let report = broadcast(relays.clone(), &sample_event(), PublishPolicy::FirstSuccess)
            .await
            .unwrap();
        assert_eq!(report.accepted, vec!["wss://fast".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn total_rejection_is_an_error() {
        let relays = Arc::new(ScriptedRelays::new(&[("wss://a", 1, false), ("wss://b", 2, false)]));
        let err = broadcast(relays, &sample_event(), PublishPolicy::FirstSuccess)
            .await
            .unwrap_err();
        match err {
            BroadcastError::PolicyNotMet { accepted, report, .. } => {
                assert_eq!(accepted, 0);
                assert_eq!(report.rejected.len(), 2);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_and_all_wait_for_enough_relays() {
        let relays = Arc::new(ScriptedRelays::new(&[
            ("wss://a", 1, true),
            ("wss://b", 5, true),
            ("wss://c", 3, false),
        ]));
        let report = broadcast(relays.clone(), &sample_event(), PublishPolicy::Quorum(2))
            .await
            .unwrap();
        assert_eq!(report.accepted.len(), 2);
        assert!(broadcast(relays, &sample_event(), PublishPolicy::All).await.is_err());
    }

    #[tokio::test]
    async fn outbox_requires_identity_and_signs() {
        use crate::signer::{Keys, NoIdentity};
        let relays = Arc::new(ScriptedRelays::new(&[("wss://a", 0, true)]));
        let anon = Outbox::new(Arc::new(NoIdentity), relays.clone());
        assert!(matches!(anon.require_identity(), Err(PublishError::NotAuthenticated)));
        assert!(matches!(
            anon.publish(UnsignedEvent::new(1, "x")).await,
            Err(PublishError::Signing(_))
        ));

        let keys = Arc::new(Keys::from_slice(&[3u8; 32]).unwrap());
        let outbox = Outbox::new(keys, relays.clone());
        let ev = outbox.publish(UnsignedEvent::new(1, "hello")).await.unwrap();
        crate::event::verify_event(&ev).unwrap();
        assert_eq!(relays.published.lock()[0].1.id, ev.id);
    }

    #[tokio::test]
    async fn empty_relay_list_is_rejected() {
        let relays = Arc::new(ScriptedRelays::default());
        assert!(matches!(
            broadcast(relays, &sample_event(), PublishPolicy::All).await,
            Err(BroadcastError::NoRelays)
        ));
    }
}
