//! Emoji reactions on mints and reviews.
//!
//! The fetched reaction events are the state; counts are derived on demand.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::{
    broadcast::{Outbox, PublishError},
    event::{deletion, kinds, Event, UnsignedEvent},
    filter::Filter,
    index::Tombstones,
    mint::{Mint, Recommendation},
    notify::Notifier,
    source::EventSource,
};

/// Reaction content used when an event carries none.
pub const DEFAULT_EMOJI: &str = "👍";

/// Something that can be reacted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionTarget {
    pub mint_address: String,
    pub mint_url: String,
    /// Author of the mint announcement or review.
    pub author: String,
    /// Set when the target is a review rather than the mint itself.
    pub review_id: Option<String>,
}

impl ReactionTarget {
    pub fn mint(mint: &Mint) -> Self {
        Self {
            mint_address: mint.address(),
            mint_url: mint.url.clone(),
            author: mint.pubkey.clone(),
            review_id: None,
        }
    }

    pub fn review(mint: &Mint, review: &Recommendation) -> Self {
        Self {
            mint_address: mint.address(),
            mint_url: mint.url.clone(),
            author: review.pubkey.clone(),
            review_id: Some(review.id.clone()),
        }
    }

    fn key(&self) -> String {
        match &self.review_id {
            Some(id) => format!("review:{id}"),
            None => format!("mint:{}", self.mint_address),
        }
    }

    fn target_kind(&self) -> u32 {
        if self.review_id.is_some() {
            kinds::RECOMMENDATION
        } else {
            kinds::MINT_ANNOUNCEMENT
        }
    }

    /// Whether `ev` reacts to this target rather than a sibling.
    fn owns(&self, ev: &Event) -> bool {
        match &self.review_id {
            Some(id) => ev.tag_values("e").any(|e| e == id),
            None => {
                ev.tag_values("a").any(|a| a == self.mint_address)
                    && ev.tag_value("e").is_none()
            }
        }
    }

    /// Reaction draft for `emoji`.
    pub fn draft(&self, emoji: &str) -> UnsignedEvent {
        let emoji = if emoji.is_empty() { DEFAULT_EMOJI } else { emoji };
        let mut draft = UnsignedEvent::new(kinds::REACTION, emoji);
        if let Some(id) = &self.review_id {
            draft = draft.tag(&["e", id]);
        }
        draft
            .tag(&["a", &self.mint_address])
            .tag(&["k", &self.target_kind().to_string()])
            .tag(&["r", &self.mint_url])
            .tag(&["p", &self.author])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
    /// Whether the viewer has reacted with this emoji.
    pub reacted: bool,
    /// The viewer's reaction event, needed to retract it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Group reactions by emoji in first-seen order.
pub fn tally(events: &[Event], viewer: Option<&str>) -> Vec<ReactionCount> {
    let mut out: Vec<ReactionCount> = vec![];
    let mut seen = HashSet::new();
    for ev in events {
        if !seen.insert(ev.id.as_str()) {
            continue;
        }
        let emoji = if ev.content.is_empty() {
            DEFAULT_EMOJI
        } else {
            ev.content.as_str()
        };
        let mine = viewer == Some(ev.pubkey.as_str());
        let pos = match out.iter().position(|c| c.emoji == emoji) {
            Some(pos) => pos,
            None => {
                out.push(ReactionCount {
                    emoji: emoji.to_string(),
                    count: 0,
                    reacted: false,
                    event_id: None,
                });
                out.len() - 1
            }
        };
        let entry = &mut out[pos];
        entry.count += 1;
        if mine {
            entry.reacted = true;
            entry.event_id = Some(ev.id.clone());
        }
    }
    out
}

/// Keys of the targets `ev` reacts to, matching [`ReactionTarget::owns`].
fn reaction_keys(ev: &Event) -> Vec<String> {
    let reviews: Vec<String> = ev.tag_values("e").map(|id| format!("review:{id}")).collect();
    if !reviews.is_empty() {
        return reviews;
    }
    ev.tag_values("a").map(|a| format!("mint:{a}")).collect()
}

#[derive(Default)]
struct ReactionState {
    events: HashMap<String, Vec<Event>>,
    deleted: Tombstones,
}

pub struct Reactions {
    source: Arc<dyn EventSource>,
    outbox: Outbox,
    notifier: Notifier,
    state: Mutex<ReactionState>,
}

impl Reactions {
    pub fn new(source: Arc<dyn EventSource>, outbox: Outbox, notifier: Notifier) -> Self {
        Self {
            source,
            outbox,
            notifier,
            state: Mutex::new(ReactionState::default()),
        }
    }

    /// Fetch reactions for `target` and return the tally.
    pub async fn load(&self, target: &ReactionTarget) -> Result<Vec<ReactionCount>> {
        let filter = match &target.review_id {
            Some(id) => Filter::new().kinds([kinds::REACTION]).tag("e", [id.clone()]),
            None => Filter::new()
                .kinds([kinds::REACTION])
                .tag("a", [target.mint_address.clone()]),
        };
        let events = self.source.fetch_events(&filter).await?;
        {
            let mut st = self.state.lock();
            let kept: Vec<Event> = events
                .into_iter()
                .filter(|e| target.owns(e) && !st.deleted.hides(&e.id, &e.pubkey))
                .collect();
            st.events.insert(target.key(), kept);
        }
        Ok(self.counts(target))
    }

    /// Tally from the locally known events.
    pub fn counts(&self, target: &ReactionTarget) -> Vec<ReactionCount> {
        let st = self.state.lock();
        let events = st.events.get(&target.key()).map(Vec::as_slice).unwrap_or(&[]);
        tally(events, self.outbox.public_key().as_deref())
    }

    /// Merge a reaction or deletion from the live feed into every loaded
    /// target it belongs to. Returns whether any tally changed.
    pub fn handle_live_event(&self, ev: &Event) -> bool {
        let mut st = self.state.lock();
        match ev.kind {
            kinds::REACTION => {
                if st.deleted.hides(&ev.id, &ev.pubkey) {
                    return false;
                }
                let mut changed = false;
                for key in reaction_keys(ev) {
                    if let Some(list) = st.events.get_mut(&key) {
                        if list.iter().all(|e| e.id != ev.id) {
                            list.push(ev.clone());
                            changed = true;
                        }
                    }
                }
                changed
            }
            kinds::DELETION => {
                let mut changed = false;
                for target in ev.tag_values("e") {
                    st.deleted.insert_for(target, &ev.pubkey);
                    for list in st.events.values_mut() {
                        let before = list.len();
                        list.retain(|e| !(e.id == target && e.pubkey == ev.pubkey));
                        changed |= list.len() != before;
                    }
                }
                changed
            }
            _ => false,
        }
    }

    /// Add the viewer's `emoji` reaction, or retract it if already present.
    pub async fn toggle(
        &self,
        target: &ReactionTarget,
        emoji: &str,
    ) -> Result<Vec<ReactionCount>, PublishError> {
        self.outbox.require_identity()?;
        let emoji = if emoji.is_empty() { DEFAULT_EMOJI } else { emoji };
        let existing = self
            .counts(target)
            .into_iter()
            .find(|c| c.emoji == emoji)
            .and_then(|c| c.event_id);
        let key = target.key();
        let outcome = match existing {
            Some(event_id) => {
                let tombstone = self.outbox.sign(deletion(&event_id, Some(kinds::REACTION)))?;
                let removed = {
                    let mut st = self.state.lock();
                    st.deleted.insert(&event_id);
                    let list = st.events.entry(key.clone()).or_default();
                    let pos = list.iter().position(|e| e.id == event_id);
                    pos.map(|p| list.remove(p))
                };
                let sent = self.outbox.send(&tombstone).await;
                if sent.is_err() {
                    let mut st = self.state.lock();
                    st.deleted.remove(&event_id);
                    if let Some(ev) = removed {
                        st.events.entry(key.clone()).or_default().push(ev);
                    }
                }
                sent
            }
            None => {
                let event = self.outbox.sign(target.draft(emoji))?;
                self.state
                    .lock()
                    .events
                    .entry(key.clone())
                    .or_default()
                    .push(event.clone());
                let sent = self.outbox.send(&event).await;
                if sent.is_err() {
                    if let Some(list) = self.state.lock().events.get_mut(&key) {
                        list.retain(|e| e.id != event.id);
                    }
                }
                sent
            }
        };
        if let Err(e) = outcome {
            if let Err(reload) = self.load(target).await {
                warn!("reloading reactions failed: {reload:#}");
            }
            self.notifier.error(format!("Failed to update reaction: {e}"));
            return Err(e);
        }
        Ok(self.counts(target))
    }
}
