//! Mint discussion threads: comments and direct replies.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    broadcast::{Outbox, PublishError},
    event::{deletion, kinds, Event, UnsignedEvent},
    filter::Filter,
    index::Tombstones,
    mint::{Comment, Mint},
    notify::Notifier,
    profiles::ProfileDirectory,
    source::EventSource,
};

/// A top-level comment with every reply beneath it, however deep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub comment: Comment,
    pub replies: Vec<Comment>,
}

/// Top-level comments first, then newest first.
pub fn sort_comments(comments: &mut [Comment]) {
    comments.sort_by_key(|c| (c.reply_to.is_some(), Reverse(c.created_at)));
}

/// Group comments into two-level threads. Replies to replies attach to their
/// root; replies whose root is unknown become top-level.
pub fn threads(comments: &[Comment]) -> Vec<Thread> {
    let by_id: HashMap<&str, &Comment> = comments.iter().map(|c| (c.id.as_str(), c)).collect();
    let root_of = |c: &Comment| -> String {
        let mut cur = c;
        let mut hops = 0;
        while let Some(parent) = cur.reply_to.as_deref().and_then(|p| by_id.get(p)) {
            cur = parent;
            hops += 1;
            if hops > comments.len() {
                break;
            }
        }
        cur.id.clone()
    };
    let mut sorted = comments.to_vec();
    sort_comments(&mut sorted);
    let mut out: Vec<Thread> = vec![];
    let mut slot: HashMap<String, usize> = HashMap::new();
    let mut orphans = vec![];
    for c in sorted {
        let root = root_of(&c);
        if root == c.id {
            slot.insert(c.id.clone(), out.len());
            out.push(Thread {
                comment: c,
                replies: vec![],
            });
        } else {
            orphans.push((root, c));
        }
    }
    for (root, c) in orphans {
        if let Some(i) = slot.get(&root) {
            out[*i].replies.push(c);
        }
    }
    out
}

#[derive(Default)]
struct DiscussionState {
    comments: HashMap<String, Vec<Comment>>,
    deleted: Tombstones,
}

/// Comment store per mint with optimistic publishing.
pub struct Discussion {
    source: Arc<dyn EventSource>,
    outbox: Outbox,
    profiles: ProfileDirectory,
    notifier: Notifier,
    state: Mutex<DiscussionState>,
}

impl Discussion {
    pub fn new(
        source: Arc<dyn EventSource>,
        outbox: Outbox,
        profiles: ProfileDirectory,
        notifier: Notifier,
    ) -> Self {
        Self {
            source,
            outbox,
            profiles,
            notifier,
            state: Mutex::new(DiscussionState::default()),
        }
    }

    /// Fetch the comments addressed to `mint`, replacing the local view.
    pub async fn load(&self, mint: &Mint) -> Result<Vec<Comment>> {
        let filter = Filter::new()
            .kinds([kinds::TEXT_NOTE])
            .tag("a", [mint.address()]);
        let events = self.source.fetch_events(&filter).await?;
        let deleted = self.state.lock().deleted.clone();
        let mut seen = HashSet::new();
        let mut comments: Vec<Comment> = events
            .iter()
            .filter(|e| !deleted.hides(&e.id, &e.pubkey) && seen.insert(e.id.clone()))
            .map(Comment::from)
            .collect();
        self.profiles.attach_to_comments(&mut comments).await;
        sort_comments(&mut comments);
        debug!(mint = %mint.id, count = comments.len(), "comments loaded");
        self.state
            .lock()
            .comments
            .insert(mint.id.clone(), comments.clone());
        Ok(comments)
    }

    pub fn comments(&self, mint_id: &str) -> Vec<Comment> {
        self.state
            .lock()
            .comments
            .get(mint_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn threads(&self, mint_id: &str) -> Vec<Thread> {
        threads(&self.comments(mint_id))
    }

    /// Merge a comment or deletion from the live feed into the thread of
    /// `mint_id`. Returns whether anything changed.
    pub fn apply_live(&self, mint_id: &str, ev: &Event) -> bool {
        match ev.kind {
            kinds::TEXT_NOTE => {
                let mut st = self.state.lock();
                if st.deleted.hides(&ev.id, &ev.pubkey) {
                    return false;
                }
                let list = st.comments.entry(mint_id.to_string()).or_default();
                if list.iter().any(|c| c.id == ev.id) {
                    return false;
                }
                list.push(Comment::from(ev));
                sort_comments(list);
                true
            }
            kinds::DELETION => self.apply_deletion(ev),
            _ => false,
        }
    }

    /// Route a live event to every loaded thread it belongs to.
    pub fn handle_live_event(&self, ev: &Event) -> bool {
        match ev.kind {
            kinds::DELETION => self.apply_deletion(ev),
            kinds::TEXT_NOTE => {
                let prefix = format!("{}:", kinds::MINT_ANNOUNCEMENT);
                let loaded: Vec<String> = {
                    let st = self.state.lock();
                    ev.tag_values("a")
                        .filter_map(|a| a.strip_prefix(prefix.as_str()))
                        .filter(|id| st.comments.contains_key(*id))
                        .map(str::to_string)
                        .collect()
                };
                let mut changed = false;
                for mint_id in loaded {
                    changed |= self.apply_live(&mint_id, ev);
                }
                changed
            }
            _ => false,
        }
    }

    /// Hide the targets of a deletion marker. Only comments by the marker's
    /// author are removed.
    fn apply_deletion(&self, ev: &Event) -> bool {
        let mut st = self.state.lock();
        let mut changed = false;
        for target in ev.tag_values("e") {
            st.deleted.insert_for(target, &ev.pubkey);
            for list in st.comments.values_mut() {
                let before = list.len();
                list.retain(|c| !(c.id == target && c.pubkey == ev.pubkey));
                changed |= list.len() != before;
            }
        }
        changed
    }

    pub async fn post(&self, mint: &Mint, text: &str) -> Result<Comment, PublishError> {
        self.publish_comment(mint, text, None).await
    }

    pub async fn reply(
        &self,
        mint: &Mint,
        parent: &Comment,
        text: &str,
    ) -> Result<Comment, PublishError> {
        self.publish_comment(mint, text, Some(parent)).await
    }

    async fn publish_comment(
        &self,
        mint: &Mint,
        text: &str,
        parent: Option<&Comment>,
    ) -> Result<Comment, PublishError> {
        self.outbox.require_identity()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PublishError::EmptyContent("comment"));
        }
        let mut draft = UnsignedEvent::new(kinds::TEXT_NOTE, text)
            .tag(&["a", &mint.address()])
            .tag(&["r", &mint.url]);
        if let Some(p) = parent {
            draft = draft.tag(&["e", &p.id]).tag(&["p", &p.pubkey]);
        }
        let event = self.outbox.sign(draft)?;
        let comment = Comment::from(&event);
        self.insert_local(&mint.id, comment.clone());
        if let Err(e) = self.outbox.send(&event).await {
            self.remove_local(&mint.id, &comment.id);
            self.restore(mint).await;
            self.notifier.error(format!("Failed to post comment: {e}"));
            return Err(e);
        }
        self.notifier.success(if parent.is_some() {
            "Reply posted"
        } else {
            "Comment posted"
        });
        Ok(comment)
    }

    /// Retract one of the viewer's comments.
    pub async fn delete(&self, mint: &Mint, comment_id: &str) -> Result<(), PublishError> {
        let me = self.outbox.require_identity()?;
        let target = self.own_comment(mint, comment_id, &me)?;
        let tombstone = self.outbox.sign(deletion(comment_id, Some(kinds::TEXT_NOTE)))?;
        self.state.lock().deleted.insert(comment_id);
        self.remove_local(&mint.id, comment_id);
        if let Err(e) = self.outbox.send(&tombstone).await {
            self.state.lock().deleted.remove(comment_id);
            self.insert_local(&mint.id, target);
            self.restore(mint).await;
            self.notifier.error(format!("Failed to delete comment: {e}"));
            return Err(e);
        }
        self.notifier.success("Comment deleted");
        Ok(())
    }

    /// Replace one of the viewer's comments. The reply link and the parent
    /// author's mention are kept.
    pub async fn edit(
        &self,
        mint: &Mint,
        comment_id: &str,
        text: &str,
    ) -> Result<Comment, PublishError> {
        let me = self.outbox.require_identity()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PublishError::EmptyContent("comment"));
        }
        let old = self.own_comment(mint, comment_id, &me)?;
        let mut draft = UnsignedEvent::new(kinds::TEXT_NOTE, text)
            .tag(&["a", &mint.address()])
            .tag(&["r", &mint.url]);
        if let Some(parent) = &old.reply_to {
            draft = draft.tag(&["e", parent]);
            let parent_author = self
                .comments(&mint.id)
                .into_iter()
                .find(|c| &c.id == parent)
                .map(|c| c.pubkey);
            if let Some(author) = parent_author {
                draft = draft.tag(&["p", &author]);
            }
        }
        let tombstone = self.outbox.sign(deletion(comment_id, Some(kinds::TEXT_NOTE)))?;
        let replacement = self.outbox.sign(draft)?;
        let fresh = Comment {
            profile: old.profile.clone(),
            ..Comment::from(&replacement)
        };

        self.state.lock().deleted.insert(comment_id);
        self.remove_local(&mint.id, comment_id);
        self.insert_local(&mint.id, fresh.clone());
        let (retracted, published) =
            tokio::join!(self.outbox.send(&tombstone), self.outbox.send(&replacement));
        if let Err(e) = retracted.and(published) {
            self.state.lock().deleted.remove(comment_id);
            self.remove_local(&mint.id, &fresh.id);
            self.insert_local(&mint.id, old);
            self.restore(mint).await;
            self.notifier.error(format!("Failed to edit comment: {e}"));
            return Err(e);
        }
        self.notifier.success("Comment updated");
        Ok(fresh)
    }

    fn own_comment(&self, mint: &Mint, id: &str, me: &str) -> Result<Comment, PublishError> {
        let comment = self
            .comments(&mint.id)
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| PublishError::UnknownTarget {
                kind: "comment",
                id: id.to_string(),
            })?;
        if comment.pubkey != me {
            return Err(PublishError::Refused(
                "only the author can change a comment".into(),
            ));
        }
        Ok(comment)
    }

    fn insert_local(&self, mint_id: &str, comment: Comment) {
        let mut st = self.state.lock();
        let list = st.comments.entry(mint_id.to_string()).or_default();
        list.retain(|c| c.id != comment.id);
        list.push(comment);
        sort_comments(list);
    }

    fn remove_local(&self, mint_id: &str, id: &str) {
        if let Some(list) = self.state.lock().comments.get_mut(mint_id) {
            list.retain(|c| c.id != id);
        }
    }

    /// Re-read the authoritative list after a failed publish.
    async fn restore(&self, mint: &Mint) {
        if let Err(e) = self.load(mint).await {
            warn!(mint = %mint.id, "reloading comments failed: {e:#}");
        }
    }
}
