//! Live feed handler keeping the mint index current.

use std::{sync::Arc, time::Duration};

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::{
    discussion::Discussion,
    event::{kinds, unix_now, Event},
    filter::Filter,
    index::{LiveAction, MintIndex},
    reactions::Reactions,
    source::{EventSource, FeedMessage, Subscription},
};

/// How far back a (re)subscription replays events.
pub const LIVE_WINDOW_SECS: u64 = 60;

/// Filters for the live subscription, starting [`LIVE_WINDOW_SECS`] ago.
pub fn live_filters() -> Vec<Filter> {
    vec![Filter::new()
        .kinds([
            kinds::MINT_ANNOUNCEMENT,
            kinds::RECOMMENDATION,
            kinds::TEXT_NOTE,
            kinds::REACTION,
            kinds::DELETION,
        ])
        .since(unix_now().saturating_sub(LIVE_WINDOW_SECS))]
}

/// Read models kept current by the live feed.
#[derive(Clone)]
pub struct LiveModels {
    pub index: Arc<MintIndex>,
    pub discussion: Arc<Discussion>,
    pub reactions: Arc<Reactions>,
}

impl LiveModels {
    /// Hand `ev` to every read model. Deletions reach all of them.
    fn apply(&self, ev: &Event) -> LiveAction {
        self.discussion.handle_live_event(ev);
        self.reactions.handle_live_event(ev);
        self.index.handle_live_event(ev)
    }
}

/// Follow the live feed until it closes.
///
/// Announcements and recommendations trigger a full reload. Bursts arriving
/// within `coalesce` of the first one share a single reload. Comments,
/// reactions and deletions are applied in place.
pub async fn run_live(models: LiveModels, source: Arc<dyn EventSource>, coalesce: Duration) {
    let mut sub = source.subscribe(live_filters());
    info!("live subscription started");
    while let Some(msg) = sub.recv().await {
        match msg {
            FeedMessage::Event(ev) => {
                if models.apply(&ev) == LiveAction::Reload {
                    debug!(id = %ev.id, kind = ev.kind, "live event requires reload");
                    let open = drain_burst(&models, &mut sub, coalesce).await;
                    let _ = models.index.load_mints().await;
                    if !open {
                        break;
                    }
                }
            }
            FeedMessage::Eose(relay) => debug!(%relay, "live subscription caught up"),
        }
    }
    info!("live subscription ended");
}

/// Apply events arriving within the coalescing window. Returns `false` if
/// the feed closed meanwhile.
async fn drain_burst(models: &LiveModels, sub: &mut Subscription, coalesce: Duration) -> bool {
    let deadline = Instant::now() + coalesce;
    loop {
        match timeout_at(deadline, sub.recv()).await {
            Ok(Some(FeedMessage::Event(ev))) => {
                models.apply(&ev);
            }
            Ok(Some(FeedMessage::Eose(_))) => {}
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::Outbox,
        event::Tag,
        index::tests::{announcement, fixture, review_event, Fixture},
        mint::tests::mint,
        signer::NoIdentity,
        source::tests::MemorySource,
    };
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn recent(mut ev: Event) -> Event {
        ev.created_at = unix_now();
        ev
    }

    /// Split a fixture into the live models, keeping its cache dir alive.
    fn models(f: Fixture) -> (LiveModels, Arc<MemorySource>, TempDir) {
        let outbox = Outbox::new(Arc::new(NoIdentity), f.source.clone());
        let live = LiveModels {
            discussion: Arc::new(Discussion::new(
                f.source.clone(),
                outbox.clone(),
                f.index.profiles().clone(),
                f.notifier.clone(),
            )),
            reactions: Arc::new(Reactions::new(f.source.clone(), outbox, f.notifier.clone())),
            index: Arc::new(f.index),
        };
        (live, f.source, f._dir)
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_share_one_reload() {
        let f = fixture(vec![announcement("e1", "https://a.io", Some("a"))]);
        f.index.load_mints().await.unwrap();
        let (live, source, _dir) = models(f);
        let index = live.index.clone();
        let task = tokio::spawn(run_live(live, source.clone(), Duration::from_millis(500)));
        sleep(Duration::from_millis(10)).await;
        let before = source.fetches.load(Ordering::SeqCst);

        source.push(recent(announcement("e2", "https://b.io", Some("b"))));
        source.push(recent(announcement("e3", "https://c.io", Some("c"))));
        source.push(recent(review_event("r1", "x", "a", "[4/5]")));
        sleep(Duration::from_secs(2)).await;

        // One reload: two batch fetches plus the reviewer's profile lookup.
        assert_eq!(source.fetches.load(Ordering::SeqCst) - before, 3);
        assert_eq!(index.mints().len(), 3);
        assert_eq!(index.mint("a").unwrap().rating, 4.0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn deletions_reach_comments_and_reactions() {
        let f = fixture(vec![]);
        let (live, source, _dir) = models(f);
        let m = mint("m1", "https://m.io");
        live.discussion.load(&m).await.unwrap();
        let target = crate::reactions::ReactionTarget::mint(&m);
        live.reactions.load(&target).await.unwrap();
        let task = tokio::spawn(run_live(live.clone(), source.clone(), Duration::from_millis(100)));
        sleep(Duration::from_millis(10)).await;

        let event = |id: &str, kind: u32, tags: &[&[&str]]| Event {
            id: id.into(),
            pubkey: "fan".into(),
            kind,
            created_at: unix_now(),
            tags: tags.iter().map(|t| Tag::new(t)).collect(),
            content: String::new(),
            sig: String::new(),
        };
        source.push(event("c1", kinds::TEXT_NOTE, &[&["a", "38172:m1"]]));
        source.push(event("x1", kinds::REACTION, &[&["a", "38172:m1"]]));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(live.discussion.comments("m1").len(), 1);
        assert_eq!(live.reactions.counts(&target)[0].count, 1);

        source.push(event("d1", kinds::DELETION, &[&["e", "c1"], &["e", "x1"]]));
        sleep(Duration::from_millis(50)).await;
        assert!(live.discussion.comments("m1").is_empty());
        assert!(live.reactions.counts(&target).is_empty());
        task.abort();
    }

    #[test]
    fn filters_cover_recent_window() {
        let filters = live_filters();
        assert_eq!(filters[0].kinds.as_ref().unwrap().len(), 5);
        assert!(filters[0].since.unwrap() + LIVE_WINDOW_SECS >= unix_now());
    }
}
