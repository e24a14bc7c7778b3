//! Mint aggregation engine.
//!
//! Merges mint announcements and their recommendations into the derived
//! [`Mint`] list, keeps that list in sync with the live feed, and drives the
//! review publish flows. The list is replaced wholesale on reload and patched
//! copy-on-write for targeted updates, always under the index's own lock.
//! No lock is held across an await.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Outbox, PublishError},
    cache::{self, keys, Cache, METADATA_TTL},
    content::{hostname_of, parse_mint_content, MintInfo, UNREACHABLE_DESCRIPTION},
    event::{deletion, kinds, Event},
    filter::Filter,
    mint::{MetaFilters, Mint, Recommendation},
    mint_info::{fetch_or_placeholder, MintInfoFetcher},
    notify::Notifier,
    profiles::ProfileDirectory,
    queue::MetadataJob,
    reviews::{compile_edit, recommendation_draft, user_review},
    source::EventSource,
};

/// Phase of the most recent load cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Success,
    Failed,
}

/// Snapshot of the engine's load state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub phase: LoadPhase,
    pub loading: bool,
    pub error: Option<String>,
    pub count: usize,
}

/// What the live handler should do after an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAction {
    /// The full list must be rebuilt.
    Reload,
    /// The event was applied in place.
    Patched,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Network assumed for announcements without an `n` tag.
    pub default_network: String,
    /// Batch limit for announcement fetches.
    pub mint_limit: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            default_network: "mainnet".into(),
            mint_limit: 100,
        }
    }
}

/// Ids retracted by deletion markers.
///
/// Local retractions hide an id outright. Retractions seen on the feed only
/// hide events by the same author, and are kept even when the target has not
/// arrived yet.
#[derive(Debug, Clone, Default)]
pub struct Tombstones {
    ids: HashSet<String>,
    by_author: HashMap<String, String>,
}

impl Tombstones {
    pub fn hides(&self, id: &str, author: &str) -> bool {
        self.ids.contains(id) || self.by_author.get(id).is_some_and(|a| a == author)
    }

    pub fn insert(&mut self, id: &str) {
        self.ids.insert(id.to_string());
    }

    pub fn insert_for(&mut self, id: &str, author: &str) {
        self.by_author.insert(id.to_string(), author.to_string());
    }

    pub fn remove(&mut self, id: &str) {
        self.ids.remove(id);
        self.by_author.remove(id);
    }
}

#[derive(Default)]
struct IndexState {
    mints: Arc<Vec<Mint>>,
    phase: LoadPhase,
    error: Option<String>,
    meta_filters: MetaFilters,
    tombstones: Tombstones,
    loads_in_flight: usize,
}

/// Collaborators the engine needs.
pub struct IndexDeps {
    pub source: Arc<dyn EventSource>,
    pub outbox: Outbox,
    pub cache: Cache,
    pub info: Arc<dyn MintInfoFetcher>,
    pub notifier: Notifier,
}

pub struct MintIndex {
    source: Arc<dyn EventSource>,
    outbox: Outbox,
    cache: Cache,
    info: Arc<dyn MintInfoFetcher>,
    profiles: ProfileDirectory,
    notifier: Notifier,
    config: IndexConfig,
    state: RwLock<IndexState>,
    revision: watch::Sender<u64>,
}

/// Clears the loading state however a load cycle ends.
struct LoadGuard<'a>(&'a RwLock<IndexState>);

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.0.write();
        st.loads_in_flight = st.loads_in_flight.saturating_sub(1);
        if st.loads_in_flight == 0 && st.phase == LoadPhase::Loading {
            st.phase = LoadPhase::Idle;
        }
    }
}

impl MintIndex {
    pub fn new(deps: IndexDeps, config: IndexConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            profiles: ProfileDirectory::new(deps.source.clone(), deps.cache.clone()),
            source: deps.source,
            outbox: deps.outbox,
            cache: deps.cache,
            info: deps.info,
            notifier: deps.notifier,
            config,
            state: RwLock::new(IndexState::default()),
            revision,
        }
    }

    /// Current derived list.
    pub fn mints(&self) -> Arc<Vec<Mint>> {
        self.state.read().mints.clone()
    }

    pub fn mint(&self, id: &str) -> Option<Mint> {
        self.state.read().mints.iter().find(|m| m.id == id).cloned()
    }

    pub fn meta_filters(&self) -> MetaFilters {
        self.state.read().meta_filters.clone()
    }

    pub fn status(&self) -> IndexStatus {
        let st = self.state.read();
        IndexStatus {
            phase: st.phase,
            loading: st.loads_in_flight > 0,
            error: st.error.clone(),
            count: st.mints.len(),
        }
    }

    pub fn profiles(&self) -> &ProfileDirectory {
        &self.profiles
    }

    /// Receiver bumped on every change to the derived list.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Ids in list order, for the metadata queue.
    pub fn metadata_candidates(&self) -> Vec<String> {
        self.state.read().mints.iter().map(|m| m.id.clone()).collect()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn replace_mints(&self, mints: Vec<Mint>) {
        let filters = MetaFilters::from_mints(&mints);
        {
            let mut st = self.state.write();
            st.mints = Arc::new(mints);
            st.meta_filters = filters;
        }
        self.bump();
    }

    /// Apply `f` to one mint copy-on-write. Returns whether it was found.
    fn patch_mint(&self, id: &str, f: impl FnOnce(&mut Mint)) -> bool {
        let found = {
            let mut st = self.state.write();
            match st.mints.iter().position(|m| m.id == id) {
                Some(pos) => {
                    let mut next = (*st.mints).clone();
                    f(&mut next[pos]);
                    st.meta_filters = MetaFilters::from_mints(&next);
                    st.mints = Arc::new(next);
                    true
                }
                None => false,
            }
        };
        if found {
            self.bump();
        }
        found
    }

    /// Serve the cached list when nothing is loaded yet.
    fn restore_from_cache(&self) -> bool {
        if !self.state.read().mints.is_empty() {
            return false;
        }
        let Some(cached) = self.cache.get::<Vec<Mint>>(keys::MINTS, None) else {
            return false;
        };
        let tombstones = self.state.read().tombstones.clone();
        let cached: Vec<Mint> = cached
            .into_iter()
            .filter(|m| !tombstones.hides(&m.id, &m.pubkey))
            .map(|mut m| {
                m.recommendations
                    .retain(|r| !tombstones.hides(&r.id, &r.pubkey));
                m.refresh_rating();
                m
            })
            .collect();
        debug!(count = cached.len(), "serving cached mint list");
        self.replace_mints(cached);
        true
    }

    /// Fetch announcements and recommendations and rebuild the list.
    ///
    /// On failure the current list is kept; an empty list falls back to the
    /// cached one. The error is recorded in [`MintIndex::status`].
    pub async fn load_mints(&self) -> Result<usize> {
        {
            let mut st = self.state.write();
            st.loads_in_flight += 1;
            st.phase = LoadPhase::Loading;
        }
        let _guard = LoadGuard(&self.state);
        self.restore_from_cache();

        let announcements = Filter::new()
            .kinds([kinds::MINT_ANNOUNCEMENT])
            .limit(self.config.mint_limit);
        let recommendations = Filter::new()
            .kinds([kinds::RECOMMENDATION])
            .tag("k", [kinds::MINT_ANNOUNCEMENT.to_string()]);
        let fetched = tokio::try_join!(
            self.source.fetch_events(&announcements),
            self.source.fetch_events(&recommendations),
        );
        let (announcements, recommendations) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                warn!("loading mints failed: {e:#}");
                {
                    let mut st = self.state.write();
                    st.phase = LoadPhase::Failed;
                    st.error = Some(format!("{e:#}"));
                }
                self.restore_from_cache();
                return Err(e);
            }
        };
        debug!(
            announcements = announcements.len(),
            recommendations = recommendations.len(),
            "fetched mint events"
        );

        let tombstones = self.state.read().tombstones.clone();
        let mut mints = build_mints(
            &announcements,
            &recommendations,
            &self.config.default_network,
            &tombstones,
        );
        self.carry_over_info(&mut mints);
        self.attach_profiles(&mut mints).await;

        let count = mints.len();
        self.replace_mints(mints);
        {
            let mut st = self.state.write();
            st.phase = LoadPhase::Success;
            st.error = None;
        }
        let st = self.state.read();
        if let Err(e) = self.cache.set(keys::MINTS, &*st.mints) {
            warn!("caching mint list failed: {e}");
        }
        if let Err(e) = self.cache.set(keys::META_FILTERS, &st.meta_filters) {
            warn!("caching meta filters failed: {e}");
        }
        info!(count, "mint list loaded");
        Ok(count)
    }

    /// Keep metadata fetched for mints that survive a rebuild.
    fn carry_over_info(&self, mints: &mut [Mint]) {
        let current = self.mints();
        for mint in mints.iter_mut() {
            if let Some(prev) = current.iter().find(|m| m.id == mint.id) {
                mint.info = prev.info.clone();
                mint.last_fetched = prev.last_fetched;
            }
            if mint.info.is_none() {
                mint.info = self.cache.get(&keys::mint_info(&mint.id), None);
            }
        }
    }

    async fn attach_profiles(&self, mints: &mut [Mint]) {
        let authors: Vec<String> = mints
            .iter()
            .flat_map(|m| m.recommendations.iter().map(|r| r.pubkey.clone()))
            .collect();
        let found = self
            .profiles
            .profiles(authors.iter().map(String::as_str))
            .await;
        for rec in mints.iter_mut().flat_map(|m| m.recommendations.iter_mut()) {
            rec.profile = found.get(&rec.pubkey).cloned();
        }
    }

    /// Cache-first external metadata for one mint. Returns the last known
    /// value when fetching fails.
    pub async fn get_mint_info(&self, mint_id: &str) -> Option<MintInfo> {
        let mint = self.mint(mint_id)?;
        let key = keys::mint_info(mint_id);
        if let Some(info) = self.cache.get::<MintInfo>(&key, None) {
            let patched = info.clone();
            self.patch_mint(mint_id, |m| m.info = Some(patched));
            return Some(info);
        }
        match self.info.fetch_info(&mint.url).await {
            Ok(info) => {
                if let Err(e) = self.cache.set(&key, &info) {
                    warn!(mint = %mint_id, "caching mint info failed: {e}");
                }
                let patched = info.clone();
                self.patch_mint(mint_id, |m| {
                    m.info = Some(patched);
                    m.last_fetched = Some(cache::now_millis());
                });
                Some(info)
            }
            Err(e) => {
                warn!(mint = %mint_id, "mint info unavailable: {e:#}");
                mint.info
            }
        }
    }

    /// Background refresh: always records something, a placeholder at worst.
    pub async fn refresh_metadata(&self, mint_id: &str) {
        let Some(mint) = self.mint(mint_id) else {
            return;
        };
        let info = fetch_or_placeholder(self.info.as_ref(), &mint.url).await;
        if let Err(e) = self.cache.set(&keys::mint_info(mint_id), &info) {
            warn!(mint = %mint_id, "caching mint info failed: {e}");
        }
        let reachable = info.description.as_deref() != Some(UNREACHABLE_DESCRIPTION);
        self.patch_mint(mint_id, |m| {
            if reachable {
                if let Some(name) = &info.name {
                    m.name = name.clone();
                }
                if let Some(desc) = &info.description {
                    m.description = desc.clone();
                }
            }
            m.info = Some(info);
            m.last_fetched = Some(cache::now_millis());
        });
    }

    /// Whether cached metadata for `mint_id` is younger than the queue TTL.
    /// Older entries stay readable until the default TTL expires them.
    pub fn is_info_fresh(&self, mint_id: &str) -> bool {
        self.cache
            .age(&keys::mint_info(mint_id))
            .is_some_and(|age| age < METADATA_TTL)
    }

    /// Publish a review and reload. Failures are logged and notified.
    pub async fn recommend_mint(&self, mint_id: &str, text: &str, rating: u8) -> bool {
        match self.submit_review(mint_id, text, rating).await {
            Ok(_) => {
                self.notifier.success("Review published");
                true
            }
            Err(e) => {
                warn!(mint = %mint_id, "review not published: {e}");
                self.notifier.error(format!("Failed to publish review: {e}"));
                false
            }
        }
    }

    /// Publish a review unless the viewer already has one for this mint.
    pub async fn submit_review(
        &self,
        mint_id: &str,
        text: &str,
        rating: u8,
    ) -> Result<Event, PublishError> {
        let me = self.outbox.require_identity()?;
        if !(1..=5).contains(&rating) {
            return Err(PublishError::InvalidRating(rating));
        }
        let mint = self.require_mint(mint_id)?;
        if user_review(&mint.recommendations, &me).is_some() {
            return Err(PublishError::Refused(
                "you already reviewed this mint; edit your review instead".into(),
            ));
        }
        let event = self
            .outbox
            .publish(recommendation_draft(&mint, rating, text))
            .await?;
        self.reload_after_publish(mint_id).await;
        Ok(event)
    }

    /// Retract the viewer's review, hiding it immediately.
    pub async fn delete_review(&self, review_id: &str) -> Result<(), PublishError> {
        let me = self.outbox.require_identity()?;
        let (mint, review) = self.require_review(review_id)?;
        if review.pubkey != me {
            return Err(PublishError::Refused("only the author can delete a review".into()));
        }
        let tombstone = self
            .outbox
            .sign(deletion(review_id, Some(kinds::RECOMMENDATION)))?;
        self.apply_deletion(review_id);
        if let Err(e) = self.outbox.send(&tombstone).await {
            self.rollback(&[review_id], &mint.id).await;
            self.notifier.error(format!("Failed to delete review: {e}"));
            return Err(e);
        }
        self.notifier.success("Review deleted");
        self.reload_after_publish(&mint.id).await;
        Ok(())
    }

    /// Replace the viewer's review: retract the old one and publish the new
    /// one in parallel. Both must be accepted.
    pub async fn edit_review(
        &self,
        review_id: &str,
        text: &str,
        rating: u8,
    ) -> Result<Event, PublishError> {
        let me = self.outbox.require_identity()?;
        if !(1..=5).contains(&rating) {
            return Err(PublishError::InvalidRating(rating));
        }
        let (mint, review) = self.require_review(review_id)?;
        if review.pubkey != me {
            return Err(PublishError::Refused("only the author can edit a review".into()));
        }
        let cmds = compile_edit(&mint, review_id, rating, text);
        let tombstone = self.outbox.sign(cmds.tombstone)?;
        let replacement = self.outbox.sign(cmds.replacement)?;

        self.apply_deletion(review_id);
        let fresh = Recommendation::from(&replacement);
        self.patch_mint(&mint.id, |m| {
            m.recommendations.push(fresh);
            m.refresh_rating();
        });

        let (retracted, published) =
            tokio::join!(self.outbox.send(&tombstone), self.outbox.send(&replacement));
        if let Err(e) = retracted.and(published) {
            self.rollback(&[review_id], &mint.id).await;
            self.notifier.error(format!("Failed to update review: {e}"));
            return Err(e);
        }
        self.notifier.success("Review updated");
        self.reload_after_publish(&mint.id).await;
        Ok(replacement)
    }

    fn require_mint(&self, mint_id: &str) -> Result<Mint, PublishError> {
        self.mint(mint_id).ok_or_else(|| PublishError::UnknownTarget {
            kind: "mint",
            id: mint_id.to_string(),
        })
    }

    fn require_review(&self, review_id: &str) -> Result<(Mint, Recommendation), PublishError> {
        self.mints()
            .iter()
            .find_map(|m| {
                m.recommendations
                    .iter()
                    .find(|r| r.id == review_id)
                    .map(|r| (m.clone(), r.clone()))
            })
            .ok_or_else(|| PublishError::UnknownTarget {
                kind: "review",
                id: review_id.to_string(),
            })
    }

    async fn reload_after_publish(&self, mint_id: &str) {
        if let Err(e) = self.cache.remove(&keys::reviews(mint_id)) {
            debug!("dropping cached reviews failed: {e}");
        }
        if let Err(e) = self.load_mints().await {
            warn!("reload after publish failed: {e:#}");
        }
    }

    /// Undo optimistic tombstones and restore the authoritative list.
    async fn rollback(&self, restored: &[&str], mint_id: &str) {
        {
            let mut st = self.state.write();
            for id in restored {
                st.tombstones.remove(id);
            }
        }
        self.reload_after_publish(mint_id).await;
    }

    /// Remember `target_id` as deleted and drop it from the derived list.
    /// Repeated calls are harmless.
    pub fn apply_deletion(&self, target_id: &str) -> bool {
        self.remove_matching(target_id, None)
    }

    fn remove_matching(&self, target_id: &str, author: Option<&str>) -> bool {
        let changed = {
            let mut st = self.state.write();
            let owned = |pubkey: &str| author.map_or(true, |a| a == pubkey);
            let hit = st.mints.iter().any(|m| {
                (m.id == target_id && owned(&m.pubkey))
                    || m
                        .recommendations
                        .iter()
                        .any(|r| r.id == target_id && owned(&r.pubkey))
            });
            match author {
                Some(a) => st.tombstones.insert_for(target_id, a),
                None => st.tombstones.insert(target_id),
            }
            if hit {
                let next: Vec<Mint> = st
                    .mints
                    .iter()
                    .filter(|m| !(m.id == target_id && owned(&m.pubkey)))
                    .cloned()
                    .map(|mut m| {
                        let before = m.recommendations.len();
                        m.recommendations
                            .retain(|r| !(r.id == target_id && owned(&r.pubkey)));
                        if m.recommendations.len() != before {
                            m.refresh_rating();
                        }
                        m
                    })
                    .collect();
                st.meta_filters = MetaFilters::from_mints(&next);
                st.mints = Arc::new(next);
            }
            hit
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// Apply one event from the live feed.
    pub fn handle_live_event(&self, ev: &Event) -> LiveAction {
        if self.state.read().tombstones.hides(&ev.id, &ev.pubkey) {
            return LiveAction::Ignored;
        }
        match ev.kind {
            kinds::MINT_ANNOUNCEMENT | kinds::RECOMMENDATION => LiveAction::Reload,
            kinds::REACTION => {
                if self.patch_reaction(ev) {
                    LiveAction::Patched
                } else {
                    LiveAction::Ignored
                }
            }
            kinds::DELETION => {
                // Only the author of a target may retract it.
                let mut any = false;
                for target in ev.tag_values("e") {
                    any |= self.remove_matching(target, Some(&ev.pubkey));
                }
                if any {
                    LiveAction::Patched
                } else {
                    LiveAction::Ignored
                }
            }
            _ => LiveAction::Ignored,
        }
    }

    /// Recompute rating fields of the mint a reaction points at.
    pub fn patch_reaction(&self, ev: &Event) -> bool {
        let Some(mint_id) = ev
            .tag_value("a")
            .and_then(|a| a.split(':').nth(1))
            .filter(|id| !id.is_empty())
        else {
            return false;
        };
        self.patch_mint(mint_id, Mint::refresh_rating)
    }
}

#[async_trait]
impl MetadataJob for MintIndex {
    fn is_fresh(&self, mint_id: &str) -> bool {
        self.is_info_fresh(mint_id)
    }

    async fn refresh(&self, mint_id: &str) {
        self.refresh_metadata(mint_id).await
    }
}

/// Build the derived list from fetched events.
///
/// The first announcement per URL wins. Recommendations are linked when one
/// of their `a` tags contains the mint id.
pub fn build_mints(
    announcements: &[Event],
    recommendations: &[Event],
    default_network: &str,
    tombstones: &Tombstones,
) -> Vec<Mint> {
    let mut seen_urls = HashSet::new();
    let mut mints = vec![];
    for ev in announcements {
        if tombstones.hides(&ev.id, &ev.pubkey) {
            continue;
        }
        let Some(url) = ev.tag_value("u").filter(|u| !u.is_empty()) else {
            continue;
        };
        if !seen_urls.insert(url.to_string()) {
            debug!(%url, id = %ev.id, "skipping duplicate announcement");
            continue;
        }
        let id = ev.tag_value("d").unwrap_or(&ev.id).to_string();
        if tombstones.hides(&id, &ev.pubkey) {
            continue;
        }
        let nuts = ev
            .tag_value("nuts")
            .map(|n| {
                n.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let recommendations = recommendations
            .iter()
            .filter(|r| !tombstones.hides(&r.id, &r.pubkey))
            .filter(|r| r.tag_values("a").any(|a| a.contains(id.as_str())))
            .map(Recommendation::from)
            .collect();
        let parsed = parse_mint_content(&ev.content);
        let mut mint = Mint {
            id,
            pubkey: ev.pubkey.clone(),
            url: url.to_string(),
            nuts,
            network: ev.tag_value("n").unwrap_or(default_network).to_string(),
            name: parsed.name.unwrap_or_else(|| hostname_of(url)),
            description: parsed.description.unwrap_or_default(),
            likes: 0,
            dislikes: 0,
            rating: 0.0,
            recommendations,
            info: None,
            last_fetched: None,
        };
        mint.refresh_rating();
        mints.push(mint);
    }
    mints
}
