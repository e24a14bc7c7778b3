//! Cache-first profile lookup.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use crate::{
    cache::{keys, Cache, PROFILE_TTL},
    event::kinds,
    filter::Filter,
    mint::{Comment, Recommendation, UserProfile},
    source::EventSource,
};

/// Resolves public keys to profiles, caching results for a day.
#[derive(Clone)]
pub struct ProfileDirectory {
    source: Arc<dyn EventSource>,
    cache: Cache,
}

impl ProfileDirectory {
    pub fn new(source: Arc<dyn EventSource>, cache: Cache) -> Self {
        Self { source, cache }
    }

    /// Profile for `pubkey`; `None` when unknown or unreachable.
    pub async fn profile(&self, pubkey: &str) -> Option<UserProfile> {
        let key = keys::profile(pubkey);
        if let Some(p) = self.cache.get::<UserProfile>(&key, Some(PROFILE_TTL)) {
            return Some(p);
        }
        let filter = Filter::new()
            .kinds([kinds::METADATA])
            .authors([pubkey])
            .limit(1);
        let events = match self.source.fetch_events(&filter).await {
            Ok(events) => events,
            Err(e) => {
                warn!(%pubkey, "profile fetch failed: {e}");
                return None;
            }
        };
        let newest = events.iter().max_by_key(|e| e.created_at)?;
        let profile = UserProfile::from_metadata(&newest.content)?;
        debug!(%pubkey, "profile fetched");
        if let Err(e) = self.cache.set(&key, &profile) {
            warn!(%pubkey, "caching profile failed: {e}");
        }
        Some(profile)
    }

    /// Profiles for several keys, each looked up once.
    pub async fn profiles<'a>(
        &self,
        pubkeys: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, UserProfile> {
        let mut out = HashMap::new();
        for pk in pubkeys {
            if out.contains_key(pk) {
                continue;
            }
            if let Some(p) = self.profile(pk).await {
                out.insert(pk.to_string(), p);
            }
        }
        out
    }

    pub async fn attach_to_recommendations(&self, recs: &mut [Recommendation]) {
        let keys: Vec<String> = recs.iter().map(|r| r.pubkey.clone()).collect();
        let found = self.profiles(keys.iter().map(String::as_str)).await;
        for r in recs {
            r.profile = found.get(&r.pubkey).cloned();
        }
    }

    pub async fn attach_to_comments(&self, comments: &mut [Comment]) {
        let keys: Vec<String> = comments.iter().map(|c| c.pubkey.clone()).collect();
        let found = self.profiles(keys.iter().map(String::as_str)).await;
        for c in comments {
            c.profile = found.get(&c.pubkey).cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Event, source::tests::MemorySource};
    use std::{sync::atomic::Ordering, time::Duration};
    use tempfile::TempDir;

    fn metadata(id: &str, created_at: u64, name: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: "alice".into(),
            kind: kinds::METADATA,
            created_at,
            tags: vec![],
            content: format!(r#"{{"name":"{name}"}}"#),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn newest_profile_is_cached() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), Duration::from_secs(60));
        let source = Arc::new(MemorySource::new(vec![
            metadata("m1", 1, "old"),
            metadata("m2", 2, "new"),
        ]));
        let profiles = ProfileDirectory::new(source.clone(), cache);
        // Relays answer newest first.
        source.events.lock().reverse();
        let p = profiles.profile("alice").await.unwrap();
        assert_eq!(p.name.as_deref(), Some("new"));
        let before = source.fetches.load(Ordering::SeqCst);
        assert_eq!(profiles.profile("alice").await, Some(p));
        assert_eq!(source.fetches.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn unknown_or_unreachable_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), Duration::from_secs(60));
        let source = Arc::new(MemorySource::default());
        let profiles = ProfileDirectory::new(source.clone(), cache);
        assert!(profiles.profile("bob").await.is_none());
        source.set_failing(true);
        assert!(profiles.profile("bob").await.is_none());
    }
}
