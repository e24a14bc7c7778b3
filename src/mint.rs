//! Derived records: mints, reviews, comments, profiles and filter summaries.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    content::MintInfo,
    event::{kinds, Event},
    rating::{calculate_rating, RatingSummary},
};

/// Mint aggregated from an announcement and the reviews that reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mint {
    /// `d` tag of the announcement, or its event id.
    pub id: String,
    pub pubkey: String,
    pub url: String,
    /// Capability tags in announcement order.
    pub nuts: Vec<String>,
    pub network: String,
    pub name: String,
    pub description: String,
    pub likes: u32,
    pub dislikes: u32,
    pub rating: f64,
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<MintInfo>,
    /// Milliseconds since the epoch of the last successful info fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<u64>,
}

impl Mint {
    /// Address used by `a` tags, `38172:<id>`.
    pub fn address(&self) -> String {
        format!("{}:{}", kinds::MINT_ANNOUNCEMENT, self.id)
    }

    /// Recompute rating fields from the attached reviews.
    pub fn refresh_rating(&mut self) {
        let RatingSummary {
            likes,
            dislikes,
            rating,
        } = calculate_rating(&self.recommendations);
        self.likes = likes;
        self.dislikes = dislikes;
        self.rating = rating;
    }
}

/// A review of a mint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

impl From<&Event> for Recommendation {
    fn from(ev: &Event) -> Self {
        Recommendation {
            id: ev.id.clone(),
            pubkey: ev.pubkey.clone(),
            content: ev.content.clone(),
            created_at: ev.created_at,
            profile: None,
        }
    }
}

/// Discussion comment; `reply_to` names the parent for replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

impl From<&Event> for Comment {
    fn from(ev: &Event) -> Self {
        Comment {
            id: ev.id.clone(),
            pubkey: ev.pubkey.clone(),
            content: ev.content.clone(),
            created_at: ev.created_at,
            reply_to: ev.tag_value("e").map(str::to_string),
            profile: None,
        }
    }
}

/// Public profile of a key. Never authoritative for identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
}

impl UserProfile {
    /// Parse kind-0 metadata content, accepting both common spellings.
    pub fn from_metadata(content: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(content).ok()?;
        let obj = val.as_object()?;
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(UserProfile {
            name: text(&["name"]),
            display_name: text(&["display_name", "displayName"]),
            image: text(&["picture", "image"]),
            nip05: text(&["nip05"]),
            about: text(&["about"]),
        })
    }

    /// Best label for display.
    pub fn label(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.name.as_deref())
    }
}

const KNOWN_SOFTWARE: [&str; 3] = ["nutshell", "mintd", "cashu.space"];

/// Value sets offered as listing filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaFilters {
    pub networks: BTreeSet<String>,
    pub nuts: BTreeSet<String>,
    pub versions: BTreeSet<String>,
    pub software: BTreeSet<String>,
    pub units_of_account: BTreeSet<String>,
}

impl MetaFilters {
    /// Fold one mint into the summary.
    pub fn absorb(&mut self, mint: &Mint) {
        self.networks.insert(mint.network.clone());
        for nut in &mint.nuts {
            self.nuts.insert(nut.clone());
            if let Some(unit) = nut.strip_prefix("4-").filter(|u| !u.is_empty()) {
                self.units_of_account.insert(unit.to_string());
            }
        }
        let Some(info) = &mint.info else {
            return;
        };
        if let Some(base) = info.base_version() {
            self.versions.insert(base.to_string());
        }
        let declared = info
            .nuts
            .get("1")
            .and_then(|n| n.get("software"))
            .and_then(Value::as_str);
        match declared {
            Some(sw) => {
                self.software.insert(sw.to_string());
            }
            None => {
                if let Some(base) = info.base_version().map(str::to_lowercase) {
                    if KNOWN_SOFTWARE.contains(&base.as_str()) {
                        self.software.insert(base);
                    }
                }
            }
        }
        let methods = info
            .nuts
            .get("4")
            .and_then(|n| n.get("methods"))
            .and_then(Value::as_array);
        for method in methods.into_iter().flatten() {
            if let Some(unit) = method.get("unit").and_then(Value::as_str) {
                self.units_of_account.insert(unit.to_string());
            }
        }
    }

    /// Summary over a whole list.
    pub fn from_mints<'a>(mints: impl IntoIterator<Item = &'a Mint>) -> Self {
        let mut filters = MetaFilters::default();
        for mint in mints {
            filters.absorb(mint);
        }
        filters
    }
}

/// Listing filter applied to the derived mint list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MintQuery {
    pub network: Option<String>,
    pub nut: Option<String>,
    /// Case-insensitive search over name, url and description.
    #[serde(rename = "q")]
    pub search: Option<String>,
}

impl MintQuery {
    pub fn matches(&self, mint: &Mint) -> bool {
        if let Some(net) = self.network.as_deref().filter(|n| !n.is_empty()) {
            if mint.network != net {
                return false;
            }
        }
        if let Some(nut) = self.nut.as_deref().filter(|n| !n.is_empty()) {
            if !mint.nuts.iter().any(|n| n == nut) {
                return false;
            }
        }
        if let Some(q) = self.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            let hit = [&mint.name, &mint.url, &mint.description]
                .iter()
                .any(|field| field.to_lowercase().contains(&q));
            if !hit {
                return false;
            }
        }
        true
    }
}
