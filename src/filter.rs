//! Subscription filters in the NIP-01 shape.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter parameters used when building a `REQ` subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Tag filters keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of events requested.
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Add a `#<name>` filter.
    pub fn tag<S: Into<String>>(mut self, name: &str, values: impl IntoIterator<Item = S>) -> Self {
        let name = name.trim_start_matches('#').to_string();
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Convert into the JSON object sent inside `REQ` messages.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(authors) = &self.authors {
            if !authors.is_empty() {
                map.insert(
                    "authors".into(),
                    Value::Array(authors.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() {
                map.insert(
                    "kinds".into(),
                    Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
                );
            }
        }
        for (tag, values) in &self.tags {
            // An empty tag list would match nothing on most relays; leave it out.
            if values.is_empty() {
                continue;
            }
            map.insert(
                format!("#{tag}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }

    /// Build a filter from a JSON object, ignoring fields of the wrong type.
    pub fn from_value(val: &Value) -> Self {
        let strings = |v: &Value| -> Vec<String> {
            v.as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        let authors = val.get("authors").map(strings);
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, values) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    tags.insert(name.to_string(), strings(values));
                }
            }
        }
        Filter {
            kinds,
            authors,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val.get("limit").and_then(|v| v.as_u64()).map(|v| v as u32),
        }
    }

    /// Whether `ev` satisfies every constraint except `limit`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            if !ev.tag_values(tag).any(|v| values.iter().any(|want| want == v)) {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kinds, Tag};

    fn recommendation(created_at: u64) -> Event {
        Event {
            id: "aa11".into(),
            pubkey: "p1".into(),
            kind: kinds::RECOMMENDATION,
            created_at,
            tags: vec![Tag::new(&["k", "38172"]), Tag::new(&["a", "38172:m1"])],
            content: "[5/5]".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn json_shape_matches_nip01() {
        let f = Filter::new()
            .kinds([kinds::RECOMMENDATION])
            .tag("#k", ["38172"])
            .tag("e", Vec::<String>::new())
            .since(5)
            .limit(100);
        let json = Value::Object(f.to_json());
        assert_eq!(
            json,
            serde_json::json!({"kinds": [38000], "#k": ["38172"], "since": 5, "limit": 100})
        );
        assert_eq!(Filter::from_value(&json).tags.get("k").unwrap(), &vec!["38172"]);
    }

    #[test]
    fn matching_honours_tags_and_time() {
        let ev = recommendation(10);
        assert!(Filter::new().kinds([kinds::RECOMMENDATION]).matches(&ev));
        assert!(Filter::new().tag("a", ["38172:m1"]).matches(&ev));
        assert!(!Filter::new().tag("a", ["38172:m2"]).matches(&ev));
        assert!(!Filter::new().since(11).matches(&ev));
        assert!(!Filter::new().until(9).matches(&ev));
        assert!(!Filter::new().authors(["p2"]).matches(&ev));
    }
}
