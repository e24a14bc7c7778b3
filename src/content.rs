//! Mint metadata: parsing announcement content and normalizing `/v1/info`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

/// Description used when a mint's info endpoint omits one.
pub const NO_DESCRIPTION: &str = "No description available";
/// Description of the placeholder record used after fetching failed.
pub const UNREACHABLE_DESCRIPTION: &str = "Could not fetch mint information";
/// Version used when a mint does not report one.
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Contact channel advertised by a mint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub method: String,
    pub info: String,
}

/// Mint metadata, either parsed from an announcement or fetched over HTTP.
///
/// Every field is optional because announcements carry arbitrary subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MintInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_long: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default)]
    pub nuts: Map<String, Value>,
}

impl MintInfo {
    /// Record used when the info endpoint stayed unreachable.
    pub fn placeholder(mint_url: &str) -> Self {
        MintInfo {
            name: Some(hostname_of(mint_url)),
            description: Some(UNREACHABLE_DESCRIPTION.into()),
            version: Some(UNKNOWN_VERSION.into()),
            ..Default::default()
        }
    }

    /// Version text before any `/`, e.g. `nutshell` for `Nutshell/0.16.0`.
    pub fn base_version(&self) -> Option<&str> {
        self.version
            .as_deref()
            .and_then(|v| v.split('/').next())
            .filter(|v| !v.is_empty())
    }
}

/// Extract metadata from announcement content.
///
/// JSON objects yield their `name`, `description`, `version`, `motd`,
/// `nuts` and `contact` fields. Anything else becomes the description verbatim.
pub fn parse_mint_content(content: &str) -> MintInfo {
    if content.trim().starts_with('{') {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
            return MintInfo {
                name: string_field(&obj, "name"),
                description: string_field(&obj, "description"),
                version: string_field(&obj, "version"),
                motd: string_field(&obj, "motd"),
                contact: obj.get("contact").map(contacts).unwrap_or_default(),
                nuts: nuts_field(&obj),
                ..Default::default()
            };
        }
    }
    if content.is_empty() {
        return MintInfo::default();
    }
    MintInfo {
        description: Some(content.to_string()),
        ..Default::default()
    }
}

/// Build a complete record from a raw `/v1/info` response, filling defaults.
///
/// Schema problems are logged and the data kept.
pub fn normalize_info(raw: &Value, mint_url: &str) -> MintInfo {
    for issue in validate_info(raw) {
        warn!(mint = %mint_url, "mint info schema issue: {issue}");
    }
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);
    MintInfo {
        name: string_field(obj, "name").or_else(|| Some(hostname_of(mint_url))),
        pubkey: string_field(obj, "pubkey"),
        version: string_field(obj, "version").or_else(|| Some(UNKNOWN_VERSION.into())),
        description: string_field(obj, "description").or_else(|| Some(NO_DESCRIPTION.into())),
        description_long: string_field(obj, "description_long"),
        contact: obj.get("contact").map(contacts).unwrap_or_default(),
        motd: string_field(obj, "motd"),
        icon_url: string_field(obj, "icon_url"),
        urls: obj
            .get("urls")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|u| u.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        time: obj.get("time").and_then(Value::as_u64),
        nuts: nuts_field(obj),
    }
}

/// Problems a strict reader would reject in a `/v1/info` response.
pub fn validate_info(raw: &Value) -> Vec<String> {
    let Some(obj) = raw.as_object() else {
        return vec!["response is not a JSON object".into()];
    };
    let mut issues = vec![];
    for key in ["name", "pubkey", "version", "description", "description_long", "motd"] {
        match obj.get(key) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => issues.push(format!("`{key}` is not a string")),
        }
    }
    if let Some(icon) = obj.get("icon_url").and_then(Value::as_str) {
        if Url::parse(icon).is_err() {
            issues.push(format!("`icon_url` is not a URL: {icon}"));
        }
    }
    if let Some(urls) = obj.get("urls").and_then(Value::as_array) {
        for u in urls {
            if u.as_str().map_or(true, |s| Url::parse(s).is_err()) {
                issues.push(format!("`urls` entry is not a URL: {u}"));
            }
        }
    }
    match obj.get("nuts") {
        None | Some(Value::Null) => {}
        Some(Value::Object(nuts)) => {
            for (nut, val) in nuts {
                if !val.is_object() {
                    issues.push(format!("nut {nut} is not an object"));
                }
            }
        }
        Some(_) => issues.push("`nuts` is not an object".into()),
    }
    issues
}

/// Host part of a mint URL, or the text before the first `/` without a scheme.
pub fn hostname_of(url: &str) -> String {
    if let Some(host) = Url::parse(url).ok().as_ref().and_then(Url::host_str) {
        return host.to_string();
    }
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    rest.split('/').next().unwrap_or(rest).to_string()
}

/// `/v1/info` endpoint for a mint base URL.
pub fn info_url(mint_url: &str) -> String {
    let base = mint_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1/info").unwrap_or(base);
    format!("{}/v1/info", base.trim_end_matches('/'))
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn nuts_field(obj: &Map<String, Value>) -> Map<String, Value> {
    match obj.get("nuts") {
        Some(Value::Object(nuts)) => nuts.clone(),
        _ => Map::new(),
    }
}

/// Accept `[method, info]` pairs or `{method, info}` objects; drop empty info.
fn contacts(val: &Value) -> Vec<Contact> {
    let Some(entries) = val.as_array() else {
        return vec![];
    };
    entries
        .iter()
        .filter_map(|entry| {
            let (method, info) = match entry {
                Value::Array(pair) => (pair.first()?.as_str()?, pair.get(1)?.as_str()?),
                Value::Object(obj) => (obj.get("method")?.as_str()?, obj.get("info")?.as_str()?),
                _ => return None,
            };
            (!info.is_empty()).then(|| Contact {
                method: method.to_string(),
                info: info.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_content_with_tuple_contacts() {
        let info = parse_mint_content(
            r#"{"name":"A","motd":"maintenance at noon","contact":[["email","a@b.com"],["nostr",""]]}"#,
        );
        assert_eq!(info.name.as_deref(), Some("A"));
        assert_eq!(info.motd.as_deref(), Some("maintenance at noon"));
        assert_eq!(
            info.contact,
            vec![Contact {
                method: "email".into(),
                info: "a@b.com".into()
            }]
        );
        assert!(info.nuts.is_empty());
    }

    #[test]
    fn object_contacts_and_bad_nuts() {
        let info = parse_mint_content(
            r#"{"description":"d","nuts":[1,2],"contact":[{"method":"twitter","info":"@m"}]}"#,
        );
        assert_eq!(info.description.as_deref(), Some("d"));
        assert_eq!(info.contact[0].method, "twitter");
        assert!(info.nuts.is_empty());
    }

    #[test]
    fn plain_text_and_broken_json_become_description() {
        assert_eq!(
            parse_mint_content("hello world").description.as_deref(),
            Some("hello world")
        );
        let broken = parse_mint_content("{\"name\": ");
        assert_eq!(broken.description.as_deref(), Some("{\"name\": "));
        assert!(broken.name.is_none());
        assert_eq!(parse_mint_content(""), MintInfo::default());
    }

    #[test]
    fn normalization_fills_defaults() {
        let raw = json!({"name": null, "nuts": {"4": {"methods": []}}, "icon_url": "not a url"});
        let info = normalize_info(&raw, "https://mint.example.com/Bitcoin");
        assert_eq!(info.name.as_deref(), Some("mint.example.com"));
        assert_eq!(info.description.as_deref(), Some(NO_DESCRIPTION));
        assert_eq!(info.version.as_deref(), Some(UNKNOWN_VERSION));
        // Invalid icon is reported but kept.
        assert_eq!(info.icon_url.as_deref(), Some("not a url"));
        assert_eq!(validate_info(&raw).len(), 1);
        assert!(info.nuts.contains_key("4"));
    }

    #[test]
    fn url_helpers() {
        assert_eq!(info_url("https://m.io/"), "https://m.io/v1/info");
        assert_eq!(info_url("https://m.io/v1/info"), "https://m.io/v1/info");
        assert_eq!(hostname_of("https://m.io:3338/x"), "m.io");
        assert_eq!(hostname_of("m.io/path"), "m.io");
        let placeholder = MintInfo::placeholder("https://m.io");
        assert_eq!(placeholder.description.as_deref(), Some(UNREACHABLE_DESCRIPTION));
        let v = MintInfo {
            version: Some("Nutshell/0.16.0".into()),
            ..Default::default()
        };
        assert_eq!(v.base_version(), Some("Nutshell"));
    }
}
