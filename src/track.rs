//! # Track Records
//!
//! The catalog record as delivered by the ingestion collaborator, and the
//! small helpers that interpret its loosely-typed fields (years that arrive
//! as strings, hook positions written as `mm:ss`).

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// One credited artist. Provider records carry more fields (ids, roles,
/// images); only the name matters for recommendations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
}

impl Artist {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Artist role lists of a track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCredits {
    #[serde(default)]
    pub primary: Vec<Artist>,
    #[serde(default)]
    pub featured: Vec<Artist>,
    #[serde(default)]
    pub all: Vec<Artist>,
}

impl ArtistCredits {
    /// Credits with only primary artists.
    pub fn primary<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary: names.into_iter().map(Artist::new).collect(),
            ..Self::default()
        }
    }

    /// Union of every credited name across all roles, deduplicated.
    ///
    /// Sorted so the result does not depend on the order roles were listed in.
    pub fn unique_names(&self) -> Vec<&str> {
        self.primary
            .iter()
            .chain(&self.featured)
            .chain(&self.all)
            .map(|artist| artist.name.trim())
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A catalog track. Read-only to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "TrackRecord")]
pub struct Track {
    pub id: String,
    pub artists: ArtistCredits,
    pub language: String,
    pub label: String,
    pub year: Option<u16>,
    #[serde(rename = "type")]
    pub kind: String,
    pub duration_secs: Option<f64>,
    pub popularity: u64,
    pub stream_url: String,
    /// Hook position as a fraction of the duration, if the hook collaborator
    /// reported one directly.
    pub hook_ratio: Option<f64>,
    /// Hook position as `mm:ss`, the hook collaborator's native format.
    pub prime_hook: Option<String>,
}

/// Hook marks as written by the hook collaborator under `hook`.
#[derive(Debug, Default, Deserialize)]
struct HookMarks {
    #[serde(default)]
    primehook: Option<String>,
}

/// Wire shape of a track. Accepts both the flat form this crate writes and
/// the provider form with a nested `hook` object and a `downloadUrl` list.
#[derive(Debug, Default, Deserialize)]
struct TrackRecord {
    id: String,
    #[serde(default)]
    artists: ArtistCredits,
    #[serde(default)]
    language: String,
    #[serde(default)]
    label: String,
    #[serde(default, deserialize_with = "lenient_year")]
    year: Option<u16>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, alias = "duration")]
    duration_secs: Option<f64>,
    #[serde(default, alias = "playCount")]
    popularity: u64,
    #[serde(default, alias = "streamUrl")]
    stream_url: String,
    #[serde(default, rename = "downloadUrl", deserialize_with = "download_links")]
    download_links: Vec<String>,
    #[serde(default)]
    hook_ratio: Option<f64>,
    #[serde(default, alias = "primehook")]
    prime_hook: Option<String>,
    #[serde(default)]
    hook: Option<HookMarks>,
}

impl From<TrackRecord> for Track {
    fn from(record: TrackRecord) -> Self {
        let prime_hook = record
            .prime_hook
            .or_else(|| record.hook.and_then(|marks| marks.primehook))
            .filter(|stamp| !stamp.trim().is_empty());

        // Providers list download links in ascending quality.
        let stream_url = if record.stream_url.is_empty() {
            record.download_links.into_iter().last().unwrap_or_default()
        } else {
            record.stream_url
        };

        Self {
            id: record.id,
            artists: record.artists,
            language: record.language,
            label: record.label,
            year: record.year,
            kind: record.kind,
            duration_secs: record.duration_secs,
            popularity: record.popularity,
            stream_url,
            hook_ratio: record.hook_ratio,
            prime_hook,
        }
    }
}

impl Track {
    /// Language key used for filtering and preference scores.
    pub fn language_key(&self) -> Option<String> {
        language_key(&self.language)
    }
}

/// Normalise a language name into the key used by filters and scores.
/// Blank names have no key.
pub fn language_key(language: &str) -> Option<String> {
    let key = language.trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

/// Parse a `mm:ss` (or `hh:mm:ss`) timestamp into seconds.
///
/// Returns `None` for anything malformed.
pub fn parse_timestamp(stamp: &str) -> Option<f64> {
    let parts: Vec<&str> = stamp.trim().split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }

    let mut seconds = 0.0;
    for part in parts {
        let value: u32 = part.trim().parse().ok()?;
        seconds = seconds * 60.0 + f64::from(value);
    }
    Some(seconds)
}

/// Providers send the year either as a number or as a string.
fn lenient_year<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `downloadUrl` is a list of `{quality, url}` entries, bare strings, or a
/// single string. Entries without a url are dropped.
fn download_links<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn link(value: serde_json::Value) -> Option<String> {
        let url = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Object(mut entry) => match entry.remove("url") {
                Some(serde_json::Value::String(s)) => s,
                _ => return None,
            },
            _ => return None,
        };
        let url = url.trim().to_string();
        (!url.is_empty()).then_some(url)
    }

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Array(entries)) => entries.into_iter().filter_map(link).collect(),
        Some(other) => link(other).into_iter().collect(),
        None => Vec::new(),
    })
}
