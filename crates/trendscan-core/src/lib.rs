//! Core domain model for trendscan: enriched video records, thumbnail state,
//! count coercion and the ranking key.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Display sentinel for any value the provider did not supply.
pub const NOT_AVAILABLE: &str = "N/A";

pub const MIN_RESULTS: usize = 5;
pub const MAX_RESULTS: usize = 20;

/// Force a requested result count into the supported `[5, 20]` window.
pub fn clamp_result_count(requested: usize) -> usize {
    requested.clamp(MIN_RESULTS, MAX_RESULTS)
}

/// Split a comma-separated keyword string, trimming entries and dropping blanks.
pub fn parse_keywords(input: &str) -> Vec<String> {
    normalize_keywords(input.split(','))
}

pub fn normalize_keywords<I, S>(keywords: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keywords
        .into_iter()
        .map(|k| k.as_ref().trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Render seconds as `HH:MM:SS` when at least an hour long, otherwise `MM:SS`.
pub fn format_duration(seconds: Option<u64>) -> String {
    let Some(seconds) = seconds else {
        return NOT_AVAILABLE.to_string();
    };
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// Lightweight search hit returned before enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchCandidate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl SearchCandidate {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            link: Some(link.into()),
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(NOT_AVAILABLE)
    }
}

/// Raw metadata bundle as returned by the detail provider.
///
/// Numeric fields stay untyped JSON so malformed upstream values can be
/// coerced instead of failing the whole lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawVideoDetails {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub view_count: Option<JsonValue>,
    #[serde(default)]
    pub like_count: Option<JsonValue>,
    #[serde(default)]
    pub comment_count: Option<JsonValue>,
    #[serde(default)]
    pub duration: Option<JsonValue>,
    #[serde(default)]
    pub upload_date: Option<JsonValue>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// Lifecycle of a record's thumbnail: a remote URL until the download phase
/// resolves it to a path under the static root, or to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Thumbnail {
    Remote(String),
    Local(String),
    Absent,
}

impl Thumbnail {
    /// The remote URL, if it is one the image fetcher can actually request.
    pub fn usable_remote_url(&self) -> Option<&str> {
        match self {
            Thumbnail::Remote(url) => {
                let url = url.trim();
                let lower = url.to_ascii_lowercase();
                if lower.starts_with("http://") || lower.starts_with("https://") {
                    Some(url)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn local_path(&self) -> Option<&str> {
        match self {
            Thumbnail::Local(path) if !path.trim().is_empty() => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Thumbnail::Remote(_))
    }
}

impl From<Option<String>> for Thumbnail {
    fn from(local: Option<String>) -> Self {
        local.map_or(Thumbnail::Absent, Thumbnail::Local)
    }
}

/// One search result after enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub title: String,
    pub url: String,
    pub channel_name: String,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub duration_seconds: Option<u64>,
    pub upload_timestamp: Option<DateTime<Utc>>,
    pub formatted_date: String,
    pub thumbnail: Thumbnail,
}

impl VideoRecord {
    /// Normalize a provider bundle. This is the only place counts, dates and
    /// text defaults are coerced.
    pub fn from_details(url: impl Into<String>, details: RawVideoDetails) -> Self {
        let upload_date = details
            .upload_date
            .as_ref()
            .and_then(upload_date_text)
            .and_then(|text| parse_upload_date(&text));

        let channel_name = details
            .uploader
            .or(details.channel)
            .and_then(non_blank)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        Self {
            title: details
                .title
                .and_then(non_blank)
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            url: url.into(),
            channel_name,
            views: coerce_count(details.view_count.as_ref()),
            likes: coerce_count(details.like_count.as_ref()),
            comments: coerce_count(details.comment_count.as_ref()),
            duration_seconds: coerce_seconds(details.duration.as_ref()),
            upload_timestamp: upload_date
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc()),
            formatted_date: upload_date
                .map(|d| d.format("%d/%m/%Y").to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            thumbnail: details
                .thumbnail
                .and_then(non_blank)
                .map_or(Thumbnail::Absent, Thumbnail::Remote),
        }
    }

    /// `views + 2*likes + 3*comments`, always derived from the current counts.
    pub fn engagement_score(&self) -> u64 {
        self.views
            .saturating_add(self.likes.saturating_mul(2))
            .saturating_add(self.comments.saturating_mul(3))
    }

    /// Freshness first, engagement second; a missing upload date is the oldest.
    pub fn rank_key(&self) -> (Option<DateTime<Utc>>, u64) {
        (self.upload_timestamp, self.engagement_score())
    }

    pub fn video_id(&self) -> String {
        video_id_from_url(&self.url)
    }
}

/// Descending composite order used for ranking.
pub fn compare_rank(a: &VideoRecord, b: &VideoRecord) -> Ordering {
    b.rank_key().cmp(&a.rank_key())
}

/// Stable in-place sort, newest and most engaged first.
pub fn rank_records(records: &mut [VideoRecord]) {
    records.sort_by(compare_rank);
}

/// Coerce a possibly missing or malformed count into a non-negative integer.
pub fn coerce_count(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|v| v.max(0) as u64)
            .unwrap_or(0),
        _ => 0,
    }
}

fn coerce_seconds(value: Option<&JsonValue>) -> Option<u64> {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Some(JsonValue::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn upload_date_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => n.as_u64().map(|v| v.to_string()),
        _ => None,
    }
}

/// Parse the provider's fixed `YYYYMMDD` form.
pub fn parse_upload_date(text: &str) -> Option<NaiveDate> {
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y%m%d").ok()
}

/// Best-effort video identifier used for stable thumbnail file names.
pub fn video_id_from_url(url: &str) -> String {
    let raw = match url.split_once("v=") {
        Some((_, rest)) => rest.split('&').next().unwrap_or_default(),
        None => url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split(['?', '#'])
            .next()
            .unwrap_or_default(),
    };
    let id = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>();
    if id.is_empty() {
        "video".to_string()
    } else {
        id
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
