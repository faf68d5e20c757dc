// src/record.rs
//! Normalized records flowing from source agents into the broker.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::inference::InferenceResult;

/// Identity of an interactive request; never reused.
pub type RequestId = uuid::Uuid;

const MAX_TEXT_CHARS: usize = 1500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: Option<u64>,
    pub shares: Option<u64>,
    pub views: Option<u64>,
    pub comments: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub text: String,
    /// Cashtag form, e.g. `$TSLA`.
    pub ticker: String,
    #[serde(default)]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub engagement: Engagement,
}

impl Record {
    pub fn new(text: &str, ticker: &str) -> Self {
        Self {
            text: normalize_text(text),
            ticker: normalize_ticker(ticker),
            source: String::new(),
            published_at: Utc::now(),
            engagement: Engagement::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = at;
        self
    }

    pub fn with_engagement(mut self, engagement: Engagement) -> Self {
        self.engagement = engagement;
        self
    }

    /// Text and ticker are mandatory for scoring.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(PipelineError::QueueItemError("record has no text".into()));
        }
        if self.ticker.trim_start_matches('$').is_empty() {
            return Err(PipelineError::QueueItemError(
                "record has no ticker".into(),
            ));
        }
        Ok(())
    }
}

/// A unit of work in the broker. Immutable once enqueued.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Interactive {
        request_id: RequestId,
        record: Record,
    },
    Background {
        record: Record,
    },
}

impl WorkItem {
    pub fn lane(&self) -> &'static str {
        match self {
            WorkItem::Interactive { .. } => "interactive",
            WorkItem::Background { .. } => "background",
        }
    }
}

/// What the persistence collaborator receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    #[serde(flatten)]
    pub record: Record,
    pub result: InferenceResult,
}

/// Normalize text: decode entities, strip tags, fold quotes, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// `tsla` -> `$TSLA`; empty stays empty.
pub fn normalize_ticker(s: &str) -> String {
    let sym = s.trim().trim_start_matches('$').to_ascii_uppercase();
    if sym.is_empty() {
        String::new()
    } else {
        format!("${sym}")
    }
}

/// Parse abbreviated engagement counters such as `"1.2K"`, `"3M"` or `"1,204"`.
pub fn parse_count(raw: &str) -> Option<u64> {
    let t = raw.trim().replace(',', "");
    if t.is_empty() {
        return None;
    }
    let (num, mult) = match t.chars().last()? {
        'K' | 'k' => (&t[..t.len() - 1], 1_000f64),
        'M' | 'm' => (&t[..t.len() - 1], 1_000_000f64),
        'B' | 'b' => (&t[..t.len() - 1], 1_000_000_000f64),
        _ => (t.as_str(), 1f64),
    };
    let v: f64 = num.trim().parse().ok()?;
    if v.is_sign_negative() || !v.is_finite() {
        return None;
    }
    Some((v * mult).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_markup_and_ws() {
        let s = "  <b>Hello&nbsp;&nbsp; world</b>  &ldquo;ok&rdquo; ";
        assert_eq!(normalize_text(s), r#"Hello world "ok""#);
    }

    #[test]
    fn normalize_text_caps_length() {
        let long = "a".repeat(2000);
        assert_eq!(normalize_text(&long).chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn ticker_gets_cashtag() {
        assert_eq!(normalize_ticker("tsla"), "$TSLA");
        assert_eq!(normalize_ticker("$nvda "), "$NVDA");
        assert_eq!(normalize_ticker("  "), "");
    }

    #[test]
    fn counts_with_suffixes() {
        assert_eq!(parse_count("1.2K"), Some(1200));
        assert_eq!(parse_count("3M"), Some(3_000_000));
        assert_eq!(parse_count("1,204"), Some(1204));
        assert_eq!(parse_count("n/a"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(Record::new("good stuff", "AAPL").validate().is_ok());
        let e = Record::new("   ", "AAPL").validate().unwrap_err();
        assert_eq!(e.kind(), crate::error::ErrorKind::QueueItemError);
        assert!(Record::new("text", "").validate().is_err());
    }
}
