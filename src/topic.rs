use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dom::{Document, NodeId};
use crate::selector::PageRules;

static TOPIC_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/t/(?:[^/?#]+/)?(\d+)(?:[/?#]|$)").expect("valid topic id regex")
});

/// Canonical key of one discussion topic, `t<digits>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    /// `None` is the terminal "no id" state: callers render it as an
    /// unavailable placeholder and never retry.
    pub fn from_url(url: &str) -> Option<Self> {
        TOPIC_ID_RE
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| Self(format!("t{}", m.as_str())))
    }

    pub fn from_number(id: u64) -> Self {
        Self(format!("t{id}"))
    }

    /// Accepts keys previously produced by [`TopicId::as_str`].
    pub fn from_key(key: &str) -> Option<Self> {
        let digits = key.strip_prefix('t')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Title and author shown in the gallery and used for download names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDetails {
    pub title: String,
    pub author: String,
}

impl Default for RowDetails {
    fn default() -> Self {
        Self {
            title: "Topic".into(),
            author: "User".into(),
        }
    }
}

impl RowDetails {
    pub fn from_row(doc: &Document, row: NodeId, rules: &PageRules) -> Self {
        let title = doc
            .query(row, &rules.topic_link)
            .map(|link| doc.text_content(link).trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown Topic".to_string());
        let author = doc
            .query(row, &rules.avatar_image)
            .and_then(|avatar| doc.attr(avatar, "title"))
            .and_then(|t| t.split(" - ").next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("User")
            .to_string();
        Self { title, author }
    }
}
