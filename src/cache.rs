//! Two-tier resolved-image cache.
//!
//! The memory tier maps a topic to its full image list. A missing entry
//! means "not checked yet"; an empty list means "checked, nothing found".
//! The persistent tier only remembers the first image of each topic, with a
//! timestamp, so the first thumbnail can be drawn immediately on the next
//! page load. It is best effort: without a store every persistent operation
//! is a no-op, and storage failures are logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PreviewError;
use crate::storage::Store;
use crate::topic::TopicId;

pub const HINT_RECORD_KEY: &str = "thumb_url_cache_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintRecord {
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

type HintMap = HashMap<String, HintRecord>;

pub struct ImageCache {
    resolved: HashMap<TopicId, Vec<String>>,
    store: Option<Arc<Store>>,
    ttl: Duration,
}

impl ImageCache {
    pub fn new(store: Option<Arc<Store>>, ttl: Duration) -> Self {
        if store.is_none() {
            debug!("{}; using memory tier only", PreviewError::StorageUnavailable);
        }
        Self {
            resolved: HashMap::new(),
            store,
            ttl,
        }
    }

    pub fn get(&self, topic: &TopicId) -> Option<&[String]> {
        self.resolved.get(topic).map(Vec::as_slice)
    }

    pub fn contains(&self, topic: &TopicId) -> bool {
        self.resolved.contains_key(topic)
    }

    /// Records the resolved list and seeds the hint tier with its first URL.
    pub fn put(&mut self, topic: TopicId, images: Vec<String>) {
        if let Some(first) = images.first() {
            self.set_hint(&topic, first);
        }
        self.resolved.insert(topic, images);
    }

    /// First-image hint, honouring the TTL. Expired hints are removed from
    /// the persistent record as a side effect.
    pub fn get_hint(&self, topic: &TopicId) -> Option<String> {
        let store = self.store.as_ref()?;
        match self.read_hint(store, topic) {
            Ok(url) => url,
            Err(err) => {
                warn!(topic = %topic, "hint read failed: {err:?}");
                None
            }
        }
    }

    pub fn set_hint(&self, topic: &TopicId, url: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if url.is_empty() {
            return;
        }
        // An unreadable record is replaced rather than blocking every write.
        let mut hints = read_hints(store).unwrap_or_else(|err| {
            warn!("hint record unreadable, starting over: {err:?}");
            HintMap::new()
        });
        hints.insert(
            topic.as_str().to_string(),
            HintRecord {
                url: url.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        if let Err(err) = write_hints(store, &hints) {
            warn!(topic = %topic, "hint write failed: {err:?}");
        }
    }

    fn read_hint(&self, store: &Store, topic: &TopicId) -> Result<Option<String>> {
        let mut hints = read_hints(store)?;
        let Some(record) = hints.get(topic.as_str()) else {
            return Ok(None);
        };
        let age_ms = Utc::now().timestamp_millis() - record.timestamp;
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        if !record.url.is_empty() && age_ms < ttl_ms {
            return Ok(Some(record.url.clone()));
        }
        debug!(topic = %topic, age_ms, "dropping expired hint");
        hints.remove(topic.as_str());
        if let Err(err) = write_hints(store, &hints) {
            warn!(topic = %topic, "hint cleanup failed: {err:?}");
        }
        Ok(None)
    }
}

fn read_hints(store: &Store) -> Result<HintMap> {
    match store.get_value(HINT_RECORD_KEY)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|_| PreviewError::ParseFailed(HINT_RECORD_KEY.to_string()))
            .context("cache: decode hint record"),
        None => Ok(HintMap::new()),
    }
}

/// An empty map deletes the record instead of storing `{}`.
fn write_hints(store: &Store, hints: &HintMap) -> Result<()> {
    if hints.is_empty() {
        return store.delete_value(HINT_RECORD_KEY);
    }
    let raw = serde_json::to_string(hints).context("cache: encode hint record")?;
    store.put_value(HINT_RECORD_KEY, &raw)
}
