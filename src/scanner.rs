//! Topic scanner: annotates topic links with a thumbnail or a placeholder.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};
use url::Url;

use crate::cache::ImageCache;
use crate::dom::{Document, NodeId};
use crate::error::PreviewError;
use crate::queue::{PrefetchQueue, QueueItem};
use crate::render::{self, Placeholder};
use crate::selector::PageRules;
use crate::topic::TopicId;

/// Read-only inputs shared by every annotation in one pass.
pub struct ScanContext<'a> {
    pub rules: &'a PageRules,
    pub base: Option<&'a Url>,
    pub initial: &'a HashMap<TopicId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Skipped,
    Thumbnail {
        topic: TopicId,
        container: NodeId,
        image_url: String,
    },
    NoImages(TopicId),
    Loading(TopicId),
    NoId,
}

/// Unannotated topic links that sit inside a topic cell.
pub fn pending_links(doc: &Document, rules: &PageRules) -> Vec<NodeId> {
    doc.query_all(doc.root(), &rules.topic_link)
        .into_iter()
        .filter(|&link| !render::is_processed(doc, link))
        .filter(|&link| {
            doc.parent(link)
                .and_then(|parent| doc.closest(parent, &rules.topic_cell))
                .is_some()
        })
        .collect()
}

/// Full pass over the page.
pub fn scan(
    doc: &mut Document,
    ctx: &ScanContext<'_>,
    cache: &ImageCache,
    queue: &mut PrefetchQueue,
    now: Instant,
) -> Vec<Annotation> {
    let mut out = Vec::new();
    for link in pending_links(doc, ctx.rules) {
        let is_topic = doc.closest(link, &ctx.rules.topic_row).is_some()
            && doc.attr(link, "href").is_some_and(|href| href.contains("/t/"));
        if is_topic {
            out.push(annotate_link(doc, link, ctx, cache, queue, now));
        } else {
            render::mark_processed(doc, link);
        }
    }
    debug!(annotated = out.len(), queued = queue.len(), "scan complete");
    out
}

pub fn annotate_link(
    doc: &mut Document,
    link: NodeId,
    ctx: &ScanContext<'_>,
    cache: &ImageCache,
    queue: &mut PrefetchQueue,
    now: Instant,
) -> Annotation {
    if render::is_processed(doc, link) {
        return Annotation::Skipped;
    }
    let Some(href) = doc.attr(link, "href").map(str::to_string) else {
        return Annotation::Skipped;
    };
    let row = doc.closest(link, &ctx.rules.topic_row);
    let cell = doc.closest(link, &ctx.rules.topic_cell);
    let (Some(row), Some(cell)) = (row, cell) else {
        render::mark_processed(doc, link);
        return Annotation::Skipped;
    };
    if render::settled_container_in(doc, row).is_some() {
        render::mark_processed(doc, link);
        return Annotation::Skipped;
    }

    let topic_url = absolute(ctx.base, &href);
    render::mark_processed(doc, link);
    let Some(topic) = TopicId::from_url(&topic_url) else {
        warn!("{}", PreviewError::NotFound(topic_url));
        render::add_placeholder(doc, row, cell, Placeholder::NoId, None, None);
        return Annotation::NoId;
    };

    if let Some(image_url) = ctx.initial.get(&topic) {
        cache.set_hint(&topic, image_url);
        return place_thumbnail(doc, row, cell, topic, &topic_url, image_url.clone());
    }
    match cache.get(&topic) {
        Some([first, ..]) => {
            let first = first.clone();
            return place_thumbnail(doc, row, cell, topic, &topic_url, first);
        }
        Some([]) => {
            render::add_placeholder(
                doc,
                row,
                cell,
                Placeholder::NoImages,
                Some(&topic),
                Some(&topic_url),
            );
            return Annotation::NoImages(topic);
        }
        None => {}
    }
    if let Some(hint) = cache.get_hint(&topic) {
        return place_thumbnail(doc, row, cell, topic, &topic_url, hint);
    }

    render::add_placeholder(
        doc,
        row,
        cell,
        Placeholder::Loading,
        Some(&topic),
        Some(&topic_url),
    );
    queue.enqueue(
        QueueItem {
            topic: topic.clone(),
            topic_url,
        },
        now,
    );
    Annotation::Loading(topic)
}

fn place_thumbnail(
    doc: &mut Document,
    row: NodeId,
    cell: NodeId,
    topic: TopicId,
    topic_url: &str,
    image_url: String,
) -> Annotation {
    if let Some(stale) = render::container_for(doc, row, &topic).filter(|&n| render::is_loading(doc, n)) {
        doc.remove(stale);
    }
    let container = render::thumbnail(doc, &topic, topic_url, &image_url);
    if !render::insert_into_cell(doc, row, cell, container) {
        return Annotation::Skipped;
    }
    Annotation::Thumbnail {
        topic,
        container,
        image_url,
    }
}

fn absolute(base: Option<&Url>, href: &str) -> String {
    match base.map(|base| base.join(href)) {
        Some(Ok(url)) => url.to_string(),
        _ => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::html;
    use crate::queue::DrainState;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(48 * 3600);

    fn rules() -> PageRules {
        PageRules::compile(&SelectorConfig::default()).unwrap()
    }

    fn listing() -> Document {
        html::parse(
            r#"<html><body><div id="main-outlet"><table>
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/first/1">First</a></td></tr>
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/second/2">Second</a></td></tr>
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/third/3">Third</a></td></tr>
              <tr><td class="main-link"><a class="raw-topic-link" href="/latest">Not a topic</a></td></tr>
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/no-number">Broken</a></td></tr>
            </table></div></body></html>"#,
        )
    }

    #[test]
    fn scan_annotates_every_row_once() {
        let rules = rules();
        let base = Url::parse("https://forum.example/latest").unwrap();
        let mut initial = HashMap::new();
        initial.insert(TopicId::from_number(1), "https://forum.example/i/1.png".to_string());
        let ctx = ScanContext {
            rules: &rules,
            base: Some(&base),
            initial: &initial,
        };
        let mut cache = ImageCache::new(None, TTL);
        cache.put(TopicId::from_number(2), Vec::new());
        let mut queue = PrefetchQueue::new(Duration::from_millis(100), Duration::from_millis(700));
        let mut doc = listing();
        let now = Instant::now();

        let result = scan(&mut doc, &ctx, &cache, &mut queue, now);
        assert!(matches!(result[0], Annotation::Thumbnail { ref image_url, .. } if image_url == "https://forum.example/i/1.png"));
        assert_eq!(result[1], Annotation::NoImages(TopicId::from_number(2)));
        assert_eq!(result[2], Annotation::Loading(TopicId::from_number(3)));
        assert_eq!(result[3], Annotation::NoId);
        assert_eq!(result.len(), 4);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state(), DrainState::Idle);
        assert!(render::loading_container_for(&doc, &TopicId::from_number(3)).is_some());

        assert!(pending_links(&doc, &rules).is_empty());
        assert!(scan(&mut doc, &ctx, &cache, &mut queue, now).is_empty());
    }

    #[test]
    fn rescan_after_marker_reset_keeps_one_preview_per_row() {
        let rules = rules();
        let initial = HashMap::new();
        let ctx = ScanContext {
            rules: &rules,
            base: None,
            initial: &initial,
        };
        let cache = ImageCache::new(None, TTL);
        let mut queue = PrefetchQueue::new(Duration::from_millis(100), Duration::from_millis(700));
        let mut doc = listing();
        let now = Instant::now();
        scan(&mut doc, &ctx, &cache, &mut queue, now);
        for link in doc.query_all(doc.root(), &rules.topic_link) {
            doc.remove_attr(link, render::PROCESSED_ATTR);
        }
        scan(&mut doc, &ctx, &cache, &mut queue, now);

        let containers = doc
            .descendants(doc.root())
            .into_iter()
            .filter(|&n| render::is_container(&doc, n))
            .count();
        assert_eq!(containers, 4);
        assert_eq!(queue.len(), 3);
    }
}
