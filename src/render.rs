//! Thumbnail and placeholder elements inserted into topic rows.

use crate::dom::{Document, NodeId};
use crate::topic::TopicId;

pub const CONTAINER_CLASS: &str = "topic-preview-container";
pub const THUMBNAIL_CLASS: &str = "topic-preview-thumbnail";
pub const PLACEHOLDER_CLASS: &str = "topic-preview-placeholder";
pub const LOADING_CLASS: &str = "topic-preview-loading";

pub const PROCESSED_ATTR: &str = "data-preview-processed";
pub const TOPIC_KEY_ATTR: &str = "data-topic-id-key";
pub const TOPIC_URL_ATTR: &str = "data-topic-url";
pub const CLICKABLE_ATTR: &str = "data-clickable";
pub const NO_ID_KEY: &str = "no-id";

const GALLERY_TITLE: &str = "Open topic image gallery";
const THUMBNAIL_ALT: &str = "Topic Preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Loading,
    NoImages,
    Error,
    NoId,
}

impl Placeholder {
    pub fn symbol(self) -> &'static str {
        match self {
            Placeholder::Loading => "⏳",
            Placeholder::NoImages => "👁️",
            Placeholder::Error => "⚠️",
            Placeholder::NoId => "🚫",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Placeholder::Loading => "⏳",
            Placeholder::NoImages => "No image. Click to open.",
            Placeholder::Error => "Error. Click to try opening.",
            Placeholder::NoId => "Preview unavailable (no ID)",
        }
    }

    fn clickable(self) -> bool {
        matches!(self, Placeholder::NoImages | Placeholder::Error)
    }
}

/// What a click on a preview container opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickTarget {
    pub container: NodeId,
    pub topic: TopicId,
    pub topic_url: String,
}

pub fn thumbnail(doc: &mut Document, topic: &TopicId, topic_url: &str, image_url: &str) -> NodeId {
    let container = doc.create_element("div");
    doc.add_class(container, CONTAINER_CLASS);
    doc.set_attr(container, "title", GALLERY_TITLE);
    doc.set_attr(container, TOPIC_KEY_ATTR, topic.as_str());
    doc.set_attr(container, TOPIC_URL_ATTR, topic_url);
    doc.set_attr(container, CLICKABLE_ATTR, "true");

    let img = doc.create_element("img");
    doc.add_class(img, THUMBNAIL_CLASS);
    doc.set_attr(img, "src", image_url);
    doc.set_attr(img, "loading", "lazy");
    doc.set_attr(img, "alt", THUMBNAIL_ALT);
    doc.append_child(container, img);
    container
}

pub fn placeholder(
    doc: &mut Document,
    kind: Placeholder,
    topic: Option<&TopicId>,
    topic_url: Option<&str>,
) -> NodeId {
    let container = doc.create_element("div");
    doc.add_class(container, CONTAINER_CLASS);
    if kind == Placeholder::Loading {
        doc.add_class(container, LOADING_CLASS);
    }
    doc.set_attr(container, "title", kind.title());
    doc.set_attr(
        container,
        TOPIC_KEY_ATTR,
        topic.map(TopicId::as_str).unwrap_or(NO_ID_KEY),
    );

    let span = doc.create_element("span");
    doc.add_class(span, PLACEHOLDER_CLASS);
    let symbol = doc.create_text(kind.symbol());
    doc.append_child(span, symbol);
    doc.append_child(container, span);

    if let (Some(_), Some(url), true) = (topic, topic_url, kind.clickable()) {
        doc.set_attr(container, TOPIC_URL_ATTR, url);
        doc.set_attr(container, CLICKABLE_ATTR, "true");
    } else {
        doc.set_attr(container, "style", "cursor: default");
    }
    container
}

pub fn is_container(doc: &Document, node: NodeId) -> bool {
    doc.has_class(node, CONTAINER_CLASS)
}

pub fn is_loading(doc: &Document, node: NodeId) -> bool {
    doc.has_class(node, LOADING_CLASS)
}

pub fn container_in(doc: &Document, scope: NodeId) -> Option<NodeId> {
    doc.descendants(scope)
        .into_iter()
        .find(|&node| is_container(doc, node))
}

/// A container that is no longer waiting for its first image.
pub fn settled_container_in(doc: &Document, scope: NodeId) -> Option<NodeId> {
    doc.descendants(scope)
        .into_iter()
        .find(|&node| is_container(doc, node) && !is_loading(doc, node))
}

pub fn container_for(doc: &Document, scope: NodeId, topic: &TopicId) -> Option<NodeId> {
    doc.descendants(scope).into_iter().find(|&node| {
        is_container(doc, node) && doc.attr(node, TOPIC_KEY_ATTR) == Some(topic.as_str())
    })
}

/// The attached loading placeholder waiting on `topic`, if any row still
/// has one. This is the liveness check for queued work.
pub fn loading_container_for(doc: &Document, topic: &TopicId) -> Option<NodeId> {
    doc.descendants(doc.root()).into_iter().find(|&node| {
        is_loading(doc, node) && doc.attr(node, TOPIC_KEY_ATTR) == Some(topic.as_str())
    })
}

/// Inserts `container` as the first child of `cell` unless the row already
/// carries a preview. Returns whether it was inserted.
pub fn insert_into_cell(doc: &mut Document, row: NodeId, cell: NodeId, container: NodeId) -> bool {
    if container_in(doc, row).is_some() {
        return false;
    }
    let first = doc.first_child(cell);
    doc.insert_before(cell, container, first);
    true
}

/// Adds a placeholder to the row the way a fresh annotation would: a settled
/// preview wins, a loading placeholder for the same topic is replaced.
pub fn add_placeholder(
    doc: &mut Document,
    row: NodeId,
    cell: NodeId,
    kind: Placeholder,
    topic: Option<&TopicId>,
    topic_url: Option<&str>,
) -> Option<NodeId> {
    if settled_container_in(doc, row).is_some() {
        return None;
    }
    if let Some(existing) = topic
        .and_then(|topic| container_for(doc, row, topic))
        .filter(|&node| is_loading(doc, node))
    {
        doc.remove(existing);
    }
    let container = placeholder(doc, kind, topic, topic_url);
    insert_into_cell(doc, row, cell, container).then_some(container)
}

pub fn is_processed(doc: &Document, link: NodeId) -> bool {
    doc.attr(link, PROCESSED_ATTR).is_some()
}

pub fn mark_processed(doc: &mut Document, link: NodeId) {
    doc.set_attr(link, PROCESSED_ATTR, "true");
}

pub fn click_target(doc: &Document, node: NodeId) -> Option<ClickTarget> {
    let mut current = Some(node);
    while let Some(candidate) = current {
        if is_container(doc, candidate) {
            if doc.attr(candidate, CLICKABLE_ATTR) != Some("true") {
                return None;
            }
            let topic = doc
                .attr(candidate, TOPIC_KEY_ATTR)
                .and_then(TopicId::from_key)?;
            let topic_url = doc.attr(candidate, TOPIC_URL_ATTR)?.to_string();
            return Some(ClickTarget {
                container: candidate,
                topic,
                topic_url,
            });
        }
        current = doc.parent(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with_cell(doc: &mut Document) -> (NodeId, NodeId) {
        let row = doc.create_element("tr");
        let cell = doc.create_element("td");
        let link = doc.create_element("a");
        doc.append_child(row, cell);
        doc.append_child(cell, link);
        let body = doc.body();
        doc.append_child(body, row);
        (row, cell)
    }

    #[test]
    fn thumbnail_is_clickable_and_first_in_cell() {
        let mut doc = Document::new();
        let (row, cell) = row_with_cell(&mut doc);
        let topic = TopicId::from_number(5);
        let thumb = thumbnail(&mut doc, &topic, "https://f/t/x/5", "https://f/a.png");
        assert!(insert_into_cell(&mut doc, row, cell, thumb));
        assert_eq!(doc.first_child(cell), Some(thumb));
        let target = click_target(&doc, doc.first_child(thumb).unwrap()).unwrap();
        assert_eq!(target.topic, topic);
        assert_eq!(target.topic_url, "https://f/t/x/5");

        let again = thumbnail(&mut doc, &topic, "https://f/t/x/5", "https://f/b.png");
        assert!(!insert_into_cell(&mut doc, row, cell, again));
    }

    #[test]
    fn loading_placeholder_is_replaced_but_settled_preview_wins() {
        let mut doc = Document::new();
        let (row, cell) = row_with_cell(&mut doc);
        let topic = TopicId::from_number(8);
        let loading = add_placeholder(&mut doc, row, cell, Placeholder::Loading, Some(&topic), Some("u"))
            .unwrap();
        assert_eq!(loading_container_for(&doc, &topic), Some(loading));
        assert!(click_target(&doc, loading).is_none());

        let none = add_placeholder(&mut doc, row, cell, Placeholder::NoImages, Some(&topic), Some("u"))
            .unwrap();
        assert!(!doc.is_attached(loading));
        assert_eq!(loading_container_for(&doc, &topic), None);
        assert!(click_target(&doc, none).is_some());

        assert!(add_placeholder(&mut doc, row, cell, Placeholder::Error, Some(&topic), Some("u")).is_none());
    }

    #[test]
    fn no_id_placeholder_is_inert() {
        let mut doc = Document::new();
        let (row, cell) = row_with_cell(&mut doc);
        let node = add_placeholder(&mut doc, row, cell, Placeholder::NoId, None, None).unwrap();
        assert_eq!(doc.attr(node, TOPIC_KEY_ATTR), Some(NO_ID_KEY));
        assert_eq!(doc.attr(node, "title"), Some("Preview unavailable (no ID)"));
        assert!(click_target(&doc, node).is_none());
    }
}
