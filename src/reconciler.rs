//! Mutation reconciler: keeps the observer anchored and decides how much of
//! the page has to be looked at again after a batch of changes.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::dom::{Document, MutationRecord, NodeId};
use crate::render;
use crate::selector::{PageRules, Selector};

/// Why the observer moved, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retarget {
    Unchanged,
    /// The main-content root showed up while the body was observed.
    Upgraded,
    /// The observed root left the page; whatever replaced it was never seen.
    Replaced,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    observed: Option<NodeId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(&self) -> Option<NodeId> {
        self.observed
    }

    /// Best observation root: the main-content root, else the body.
    pub fn target(doc: &Document, rules: &PageRules) -> NodeId {
        doc.query(doc.root(), &rules.main_outlet)
            .unwrap_or_else(|| doc.body())
    }

    pub fn attach(&mut self, doc: &mut Document, rules: &PageRules) -> NodeId {
        let target = Self::target(doc, rules);
        doc.observe(target);
        self.observed = Some(target);
        info!(
            root = doc.attr(target, "id").or(doc.tag(target)).unwrap_or("?"),
            "observing page mutations"
        );
        target
    }

    pub fn retarget_if_needed(&mut self, doc: &mut Document, rules: &PageRules) -> Retarget {
        let Some(observed) = self.observed else {
            self.attach(doc, rules);
            return Retarget::Replaced;
        };
        if !doc.is_attached(observed) {
            warn!("observed root detached, re-evaluating observer target");
            self.attach(doc, rules);
            return Retarget::Replaced;
        }
        let body = doc.body();
        if observed == body && Self::target(doc, rules) != body {
            self.attach(doc, rules);
            return Retarget::Upgraded;
        }
        Retarget::Unchanged
    }
}

/// A batch is significant when the main-content root itself came or went,
/// or when the batch as a whole added or removed more than `threshold`
/// direct children of the observed root.
pub fn is_significant(
    doc: &Document,
    records: &[MutationRecord],
    observed: NodeId,
    main_outlet: &Selector,
    threshold: usize,
) -> bool {
    let outlet_moved = records.iter().any(|record| {
        record
            .added
            .iter()
            .chain(record.removed.iter())
            .any(|&node| is_main_outlet(doc, node, main_outlet))
    });
    if outlet_moved {
        return true;
    }
    let (added, removed) = records
        .iter()
        .filter(|record| record.target == observed)
        .fold((0, 0), |(added, removed), record| {
            (added + record.added.len(), removed + record.removed.len())
        });
    added > threshold || removed > threshold
}

fn is_main_outlet(doc: &Document, node: NodeId, main_outlet: &Selector) -> bool {
    if !doc.is_element(node) {
        return false;
    }
    match main_outlet.simple_id() {
        Some(id) => doc.attr(node, "id") == Some(id),
        None => doc.matches(node, main_outlet),
    }
}

/// Unannotated topic links inside the subtrees added by `records`, in
/// discovery order.
pub fn added_topic_links(doc: &Document, records: &[MutationRecord], rules: &PageRules) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let added = records
        .iter()
        .flat_map(|record| record.added.iter().copied())
        .filter(|&node| doc.is_element(node) && doc.is_attached(node));
    for node in added {
        let candidates = if doc.matches(node, &rules.topic_link) {
            vec![node]
        } else {
            doc.query_all(node, &rules.topic_link)
        };
        for link in candidates {
            let wanted = !render::is_processed(doc, link)
                && doc.attr(link, "href").is_some_and(|href| href.contains("/t/"))
                && doc.closest(link, &rules.topic_row).is_some();
            if wanted && seen.insert(link) {
                out.push(link);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::html;

    fn rules() -> PageRules {
        PageRules::compile(&SelectorConfig::default()).unwrap()
    }

    fn add_rows(doc: &mut Document, parent: NodeId, count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|i| {
                let row = doc.create_element("tr");
                let cell = doc.create_element("td");
                let link = doc.create_element("a");
                doc.add_class(link, "raw-topic-link");
                doc.set_attr(link, "href", &format!("/t/x/{}", i + 1));
                doc.append_child(cell, link);
                doc.append_child(row, cell);
                doc.append_child(parent, row);
                link
            })
            .collect()
    }

    #[test]
    fn main_outlet_swap_is_significant() {
        let rules = rules();
        let mut doc = html::parse(r#"<body><div id="main-outlet"></div></body>"#);
        let body = doc.body();
        doc.observe(body);
        let outlet = doc.find_by_id("main-outlet").unwrap();
        doc.remove(outlet);
        let records = doc.take_records();
        assert!(is_significant(&doc, &records, body, &rules.main_outlet, 20));
    }

    #[test]
    fn bulk_child_change_threshold() {
        let rules = rules();
        let mut doc = html::parse(r#"<body><div id="list"></div><div id="other"></div></body>"#);
        let list = doc.find_by_id("list").unwrap();
        let other = doc.find_by_id("other").unwrap();
        let children: Vec<NodeId> = (0..25)
            .map(|_| {
                let child = doc.create_element("div");
                doc.append_child(list, child);
                child
            })
            .collect();
        doc.observe(list);

        for &child in &children[..20] {
            doc.remove(child);
        }
        let records = doc.take_records();
        assert_eq!(records.len(), 20);
        assert!(!is_significant(&doc, &records, list, &rules.main_outlet, 20));

        for &child in &children[20..] {
            doc.remove(child);
        }
        for &child in &children[..20] {
            doc.append_child(list, child);
        }
        let records = doc.take_records();
        assert!(!is_significant(&doc, &records, list, &rules.main_outlet, 20));

        for &child in &children[20..] {
            doc.append_child(list, child);
        }
        doc.take_records();
        for &child in &children[..21] {
            doc.remove(child);
        }
        let records = doc.take_records();
        assert!(is_significant(&doc, &records, list, &rules.main_outlet, 20));

        doc.observe(doc.body());
        for &child in &children {
            doc.append_child(other, child);
        }
        let records = doc.take_records();
        let body = doc.body();
        assert!(!is_significant(&doc, &records, body, &rules.main_outlet, 20));
    }

    #[test]
    fn retargets_to_main_outlet_and_after_detach() {
        let rules = rules();
        let mut doc = html::parse("<html><body><p>loading</p></body></html>");
        let mut reconciler = Reconciler::new();
        let body = doc.body();
        assert_eq!(reconciler.attach(&mut doc, &rules), body);
        assert_eq!(reconciler.retarget_if_needed(&mut doc, &rules), Retarget::Unchanged);

        let outlet = doc.create_element("div");
        doc.set_attr(outlet, "id", "main-outlet");
        doc.append_child(body, outlet);
        assert_eq!(reconciler.retarget_if_needed(&mut doc, &rules), Retarget::Upgraded);
        assert_eq!(reconciler.observed(), Some(outlet));

        doc.remove(outlet);
        let replacement = doc.create_element("div");
        doc.set_attr(replacement, "id", "main-outlet");
        doc.append_child(body, replacement);
        assert_eq!(reconciler.retarget_if_needed(&mut doc, &rules), Retarget::Replaced);
        assert_eq!(doc.observed_root(), Some(replacement));
    }

    #[test]
    fn added_links_are_found_in_subtrees() {
        let rules = rules();
        let mut doc = html::parse(r#"<body><div id="main-outlet"><table id="list"></table></div></body>"#);
        let outlet = doc.find_by_id("main-outlet").unwrap();
        let table = doc.find_by_id("list").unwrap();
        doc.observe(outlet);
        let links = add_rows(&mut doc, table, 3);
        render::mark_processed(&mut doc, links[1]);
        let records = doc.take_records();
        assert_eq!(added_topic_links(&doc, &records, &rules), vec![links[0], links[2]]);
    }
}
