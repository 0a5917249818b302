//! Full-screen gallery over one topic's images.
//!
//! The controller never blocks. Work it cannot do itself (fetching the image
//! list, loading an image, preloading, saving a download) is returned as
//! [`Effect`]s; the driver performs them and reports back through
//! [`Gallery::images_resolved`], [`Gallery::image_settled`] and
//! [`Gallery::download_finished`]. Timers advance through [`Gallery::tick`].
//!
//! Every image show gets a fresh sequence number. A load callback only lands
//! when its sequence is the one currently loading, so a late callback from an
//! earlier image can never touch the current one.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::ImageCache;
use crate::config::GalleryConfig;
use crate::dom::{Document, NodeId};
use crate::extract::original_image_url;
use crate::topic::{RowDetails, TopicId};

pub const OVERLAY_ID: &str = "cg-gallery-overlay";
pub const VISIBLE_CLASS: &str = "cg-visible";
pub const STATUS_CLASS: &str = "cg-gallery-status";
pub const PREV_CLASS: &str = "cg-gallery-prev";
pub const IMAGE_CLASS: &str = "cg-gallery-image";
pub const NEXT_CLASS: &str = "cg-gallery-next";
pub const CLOSE_CLASS: &str = "cg-gallery-close";
pub const DOWNLOAD_CLASS: &str = "cg-gallery-download";
pub const SINGLE_IMAGE_ATTR: &str = "data-single-image";

const LOADING: &str = "Loading images...";
const FETCHING: &str = "Fetching data...";
const PREPARING: &str = "Preparing images...";
const NO_IMAGES: &str = "No images found in the initial post.";
const DOWNLOADING: &str = "Downloading...";
const DOWNLOAD_ERROR: &str = "Download Error!";
const NOTHING_TO_DOWNLOAD: &str = "Nothing to download!";

const MAX_FILENAME_CHARS: usize = 150;

static FORBIDDEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("valid forbidden chars regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static DOT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").expect("valid dot run regex"));
static EXTENSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(jpe?g|png|gif|webp|bmp)$").expect("valid extension regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchImages {
        request_id: u64,
        topic: TopicId,
        topic_url: String,
    },
    LoadImage {
        seq: u64,
        url: String,
    },
    Preload {
        url: String,
    },
    Download {
        url: String,
        filename: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryState {
    pub topic: TopicId,
    pub topic_url: String,
    pub images: Vec<String>,
    /// `None` while loading or when the topic has no images.
    pub current: Option<usize>,
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShowToken {
    Pending { seq: u64, due: Instant },
    Loading { seq: u64 },
    Settled,
}

#[derive(Debug, Clone)]
struct StatusRevert {
    shown: &'static str,
    restore: String,
    due: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Elements {
    overlay: NodeId,
    status: NodeId,
    prev: NodeId,
    image: NodeId,
    next: NodeId,
    close: NodeId,
    download: NodeId,
}

/// A click on one of the overlay's controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Prev,
    Next,
    Close,
    Download,
}

pub struct Gallery {
    cfg: GalleryConfig,
    elements: Option<Elements>,
    state: Option<GalleryState>,
    show: Option<ShowToken>,
    next_seq: u64,
    next_request_id: u64,
    pending_fetch: Option<u64>,
    keyboard: bool,
    revert: Option<StatusRevert>,
    /// Status to come back to once every pending download has settled.
    download_restore: Option<String>,
    downloads_pending: usize,
}

impl Gallery {
    pub fn new(cfg: GalleryConfig) -> Self {
        Self {
            cfg,
            elements: None,
            state: None,
            show: None,
            next_seq: 1,
            next_request_id: 1,
            pending_fetch: None,
            keyboard: false,
            revert: None,
            download_restore: None,
            downloads_pending: 0,
        }
    }

    pub fn state(&self) -> Option<&GalleryState> {
        self.state.as_ref()
    }

    pub fn keyboard_active(&self) -> bool {
        self.keyboard
    }

    pub fn overlay(&self) -> Option<NodeId> {
        self.elements.map(|e| e.overlay)
    }

    pub fn is_visible(&self, doc: &Document) -> bool {
        self.elements
            .is_some_and(|e| doc.is_attached(e.overlay) && doc.has_class(e.overlay, VISIBLE_CLASS))
    }

    pub fn status_text(&self, doc: &Document) -> String {
        self.elements
            .map(|e| doc.text_content(e.status))
            .unwrap_or_default()
    }

    pub fn shown_image(&self, doc: &Document) -> Option<String> {
        self.elements
            .and_then(|e| doc.attr(e.image, "src"))
            .filter(|src| !src.is_empty())
            .map(str::to_string)
    }

    /// Waiting on a fetch or an image load.
    pub fn is_busy(&self) -> bool {
        self.pending_fetch.is_some()
            || matches!(
                self.show,
                Some(ShowToken::Pending { .. }) | Some(ShowToken::Loading { .. })
            )
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        let pending = match self.show {
            Some(ShowToken::Pending { due, .. }) => Some(due),
            _ => None,
        };
        let revert = self.revert.as_ref().map(|r| r.due);
        match (pending, revert) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Reuses the overlay when all of its parts are present and rebuilds it
    /// otherwise. Safe to call at any time.
    pub fn ensure_mounted(&mut self, doc: &mut Document) -> NodeId {
        if let Some(overlay) = doc.find_by_id(OVERLAY_ID) {
            if let Some(elements) = find_elements(doc, overlay) {
                self.elements = Some(elements);
                return overlay;
            }
            warn!("gallery overlay incomplete, recreating");
            doc.remove(overlay);
        }
        let elements = build_overlay(doc);
        let body = doc.body();
        doc.append_child(body, elements.overlay);
        self.elements = Some(elements);
        debug!("gallery overlay mounted");
        elements.overlay
    }

    pub fn open(
        &mut self,
        doc: &mut Document,
        topic: TopicId,
        topic_url: &str,
        details: &RowDetails,
        cache: &ImageCache,
        now: Instant,
    ) -> Vec<Effect> {
        let same_topic = self.state.as_ref().is_some_and(|s| s.topic == topic);
        if same_topic && self.is_visible(doc) {
            self.reveal(doc);
            return Vec::new();
        }
        info!(topic = %topic, "opening gallery");
        self.state = Some(GalleryState {
            topic: topic.clone(),
            topic_url: topic_url.to_string(),
            images: Vec::new(),
            current: None,
            title: non_empty_or(&details.title, "Topic"),
            author: non_empty_or(&details.author, "User"),
        });
        self.show = None;
        self.pending_fetch = None;
        self.revert = None;
        self.reveal(doc);
        let Some(e) = self.elements else {
            self.close(doc);
            return Vec::new();
        };
        doc.remove_attr(e.image, "src");
        doc.set_attr(e.image, "style", "opacity: 0");
        doc.set_text(e.status, LOADING);
        doc.set_attr(e.overlay, SINGLE_IMAGE_ATTR, "true");

        match cache.get(&topic) {
            Some(images) => {
                let images = images.to_vec();
                self.apply_images(doc, images, now);
                Vec::new()
            }
            None => {
                doc.set_text(e.status, FETCHING);
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                self.pending_fetch = Some(request_id);
                vec![Effect::FetchImages {
                    request_id,
                    topic,
                    topic_url: topic_url.to_string(),
                }]
            }
        }
    }

    /// Result of an inline fetch started by [`Gallery::open`]. Results for a
    /// topic that is no longer shown are dropped.
    pub fn images_resolved(
        &mut self,
        doc: &mut Document,
        request_id: u64,
        topic: &TopicId,
        images: Vec<String>,
        now: Instant,
    ) {
        if self.pending_fetch != Some(request_id) {
            debug!(topic = %topic, request_id, "dropping stale gallery fetch");
            return;
        }
        self.pending_fetch = None;
        if self.state.as_ref().map(|s| &s.topic) != Some(topic) {
            return;
        }
        if self.elements.map_or(true, |e| !doc.is_attached(e.overlay)) {
            warn!("gallery overlay gone before images arrived");
            self.close(doc);
            return;
        }
        self.apply_images(doc, images, now);
    }

    fn apply_images(&mut self, doc: &mut Document, images: Vec<String>, now: Instant) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if images.is_empty() {
            state.images.clear();
            state.current = None;
        } else {
            if let Some(e) = self.elements {
                doc.set_text(e.status, PREPARING);
            }
            state.images = images.iter().map(|url| original_image_url(url)).collect();
            state.current = Some(0);
        }
        self.show_current(doc, now);
    }

    fn show_current(&mut self, doc: &mut Document, now: Instant) {
        let Some(e) = self.elements else {
            self.close(doc);
            return;
        };
        let current = self
            .state
            .as_ref()
            .and_then(|s| s.current.filter(|_| !s.images.is_empty()));
        doc.set_attr(e.image, "style", "opacity: 0");
        doc.remove_attr(e.image, "src");
        if current.is_none() {
            self.show = None;
            doc.set_text(e.status, NO_IMAGES);
            doc.set_attr(e.overlay, SINGLE_IMAGE_ATTR, "true");
            doc.set_attr(e.prev, "style", "display: none");
            doc.set_attr(e.next, "style", "display: none");
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.show = Some(ShowToken::Pending {
            seq,
            due: now + self.cfg.settle_delay,
        });
    }

    /// Advances timers: assigns the pending image once the settle delay has
    /// passed and reverts transient status messages.
    pub fn tick(&mut self, doc: &mut Document, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(ShowToken::Pending { seq, due }) = self.show {
            if now >= due {
                effects.extend(self.assign_source(doc, seq));
            }
        }
        if let Some(revert) = self.revert.as_ref().filter(|r| now >= r.due).cloned() {
            self.revert = None;
            if let Some(e) = self.elements {
                if doc.text_content(e.status) == revert.shown {
                    doc.set_text(e.status, &revert.restore);
                }
            }
        }
        effects
    }

    fn assign_source(&mut self, doc: &mut Document, seq: u64) -> Option<Effect> {
        let e = match self.elements {
            Some(e) if doc.is_attached(e.overlay) => e,
            _ => {
                warn!("gallery elements disappeared before image swap");
                self.show = None;
                return None;
            }
        };
        let state = self.state.as_ref()?;
        let index = state.current?;
        let url = state.images.get(index)?.clone();
        let total = state.images.len();
        let single = total <= 1;

        doc.set_attr(e.image, "src", &url);
        doc.set_text(e.status, &format!("{} / {}", index + 1, total));
        doc.set_attr(e.overlay, SINGLE_IMAGE_ATTR, if single { "true" } else { "false" });
        let nav = if single { "display: none" } else { "display: flex" };
        doc.set_attr(e.prev, "style", nav);
        doc.set_attr(e.next, "style", nav);
        self.show = Some(ShowToken::Loading { seq });
        Some(Effect::LoadImage { seq, url })
    }

    /// Load outcome of the image shown under `seq`. Only the first outcome of
    /// the current show is applied.
    pub fn image_settled(&mut self, doc: &mut Document, seq: u64, loaded: bool) -> Vec<Effect> {
        if self.show != Some(ShowToken::Loading { seq }) {
            debug!(seq, "ignoring stale image callback");
            return Vec::new();
        }
        self.show = Some(ShowToken::Settled);
        let (Some(e), Some(state)) = (self.elements, self.state.as_ref()) else {
            return Vec::new();
        };
        let Some(index) = state.current else {
            return Vec::new();
        };
        doc.set_attr(e.image, "style", "opacity: 1");
        if !loaded {
            warn!(url = ?state.images.get(index), "gallery image failed to load");
            doc.set_text(e.status, &format!("Error {}/{}", index + 1, state.images.len()));
            return Vec::new();
        }
        neighbours(state.images.len(), index)
            .into_iter()
            .map(|i| Effect::Preload {
                url: state.images[i].clone(),
            })
            .collect()
    }

    pub fn next(&mut self, doc: &mut Document, now: Instant) {
        self.step(doc, now, 1);
    }

    pub fn prev(&mut self, doc: &mut Document, now: Instant) {
        self.step(doc, now, -1);
    }

    fn step(&mut self, doc: &mut Document, now: Instant, delta: isize) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let len = state.images.len();
        if len == 0 {
            return;
        }
        let current = state.current.unwrap_or(0) as isize;
        state.current = Some((current + delta).rem_euclid(len as isize) as usize);
        self.show_current(doc, now);
    }

    /// Hides the overlay and forgets everything about the shown topic.
    pub fn close(&mut self, doc: &mut Document) {
        if let Some(e) = self.elements {
            doc.remove_class(e.overlay, VISIBLE_CLASS);
            doc.remove_attr(e.image, "src");
            doc.set_attr(e.image, "style", "opacity: 0");
            doc.set_text(e.status, "");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = None;
        self.show = None;
        self.pending_fetch = None;
        self.revert = None;
        self.download_restore = None;
        self.downloads_pending = 0;
        self.keyboard = false;
    }

    fn reveal(&mut self, doc: &mut Document) {
        let overlay = self.ensure_mounted(doc);
        doc.add_class(overlay, VISIBLE_CLASS);
        self.keyboard = true;
    }

    /// Keyboard input while the gallery is open. `focus` is the element that
    /// holds focus, if any.
    pub fn handle_key(
        &mut self,
        doc: &mut Document,
        key: &str,
        focus: Option<NodeId>,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.keyboard {
            return Vec::new();
        }
        if self.elements.is_some_and(|e| !doc.is_attached(e.overlay)) {
            warn!("gallery overlay no longer in the page, releasing keyboard");
            self.reset();
            return Vec::new();
        }
        if !self.is_visible(doc) || focus.is_some_and(|node| is_text_input(doc, node)) {
            return Vec::new();
        }
        match key {
            "ArrowRight" | " " => self.next(doc, now),
            "ArrowLeft" => self.prev(doc, now),
            "Escape" => self.close(doc),
            "s" | "S" => return self.download(doc, now),
            _ => {}
        }
        Vec::new()
    }

    /// Which overlay control `node` belongs to, if any.
    pub fn control_at(&self, doc: &Document, node: NodeId) -> Option<Control> {
        let e = self.elements?;
        [
            (e.prev, Control::Prev),
            (e.next, Control::Next),
            (e.close, Control::Close),
            (e.download, Control::Download),
        ]
        .into_iter()
        .find(|&(button, _)| doc.contains(button, node))
        .map(|(_, control)| control)
    }

    pub fn click(&mut self, doc: &mut Document, control: Control, now: Instant) -> Vec<Effect> {
        match control {
            Control::Prev => self.prev(doc, now),
            Control::Next => self.next(doc, now),
            Control::Close => self.close(doc),
            Control::Download => return self.download(doc, now),
        }
        Vec::new()
    }

    pub fn download(&mut self, doc: &mut Document, now: Instant) -> Vec<Effect> {
        let Some(e) = self.elements else {
            warn!("download requested without gallery elements");
            return Vec::new();
        };
        let previous = doc.text_content(e.status);
        let source = self.shown_image(doc);
        let Some(url) = source.filter(|src| !src.starts_with("data:") && !src.starts_with("blob:"))
        else {
            warn!("nothing to download");
            doc.set_text(e.status, NOTHING_TO_DOWNLOAD);
            self.revert = Some(StatusRevert {
                shown: NOTHING_TO_DOWNLOAD,
                restore: previous,
                due: now + self.cfg.nothing_to_download_revert,
            });
            return Vec::new();
        };
        let (author, title, index) = match self.state.as_ref() {
            Some(s) => (s.author.as_str(), s.title.as_str(), s.current.unwrap_or(0)),
            None => ("U", "T", 0),
        };
        let filename = download_filename(author, title, index + 1, &url);
        doc.set_text(e.status, DOWNLOADING);
        if self.downloads_pending == 0 {
            self.download_restore = Some(previous);
        }
        self.downloads_pending += 1;
        vec![Effect::Download { url, filename }]
    }

    pub fn download_finished(&mut self, doc: &mut Document, ok: bool, now: Instant) {
        self.downloads_pending = self.downloads_pending.saturating_sub(1);
        let restore = if self.downloads_pending == 0 {
            self.download_restore.take()
        } else {
            self.download_restore.clone()
        }
        .unwrap_or_default();
        let Some(e) = self.elements else {
            return;
        };
        if ok {
            self.revert = Some(StatusRevert {
                shown: DOWNLOADING,
                restore,
                due: now + self.cfg.download_ok_revert,
            });
            return;
        }
        doc.set_text(e.status, DOWNLOAD_ERROR);
        let restore = match self.state.as_ref() {
            Some(GalleryState {
                images,
                current: Some(i),
                ..
            }) if !images.is_empty() => format!("{}/{}", i + 1, images.len()),
            _ => restore,
        };
        self.revert = Some(StatusRevert {
            shown: DOWNLOAD_ERROR,
            restore,
            due: now + self.cfg.download_error_revert,
        });
    }
}

/// Circular neighbours of `index` to preload, without repeats.
fn neighbours(len: usize, index: usize) -> Vec<usize> {
    if len <= 1 {
        return Vec::new();
    }
    let next = (index + 1) % len;
    let prev = (index + len - 1) % len;
    let mut out = Vec::with_capacity(2);
    if next != index {
        out.push(next);
    }
    if prev != index && prev != next {
        out.push(prev);
    }
    out
}

fn is_text_input(doc: &Document, node: NodeId) -> bool {
    if matches!(doc.tag(node), Some("input" | "textarea" | "select")) {
        return true;
    }
    let mut current = Some(node);
    while let Some(id) = current {
        match doc.attr(id, "contenteditable") {
            Some("false") => return false,
            Some(_) => return true,
            None => current = doc.parent(id),
        }
    }
    false
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// `"{author} - {title}-Img_{NN}.{ext}"`, made safe for common filesystems.
pub fn download_filename(author: &str, title: &str, number: usize, url: &str) -> String {
    let number = format!("{number:02}");
    let raw = format!("{author} - {title}-Img_{number}");
    let cleaned = FORBIDDEN_RE.replace_all(&raw, "_");
    let cleaned = WHITESPACE_RE.replace_all(&cleaned, " ");
    let truncated: String = cleaned.trim().chars().take(MAX_FILENAME_CHARS).collect();
    let stem = DOT_RUN_RE
        .replace_all(truncated.trim_end_matches('.'), ".")
        .into_owned();
    let stem = if stem.is_empty() {
        format!("Image_{number}")
    } else {
        stem
    };
    let ext = Url::parse(url)
        .ok()
        .and_then(|u| {
            EXTENSION_RE
                .captures(u.path())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_ascii_lowercase())
        })
        .unwrap_or_else(|| "jpg".to_string());
    format!("{stem}.{ext}")
}

fn find_elements(doc: &Document, overlay: NodeId) -> Option<Elements> {
    let by_class = |class: &str| {
        doc.descendants(overlay)
            .into_iter()
            .find(|&node| doc.has_class(node, class))
    };
    Some(Elements {
        overlay,
        status: by_class(STATUS_CLASS)?,
        prev: by_class(PREV_CLASS)?,
        image: by_class(IMAGE_CLASS)?,
        next: by_class(NEXT_CLASS)?,
        close: by_class(CLOSE_CLASS)?,
        download: by_class(DOWNLOAD_CLASS)?,
    })
}

fn build_overlay(doc: &mut Document) -> Elements {
    let overlay = doc.create_element("div");
    doc.set_attr(overlay, "id", OVERLAY_ID);
    doc.add_class(overlay, OVERLAY_ID);

    let status = doc.create_element("div");
    doc.add_class(status, STATUS_CLASS);

    let button = |doc: &mut Document, class: &str, label: &str, aria: &str| {
        let node = doc.create_element("button");
        doc.add_class(node, class);
        doc.set_text(node, label);
        doc.set_attr(node, "aria-label", aria);
        node
    };
    let prev = button(doc, PREV_CLASS, "‹", "Previous Image");
    let image = doc.create_element("img");
    doc.add_class(image, IMAGE_CLASS);
    doc.set_attr(image, "alt", "Gallery Image");
    let next = button(doc, NEXT_CLASS, "›", "Next Image");
    let close = button(doc, CLOSE_CLASS, "×", "Close Gallery");
    let download = button(doc, DOWNLOAD_CLASS, "⬇", "Download Image (Shortcut: S)");
    doc.set_attr(download, "title", "Download current image (Shortcut: S)");

    for child in [status, prev, image, next, close, download] {
        doc.append_child(overlay, child);
    }
    Elements {
        overlay,
        status,
        prev,
        image,
        next,
        close,
        download,
    }
}
