//! Driver that owns the page and every piece of preview state.
//!
//! All state lives on the driver thread. Blocking work runs on short-lived
//! worker threads that report back through an [`AsyncResponse`] channel;
//! results are applied in [`Runtime::pump`] after checking that their target
//! is still on the page.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::ImageCache;
use crate::config::{Config, PreviewConfig};
use crate::dom::{Document, NodeId};
use crate::error::PreviewError;
use crate::extract;
use crate::gallery::{Effect, Gallery};
use crate::net::{FileSaver, Fetcher, ImageLoader};
use crate::queue::{PrefetchQueue, QueueItem};
use crate::reconciler::{self, Reconciler, Retarget};
use crate::render::{self, Placeholder};
use crate::scanner::{self, Annotation, ScanContext};
use crate::selector::PageRules;
use crate::storage::Store;
use crate::topic::{RowDetails, TopicId};

const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Collaborators that touch the outside world.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn Fetcher>,
    pub loader: Arc<dyn ImageLoader>,
    pub saver: Arc<dyn FileSaver>,
}

enum AsyncResponse {
    Preview {
        item: QueueItem,
        result: Result<Vec<String>>,
    },
    GalleryImages {
        request_id: u64,
        topic: TopicId,
        result: Result<Vec<String>>,
    },
    GalleryImage {
        seq: u64,
        result: Result<()>,
    },
    Thumbnail {
        container: NodeId,
        url: String,
        result: Result<()>,
    },
    Preloaded,
    Download {
        result: Result<PathBuf>,
    },
}

pub struct Runtime {
    doc: Document,
    rules: Arc<PageRules>,
    preview: PreviewConfig,
    base: Option<Url>,
    cache: ImageCache,
    initial: HashMap<TopicId, String>,
    queue: PrefetchQueue,
    reconciler: Reconciler,
    gallery: Gallery,
    services: Services,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    outstanding: usize,
}

impl Runtime {
    pub fn new(
        doc: Document,
        page_url: Option<&str>,
        cfg: &Config,
        store: Option<Arc<Store>>,
        services: Services,
    ) -> Result<Self> {
        let rules = PageRules::compile(&cfg.selectors).context("runtime: compile selectors")?;
        let base = page_url
            .map(Url::parse)
            .transpose()
            .context("runtime: parse page url")?;
        let (response_tx, response_rx) = unbounded();
        Ok(Self {
            doc,
            rules: Arc::new(rules),
            preview: cfg.preview.clone(),
            base,
            cache: ImageCache::new(store, cfg.preview.hint_ttl),
            initial: HashMap::new(),
            queue: PrefetchQueue::new(cfg.preview.debounce, cfg.preview.fetch_delay),
            reconciler: Reconciler::new(),
            gallery: Gallery::new(cfg.gallery.clone()),
            services,
            response_tx,
            response_rx,
            outstanding: 0,
        })
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn rules(&self) -> &PageRules {
        &self.rules
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn queue(&self) -> &PrefetchQueue {
        &self.queue
    }

    /// First pass over the page, then start watching it.
    pub fn start(&mut self, now: Instant) {
        info!("starting preview pipeline");
        self.initial = extract::initial_image_map(&self.doc, &self.rules).unwrap_or_default();
        self.gallery.ensure_mounted(&mut self.doc);
        self.full_scan(now);
        self.reconciler.attach(&mut self.doc, &self.rules);
    }

    /// One turn of the driver loop: apply finished work, react to page
    /// changes, start due extractions and advance gallery timers.
    pub fn pump(&mut self, now: Instant) {
        self.poll_async(now);
        self.reconcile(now);
        self.step_queue(now);
        let effects = self.gallery.tick(&mut self.doc, now);
        self.run_effects(effects);
    }

    /// Nothing queued, nothing running, and the gallery is not waiting.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle() && self.outstanding == 0 && !self.gallery.is_busy()
    }

    /// Pumps until idle or until `timeout` passes. Returns whether the
    /// pipeline went idle.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.pump(now);
            if self.is_idle() {
                return true;
            }
            if now >= deadline {
                warn!(queued = self.queue.len(), outstanding = self.outstanding, "pipeline still busy at deadline");
                return false;
            }
            let wake = [self.queue.next_wakeup(), self.gallery.next_wakeup()]
                .into_iter()
                .flatten()
                .min()
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(MAX_IDLE_WAIT)
                .min(MAX_IDLE_WAIT)
                .min(deadline.saturating_duration_since(now));
            if let Ok(message) = self.response_rx.recv_timeout(wake) {
                self.handle_async_response(message, Instant::now());
            }
        }
    }

    /// A click anywhere on the page.
    pub fn click(&mut self, node: NodeId, now: Instant) {
        if let Some(control) = self.gallery.control_at(&self.doc, node) {
            let effects = self.gallery.click(&mut self.doc, control, now);
            self.run_effects(effects);
            return;
        }
        let Some(target) = render::click_target(&self.doc, node) else {
            return;
        };
        let details = self
            .doc
            .closest(target.container, &self.rules.topic_row)
            .map(|row| RowDetails::from_row(&self.doc, row, &self.rules))
            .unwrap_or_default();
        let effects = self.gallery.open(
            &mut self.doc,
            target.topic,
            &target.topic_url,
            &details,
            &self.cache,
            now,
        );
        self.run_effects(effects);
    }

    pub fn key(&mut self, key: &str, focus: Option<NodeId>, now: Instant) {
        let effects = self.gallery.handle_key(&mut self.doc, key, focus, now);
        self.run_effects(effects);
    }

    /// Opens the gallery for a topic URL directly, without a rendered row.
    pub fn open_gallery(&mut self, topic_url: &str, details: &RowDetails, now: Instant) -> Result<()> {
        let topic = TopicId::from_url(topic_url)
            .ok_or_else(|| PreviewError::NotFound(topic_url.to_string()))?;
        let effects = self.gallery.open(
            &mut self.doc,
            topic,
            topic_url,
            details,
            &self.cache,
            now,
        );
        self.run_effects(effects);
        Ok(())
    }

    fn full_scan(&mut self, now: Instant) {
        let ctx = ScanContext {
            rules: &self.rules,
            base: self.base.as_ref(),
            initial: &self.initial,
        };
        let annotations = scanner::scan(&mut self.doc, &ctx, &self.cache, &mut self.queue, now);
        self.verify_thumbnails(annotations);
    }

    fn reconcile(&mut self, now: Instant) {
        let records = self.doc.take_records();
        let previous = self.reconciler.observed();
        let retarget = self.reconciler.retarget_if_needed(&mut self.doc, &self.rules);
        if records.is_empty() && retarget == Retarget::Unchanged {
            return;
        }

        let significant = retarget == Retarget::Replaced
            || previous.is_some_and(|root| {
                reconciler::is_significant(
                    &self.doc,
                    &records,
                    root,
                    &self.rules.main_outlet,
                    self.preview.significant_children,
                )
            });
        if significant {
            info!("significant page change, re-scanning");
            if let Some(fresh) = extract::initial_image_map(&self.doc, &self.rules) {
                self.initial = fresh;
            }
            self.gallery.ensure_mounted(&mut self.doc);
            for link in self.doc.query_all(self.doc.root(), &self.rules.topic_link) {
                self.doc.remove_attr(link, render::PROCESSED_ATTR);
            }
            self.full_scan(now);
        }

        let links = reconciler::added_topic_links(&self.doc, &records, &self.rules);
        if !links.is_empty() {
            debug!(count = links.len(), "annotating added topic links");
        }
        let mut annotations = Vec::new();
        for link in links {
            let ctx = ScanContext {
                rules: &self.rules,
                base: self.base.as_ref(),
                initial: &self.initial,
            };
            annotations.push(scanner::annotate_link(
                &mut self.doc,
                link,
                &ctx,
                &self.cache,
                &mut self.queue,
                now,
            ));
        }
        self.verify_thumbnails(annotations);
        // Our own annotations are not page changes.
        self.doc.take_records();
    }

    fn step_queue(&mut self, now: Instant) {
        let doc = &self.doc;
        let Some(item) = self
            .queue
            .next_due(now, |item| render::loading_container_for(doc, &item.topic).is_some())
        else {
            return;
        };
        if let Some(images) = self.cache.get(&item.topic).map(<[String]>::to_vec) {
            debug!(topic = %item.topic, "preview already resolved");
            self.apply_preview(&item, images);
            self.queue.complete(&item.topic, now);
            return;
        }
        debug!(topic = %item.topic, url = %item.topic_url, "fetching preview");
        let fetcher = self.services.fetcher.clone();
        let rules = self.rules.clone();
        let fallback = item.clone();
        self.spawn(
            move || {
                let result = extract::resolve_topic_images(fetcher.as_ref(), &item.topic_url, &rules);
                AsyncResponse::Preview { item, result }
            },
            move |err| AsyncResponse::Preview {
                item: fallback,
                result: Err(err),
            },
        );
    }

    /// Writes the result back and re-renders every row still waiting on it.
    fn apply_preview(&mut self, item: &QueueItem, images: Vec<String>) {
        let first = images.first().cloned();
        self.cache.put(item.topic.clone(), images);
        let mut thumbnails = Vec::new();
        while let Some(waiting) = render::loading_container_for(&self.doc, &item.topic) {
            match &first {
                Some(url) => {
                    let thumb = render::thumbnail(&mut self.doc, &item.topic, &item.topic_url, url);
                    self.doc.replace(waiting, thumb);
                    thumbnails.push(Annotation::Thumbnail {
                        topic: item.topic.clone(),
                        container: thumb,
                        image_url: url.clone(),
                    });
                }
                None => {
                    let row = self.doc.closest(waiting, &self.rules.topic_row);
                    let cell = self.doc.parent(waiting);
                    self.doc.remove(waiting);
                    if let (Some(row), Some(cell)) = (row, cell) {
                        render::add_placeholder(
                            &mut self.doc,
                            row,
                            cell,
                            Placeholder::NoImages,
                            Some(&item.topic),
                            Some(&item.topic_url),
                        );
                    }
                }
            }
        }
        self.verify_thumbnails(thumbnails);
    }

    fn verify_thumbnails(&mut self, annotations: Vec<Annotation>) {
        if !self.preview.verify_thumbnails {
            return;
        }
        for annotation in annotations {
            let Annotation::Thumbnail {
                container,
                image_url,
                ..
            } = annotation
            else {
                continue;
            };
            let loader = self.services.loader.clone();
            let url = image_url.clone();
            self.spawn(
                move || {
                    let result = loader.load(&image_url);
                    AsyncResponse::Thumbnail {
                        container,
                        url: image_url,
                        result,
                    }
                },
                move |err| AsyncResponse::Thumbnail {
                    container,
                    url,
                    result: Err(err),
                },
            );
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::FetchImages {
                    request_id,
                    topic,
                    topic_url,
                } => {
                    let fetcher = self.services.fetcher.clone();
                    let rules = self.rules.clone();
                    let fallback_topic = topic.clone();
                    self.spawn(
                        move || {
                            let result =
                                extract::resolve_topic_images(fetcher.as_ref(), &topic_url, &rules);
                            AsyncResponse::GalleryImages {
                                request_id,
                                topic,
                                result,
                            }
                        },
                        move |err| AsyncResponse::GalleryImages {
                            request_id,
                            topic: fallback_topic,
                            result: Err(err),
                        },
                    );
                }
                Effect::LoadImage { seq, url } => {
                    let loader = self.services.loader.clone();
                    self.spawn(
                        move || AsyncResponse::GalleryImage {
                            seq,
                            result: loader.load(&url),
                        },
                        move |err| AsyncResponse::GalleryImage {
                            seq,
                            result: Err(err),
                        },
                    );
                }
                Effect::Preload { url } => {
                    let loader = self.services.loader.clone();
                    self.spawn(
                        move || {
                            if let Err(err) = loader.load(&url) {
                                debug!(url = %url, "preload failed: {err:?}");
                            }
                            AsyncResponse::Preloaded
                        },
                        |err| {
                            debug!("preload failed: {err:?}");
                            AsyncResponse::Preloaded
                        },
                    );
                }
                Effect::Download { url, filename } => {
                    let fetcher = self.services.fetcher.clone();
                    let saver = self.services.saver.clone();
                    let failed = PreviewError::DownloadFailed(url.clone());
                    self.spawn(
                        move || {
                            let result = fetcher
                                .fetch_bytes(&url)
                                .and_then(|bytes| saver.save(&bytes, &filename))
                                .with_context(|| PreviewError::DownloadFailed(url.clone()));
                            AsyncResponse::Download { result }
                        },
                        move |err| AsyncResponse::Download {
                            result: Err(err.context(failed)),
                        },
                    );
                }
            }
        }
    }

    /// Runs `job` on a worker thread. A panicking job still answers, through
    /// `on_panic`, so the outstanding count and the queue stay consistent.
    fn spawn<F, P>(&mut self, job: F, on_panic: P)
    where
        F: FnOnce() -> AsyncResponse + Send + 'static,
        P: FnOnce(anyhow::Error) -> AsyncResponse + Send + 'static,
    {
        self.outstanding += 1;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let message = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
                let err = anyhow!("worker panicked: {}", panic_message(payload.as_ref()));
                error!("{err}");
                on_panic(err)
            });
            let _ = tx.send(message);
        });
    }

    fn poll_async(&mut self, now: Instant) {
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message, now);
        }
    }

    fn handle_async_response(&mut self, message: AsyncResponse, now: Instant) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match message {
            AsyncResponse::Preview { item, result } => {
                let images = result.unwrap_or_else(|err| {
                    warn!(topic = %item.topic, "preview fetch failed: {err:?}");
                    Vec::new()
                });
                debug!(topic = %item.topic, images = images.len(), "preview resolved");
                self.apply_preview(&item, images);
                self.queue.complete(&item.topic, now);
            }
            AsyncResponse::GalleryImages {
                request_id,
                topic,
                result,
            } => {
                let images = result.unwrap_or_else(|err| {
                    warn!(topic = %topic, "gallery fetch failed: {err:?}");
                    Vec::new()
                });
                self.cache.put(topic.clone(), images.clone());
                self.gallery
                    .images_resolved(&mut self.doc, request_id, &topic, images, now);
            }
            AsyncResponse::GalleryImage { seq, result } => {
                let effects = self
                    .gallery
                    .image_settled(&mut self.doc, seq, result.is_ok());
                self.run_effects(effects);
            }
            AsyncResponse::Thumbnail {
                container,
                url,
                result,
            } => {
                if result.is_ok() {
                    return;
                }
                warn!("{}", PreviewError::ImageLoadFailed(url));
                self.replace_broken_thumbnail(container);
            }
            AsyncResponse::Preloaded => {}
            AsyncResponse::Download { result } => {
                match &result {
                    Ok(path) => info!(path = %path.display(), "image saved"),
                    Err(err) => warn!("{err:?}"),
                }
                self.gallery
                    .download_finished(&mut self.doc, result.is_ok(), now);
            }
        }
    }

    fn replace_broken_thumbnail(&mut self, container: NodeId) {
        if !self.doc.is_attached(container) {
            return;
        }
        let topic = self
            .doc
            .attr(container, render::TOPIC_KEY_ATTR)
            .and_then(TopicId::from_key);
        let topic_url = self
            .doc
            .attr(container, render::TOPIC_URL_ATTR)
            .map(str::to_string);
        let row = self.doc.closest(container, &self.rules.topic_row);
        let cell = self.doc.parent(container);
        self.doc.remove(container);
        if let (Some(row), Some(cell)) = (row, cell) {
            render::add_placeholder(
                &mut self.doc,
                row,
                cell,
                Placeholder::Error,
                topic.as_ref(),
                topic_url.as_deref(),
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html;
    use anyhow::anyhow;
    use parking_lot::Mutex;

    struct PageFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl PageFetcher {
        fn new(pages: &[(&str, String)], delay: Duration) -> Self {
            Self {
                pages: pages.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                calls: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    impl Fetcher for PageFetcher {
        fn fetch_text(&self, url: &str) -> Result<String> {
            self.calls.lock().push(url.to_string());
            thread::sleep(self.delay);
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow!("404 for {url}"))
        }

        fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
            self.fetch_text(url).map(String::into_bytes)
        }
    }

    struct Loader {
        broken: Vec<String>,
    }

    impl ImageLoader for Loader {
        fn load(&self, url: &str) -> Result<()> {
            if self.broken.iter().any(|b| b == url) {
                Err(anyhow!("broken"))
            } else {
                Ok(())
            }
        }
    }

    struct NullSaver;

    impl FileSaver for NullSaver {
        fn save(&self, _bytes: &[u8], filename: &str) -> Result<PathBuf> {
            Ok(PathBuf::from(filename))
        }
    }

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.preview.debounce = Duration::from_millis(5);
        cfg.preview.fetch_delay = Duration::from_millis(20);
        cfg.gallery.settle_delay = Duration::from_millis(1);
        cfg
    }

    fn topic_page(image: &str) -> String {
        format!(
            r#"<div class="post-stream"><div class="topic-post"><div class="cooked"><img src="{image}"></div></div></div>"#
        )
    }

    const LISTING: &str = r#"<html><body><div id="main-outlet"><table><tbody id="rows">
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/a/1">A</a></td></tr>
              <tr><td class="main-link"><a class="raw-topic-link" href="/t/b/2">B</a></td></tr>
            </tbody></table></div></body></html>"#;

    fn runtime_with(doc: Document, fetcher: Arc<PageFetcher>, broken: &[&str]) -> Runtime {
        let services = Services {
            fetcher,
            loader: Arc::new(Loader {
                broken: broken.iter().map(|s| s.to_string()).collect(),
            }),
            saver: Arc::new(NullSaver),
        };
        Runtime::new(doc, Some("https://forum.example/latest"), &config(), None, services).unwrap()
    }

    fn runtime(pages: &[(&str, String)], broken: &[&str]) -> (Runtime, Arc<PageFetcher>) {
        let fetcher = Arc::new(PageFetcher::new(pages, Duration::ZERO));
        let rt = runtime_with(html::parse(LISTING), fetcher.clone(), broken);
        (rt, fetcher)
    }

    fn add_topic_row(doc: &mut Document, parent: NodeId, topic: u64) -> NodeId {
        let row = doc.create_element("tr");
        let cell = doc.create_element("td");
        doc.add_class(cell, "main-link");
        let link = doc.create_element("a");
        doc.add_class(link, "raw-topic-link");
        doc.set_attr(link, "href", &format!("/t/topic/{topic}"));
        doc.append_child(cell, link);
        doc.append_child(row, cell);
        doc.append_child(parent, row);
        row
    }

    fn preloaded_topics(ids: impl IntoIterator<Item = u64>) -> String {
        let topics: Vec<_> = ids
            .into_iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "image_url": format!("https://forum.example/pic/{id}.png"),
                })
            })
            .collect();
        serde_json::json!({ "topics": topics }).to_string()
    }

    fn thumbnail_src(rt: &Runtime, topic: u64) -> Option<String> {
        let doc = rt.document();
        let container = render::container_for(doc, doc.root(), &TopicId::from_number(topic))?;
        let img = doc.first_child(container)?;
        doc.attr(img, "src").map(str::to_string)
    }

    #[test]
    fn queue_fills_rows_in_order() {
        let (mut rt, fetcher) = runtime(
            &[
                ("https://forum.example/t/a/1", topic_page("/one.png")),
                ("https://forum.example/t/b/2", topic_page("/two.png")),
            ],
            &[],
        );
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        assert_eq!(
            thumbnail_src(&rt, 1).as_deref(),
            Some("https://forum.example/one.png")
        );
        assert_eq!(
            thumbnail_src(&rt, 2).as_deref(),
            Some("https://forum.example/two.png")
        );
        assert_eq!(
            *fetcher.calls.lock(),
            vec!["https://forum.example/t/a/1", "https://forum.example/t/b/2"]
        );
    }

    #[test]
    fn failed_fetch_caches_empty_and_shows_placeholder() {
        let (mut rt, _) = runtime(&[], &[]);
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        assert_eq!(rt.cache().get(&TopicId::from_number(1)), Some(&[][..]));
        let doc = rt.document();
        let container = render::container_for(doc, doc.root(), &TopicId::from_number(1)).unwrap();
        assert_eq!(doc.attr(container, "title"), Some("No image. Click to open."));
    }

    #[test]
    fn broken_thumbnail_becomes_error_placeholder() {
        let (mut rt, _) = runtime(
            &[
                ("https://forum.example/t/a/1", topic_page("/one.png")),
                ("https://forum.example/t/b/2", topic_page("/two.png")),
            ],
            &["https://forum.example/two.png"],
        );
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        let doc = rt.document();
        let container = render::container_for(doc, doc.root(), &TopicId::from_number(2)).unwrap();
        assert_eq!(
            doc.attr(container, "title"),
            Some("Error. Click to try opening.")
        );
        assert!(render::click_target(doc, container).is_some());
    }

    #[test]
    fn detached_row_is_a_silent_no_op() {
        let (mut rt, fetcher) = runtime(
            &[("https://forum.example/t/b/2", topic_page("/two.png"))],
            &[],
        );
        rt.start(Instant::now());
        let first_row = {
            let doc = rt.document();
            let link = doc.query(doc.root(), &rt.rules().topic_link).unwrap();
            doc.closest(link, &rt.rules().topic_row).unwrap()
        };
        rt.document_mut().remove(first_row);
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        assert_eq!(*fetcher.calls.lock(), vec!["https://forum.example/t/b/2"]);
        assert!(!rt.cache().contains(&TopicId::from_number(1)));
    }

    #[test]
    fn clicking_a_thumbnail_opens_the_gallery() {
        let (mut rt, _) = runtime(
            &[
                ("https://forum.example/t/a/1", topic_page("/one.png")),
                ("https://forum.example/t/b/2", topic_page("/two.png")),
            ],
            &[],
        );
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        let container = {
            let doc = rt.document();
            render::container_for(doc, doc.root(), &TopicId::from_number(1)).unwrap()
        };
        rt.click(container, Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        let state = rt.gallery().state().unwrap();
        assert_eq!(state.images, vec!["https://forum.example/one.png"]);
        assert_eq!(state.title, "A");
        assert_eq!(rt.gallery().status_text(rt.document()), "1 / 1");
    }

    #[test]
    fn rows_added_later_are_picked_up() {
        let (mut rt, _) = runtime(
            &[
                ("https://forum.example/t/a/1", topic_page("/one.png")),
                ("https://forum.example/t/b/2", topic_page("/two.png")),
                ("https://forum.example/t/c/3", topic_page("/three.png")),
            ],
            &[],
        );
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        {
            let doc = rt.document_mut();
            let rows = doc.find_by_id("rows").unwrap();
            let row = doc.create_element("tr");
            let cell = doc.create_element("td");
            doc.add_class(cell, "main-link");
            let link = doc.create_element("a");
            doc.add_class(link, "raw-topic-link");
            doc.set_attr(link, "href", "/t/c/3");
            doc.append_child(cell, link);
            doc.append_child(row, cell);
            doc.append_child(rows, row);
        }
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        assert_eq!(
            thumbnail_src(&rt, 3).as_deref(),
            Some("https://forum.example/three.png")
        );
    }

    #[test]
    fn bulk_replacement_rescans_with_a_fresh_initial_map() {
        let fetcher = Arc::new(PageFetcher::new(&[], Duration::ZERO));
        let doc = html::parse(
            r#"<html><body><div id="data-preloaded"></div><div id="main-outlet"></div></body></html>"#,
        );
        let mut rt = runtime_with(doc, fetcher.clone(), &[]);
        let rows: Vec<NodeId> = {
            let doc = rt.document_mut();
            let data = doc.find_by_id("data-preloaded").unwrap();
            doc.set_attr(data, "data-preloaded", &preloaded_topics(1..=21));
            let outlet = doc.find_by_id("main-outlet").unwrap();
            (1..=21).map(|id| add_topic_row(doc, outlet, id)).collect()
        };
        rt.start(Instant::now());
        assert!(rt.run_until_idle(Duration::from_secs(5)));
        assert_eq!(
            thumbnail_src(&rt, 21).as_deref(),
            Some("https://forum.example/pic/21.png")
        );

        // The listing is re-rendered: every row goes, an already annotated
        // link comes back in a bare row, and a new topic appears.
        let rules = rt.rules().clone();
        {
            let doc = rt.document_mut();
            let link = doc.query(rows[0], &rules.topic_link).unwrap();
            assert!(render::is_processed(doc, link));
            let data = doc.find_by_id("data-preloaded").unwrap();
            doc.set_attr(data, "data-preloaded", &preloaded_topics(1..=22));
            for &row in &rows {
                doc.remove(row);
            }
            let outlet = doc.find_by_id("main-outlet").unwrap();
            let row = doc.create_element("tr");
            let cell = doc.create_element("td");
            doc.append_child(cell, link);
            doc.append_child(row, cell);
            doc.append_child(outlet, row);
            add_topic_row(doc, outlet, 22);
        }
        assert!(rt.run_until_idle(Duration::from_secs(5)));

        assert_eq!(
            thumbnail_src(&rt, 1).as_deref(),
            Some("https://forum.example/pic/1.png")
        );
        assert_eq!(
            thumbnail_src(&rt, 22).as_deref(),
            Some("https://forum.example/pic/22.png")
        );
        assert!(fetcher.calls.lock().is_empty());
    }

    #[test]
    fn row_detached_mid_fetch_is_left_alone_but_cached() {
        let fetcher = Arc::new(PageFetcher::new(
            &[
                ("https://forum.example/t/a/1", topic_page("/one.png")),
                ("https://forum.example/t/b/2", topic_page("/two.png")),
            ],
            Duration::from_millis(100),
        ));
        let mut rt = runtime_with(html::parse(LISTING), fetcher, &[]);
        let first = TopicId::from_number(1);
        rt.start(Instant::now());

        let deadline = Instant::now() + Duration::from_secs(5);
        while rt.queue().in_flight().is_none() && Instant::now() < deadline {
            rt.pump(Instant::now());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rt.queue().in_flight(), Some(&first));

        let (row, cell, before) = {
            let doc = rt.document();
            let loading = render::loading_container_for(doc, &first).unwrap();
            let cell = doc.parent(loading).unwrap();
            let row = doc.closest(loading, &rt.rules().topic_row).unwrap();
            (row, cell, doc.children(cell).to_vec())
        };
        rt.document_mut().remove(row);
        assert!(rt.run_until_idle(Duration::from_secs(5)));

        assert_eq!(
            rt.cache().get(&first),
            Some(&["https://forum.example/one.png".to_string()][..])
        );
        let doc = rt.document();
        assert_eq!(doc.children(cell), before.as_slice());
        assert!(render::is_loading(doc, before[0]));
        assert!(render::container_for(doc, doc.root(), &first).is_none());
        assert_eq!(
            thumbnail_src(&rt, 2).as_deref(),
            Some("https://forum.example/two.png")
        );
    }
}
