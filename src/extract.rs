//! Content extractor: topic markup in, ordered content image URLs out.
//!
//! Strategies are tried in priority order and the first [`Extraction::Found`]
//! wins. A strategy that finds its source but no usable image reports
//! `NotFound` so the next one still gets a chance.

use std::collections::HashMap;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::dom::{Document, NodeId};
use crate::error::PreviewError;
use crate::html;
use crate::net::Fetcher;
use crate::selector::PageRules;
use crate::topic::TopicId;

static SIZE_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:_(?:\d+|[a-z]))?_\d+x\d+\.(jpe?g|png|gif|webp|bmp)$")
        .expect("valid size suffix regex")
});

static IMAGE_EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(jpe?g|png|gif|webp|bmp)$").expect("valid image ext regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(Vec<String>),
    NotFound,
}

impl Extraction {
    fn from_images(images: Vec<String>) -> Self {
        if images.is_empty() {
            Extraction::NotFound
        } else {
            Extraction::Found(images)
        }
    }
}

/// Decorative, avatar and inline sources are never content images.
pub fn is_content_image(url: &str) -> bool {
    !url.is_empty()
        && !url.contains("/emoji/")
        && !url.contains("/images/transparent.png")
        && !url.contains("/user_avatar/")
        && !url.contains("/avatar/")
        && !url.starts_with("data:")
        && !url.starts_with("blob:")
}

/// Fetches the topic page and extracts its opening post's images. Fetch
/// failures are reported to the caller, which caches them as an empty list.
pub fn resolve_topic_images(
    fetcher: &dyn Fetcher,
    topic_url: &str,
    rules: &PageRules,
) -> Result<Vec<String>> {
    let markup = fetcher.fetch_text(topic_url)?;
    Ok(extract_images(&markup, topic_url, rules))
}

pub fn extract_images(markup: &str, topic_url: &str, rules: &PageRules) -> Vec<String> {
    let doc = html::parse(markup);
    let base = Url::parse(topic_url).ok();
    let strategies: [fn(&Document, Option<&Url>, &PageRules) -> Extraction; 2] =
        [from_preloaded_post, from_first_post_content];
    for strategy in strategies {
        if let Extraction::Found(images) = strategy(&doc, base.as_ref(), rules) {
            return images;
        }
    }
    debug!(topic_url, "no content images");
    Vec::new()
}

fn from_preloaded_post(doc: &Document, base: Option<&Url>, rules: &PageRules) -> Extraction {
    let Some(raw) = preloaded_json(doc, rules) else {
        return Extraction::NotFound;
    };
    let cooked = match first_post_cooked(raw) {
        Ok(Some(cooked)) => cooked,
        Ok(None) => return Extraction::NotFound,
        Err(err) => {
            warn!("preloaded topic data: {err}");
            return Extraction::NotFound;
        }
    };
    let fragment = html::parse(&cooked);
    Extraction::from_images(images_in(&fragment, fragment.root(), base, rules))
}

fn from_first_post_content(doc: &Document, base: Option<&Url>, rules: &PageRules) -> Extraction {
    match doc.query(doc.root(), &rules.first_post_content) {
        Some(content) => Extraction::from_images(images_in(doc, content, base, rules)),
        None => Extraction::NotFound,
    }
}

fn preloaded_json<'a>(doc: &'a Document, rules: &PageRules) -> Option<&'a str> {
    doc.query(doc.root(), &rules.preloaded_data)
        .and_then(|node| doc.attr(node, "data-preloaded"))
        .filter(|raw| !raw.trim().is_empty())
}

fn first_post_cooked(raw: &str) -> Result<Option<String>, PreviewError> {
    let data: Value =
        serde_json::from_str(raw).map_err(|_| PreviewError::ParseFailed("data-preloaded".into()))?;
    let topic_entry = data
        .as_object()
        .and_then(|map| map.iter().find(|(key, _)| key.starts_with("topic_")))
        .map(|(_, value)| value);
    let posts = match topic_entry {
        Some(Value::String(nested)) => {
            let topic: Value = serde_json::from_str(nested)
                .map_err(|_| PreviewError::ParseFailed("preloaded topic".into()))?;
            topic.pointer("/post_stream/posts").cloned()
        }
        _ => data.pointer("/post_stream/posts").cloned(),
    };
    Ok(posts
        .as_ref()
        .and_then(|posts| posts.get(0))
        .and_then(|post| post.get("cooked"))
        .and_then(Value::as_str)
        .filter(|cooked| !cooked.is_empty())
        .map(str::to_string))
}

fn images_in(doc: &Document, scope: NodeId, base: Option<&Url>, rules: &PageRules) -> Vec<String> {
    let mut elements = doc.query_all(scope, &rules.gallery_image_link);
    if elements.is_empty() {
        elements = doc.query_all(scope, &rules.gallery_image_fallback);
    }
    elements
        .into_iter()
        .filter_map(|img| image_source(doc, img, rules))
        .map(|src| resolve(base, &src))
        .filter(|src| is_content_image(src))
        .collect()
}

fn image_source(doc: &Document, img: NodeId, rules: &PageRules) -> Option<String> {
    let enlarge = doc
        .closest(img, &rules.enlarge_link)
        .and_then(|link| doc.attr(link, "href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#'));
    enlarge
        .or_else(|| doc.attr(img, "src").map(str::trim))
        .filter(|src| !src.is_empty())
        .map(str::to_string)
}

fn resolve(base: Option<&Url>, src: &str) -> String {
    if src.starts_with("data:") || src.starts_with("blob:") {
        return src.to_string();
    }
    match base.map(|base| base.join(src)) {
        Some(Ok(url)) => url.to_string(),
        _ => src.to_string(),
    }
}

/// Topic → first image map embedded in the listing page, or `None` when the
/// page carries no usable topic list.
pub fn initial_image_map(doc: &Document, rules: &PageRules) -> Option<HashMap<TopicId, String>> {
    let raw = preloaded_json(doc, rules)?;
    let data: Value = match serde_json::from_str(raw) {
        Ok(data) => data,
        Err(_) => {
            warn!("{}", PreviewError::ParseFailed("listing data-preloaded".into()));
            return None;
        }
    };
    let list = match data.get("topic_list") {
        Some(Value::String(nested)) => serde_json::from_str::<Value>(nested).ok()?,
        Some(value) if value.get("topic_list").is_some() => value.clone(),
        Some(_) => data.clone(),
        None if data.get("topics").is_some() => serde_json::json!({ "topic_list": data }),
        None => return None,
    };
    let Some(topics) = list.pointer("/topic_list/topics").and_then(Value::as_array) else {
        debug!("preloaded data has no topics array");
        return None;
    };
    let map: HashMap<TopicId, String> = topics
        .iter()
        .filter_map(|topic| {
            let id = topic.get("id").and_then(Value::as_u64)?;
            let image = topic
                .get("image_url")
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())?;
            Some((TopicId::from_number(id), image.to_string()))
        })
        .collect();
    (!map.is_empty()).then_some(map)
}

/// Rewrites a preview URL to its full-resolution form. URLs that do not
/// parse, or whose rewrite would not be stable, are returned unchanged.
pub fn original_image_url(url: &str) -> String {
    let Some(once) = rewrite_once(url) else {
        return url.to_string();
    };
    match rewrite_once(&once) {
        Some(twice) if twice != once => url.to_string(),
        _ => once,
    }
}

fn rewrite_once(input: &str) -> Option<String> {
    let mut url = Url::parse(input).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    let mut path = url.path().to_string();
    let stripped = SIZE_SUFFIX_RE.replace(&path, ".$1").into_owned();
    if stripped != path {
        path = stripped;
    }
    path = path
        .replacen("/optimized/", "/original/", 1)
        .replacen("/thumbnail/", "/original/", 1);
    let path_changed = path != url.path();
    if path_changed {
        url.set_path(&path);
    }
    let query_dropped = url.query().is_some() && IMAGE_EXT_RE.is_match(url.path());
    if query_dropped {
        url.set_query(None);
    }
    if !path_changed && !query_dropped {
        return Some(input.to_string());
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;

    fn rules() -> PageRules {
        PageRules::compile(&SelectorConfig::default()).unwrap()
    }

    const TOPIC: &str = "https://forum.example/t/pics/42";

    #[test]
    fn rewrite_strips_size_and_query() {
        assert_eq!(
            original_image_url("https://x/optimized/1_100x100.png?v=2"),
            "https://x/original/1.png"
        );
        assert_eq!(
            original_image_url("https://x/optimized/2X/a/abc_2_690x388.JPEG"),
            "https://x/original/2X/a/abc.JPEG"
        );
    }

    #[test]
    fn rewrite_leaves_plain_urls_alone() {
        for url in [
            "https://x/uploads/default/original/1.png",
            "https://x/page?id=3",
            "not a url",
            "data:image/png;base64,AAAA",
        ] {
            assert_eq!(original_image_url(url), url);
        }
        assert_eq!(
            original_image_url("https://x/uploads/photo.png?v=2"),
            "https://x/uploads/photo.png"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        for url in [
            "https://x/optimized/1_100x100.png?v=2",
            "https://x/thumbnail/pic_a_20x20.gif",
            "https://x/a_1x1_2x2.png",
        ] {
            let once = original_image_url(url);
            assert_eq!(original_image_url(&once), once);
        }
    }

    #[test]
    fn filter_drops_decorative_images() {
        let urls = vec![
            "https://forum.example/images/emoji/twitter/smile.png".to_string(),
            "https://forum.example/uploads/photo.jpg".to_string(),
        ];
        let kept: Vec<_> = urls.into_iter().filter(|u| is_content_image(u)).collect();
        assert_eq!(kept, vec!["https://forum.example/uploads/photo.jpg"]);
        assert!(!is_content_image("https://a/user_avatar/x/1.png"));
        assert!(!is_content_image("https://a/images/transparent.png"));
        assert!(!is_content_image("blob:https://a/123"));
    }

    #[test]
    fn preloaded_post_wins() {
        let topic = serde_json::json!({
            "post_stream": { "posts": [ { "cooked":
                "<p><a class=\"lightbox\" href=\"/uploads/original/big.png\"><img src=\"/uploads/optimized/big_10x10.png\"></a><img src=\"/images/emoji/x.png\"></p>"
            } ] }
        });
        let data = serde_json::json!({ "topic_42": topic.to_string() });
        let attr = html_escape(&data.to_string());
        let markup = format!(
            r#"<div id="data-preloaded" data-preloaded="{attr}"></div>
               <div class="post-stream"><div class="topic-post"><div class="cooked"><img src="/other.png"></div></div></div>"#
        );
        assert_eq!(
            extract_images(&markup, TOPIC, &rules()),
            vec!["https://forum.example/uploads/original/big.png"]
        );
    }

    #[test]
    fn falls_back_to_first_post_content() {
        let markup = r#"<div id="data-preloaded" data-preloaded="{broken"></div>
            <div class="post-stream">
              <div class="topic-post"><div class="cooked"><p><img src="/a.png"><img src="https://cdn.example/b.jpg"></p></div></div>
              <div class="topic-post"><div class="cooked"><img src="/reply.png"></div></div>
            </div>"#;
        assert_eq!(
            extract_images(markup, TOPIC, &rules()),
            vec!["https://forum.example/a.png", "https://cdn.example/b.jpg"]
        );
    }

    #[test]
    fn preloaded_without_images_falls_through() {
        let data = serde_json::json!({ "post_stream": { "posts": [ { "cooked": "<p>text only</p>" } ] } });
        let markup = format!(
            r#"<div id="data-preloaded" data-preloaded="{}"></div>
               <div class="post-stream"><div class="topic-post"><div class="cooked"><img src="/c.png"></div></div></div>"#,
            html_escape(&data.to_string())
        );
        assert_eq!(
            extract_images(&markup, TOPIC, &rules()),
            vec!["https://forum.example/c.png"]
        );
    }

    #[test]
    fn nothing_found_is_empty() {
        assert!(extract_images("<p>nothing</p>", TOPIC, &rules()).is_empty());
    }

    #[test]
    fn initial_map_shapes() {
        let nested = serde_json::json!({
            "topic_list": serde_json::json!({ "topic_list": { "topics": [
                { "id": 1, "image_url": "https://a/1.png" },
                { "id": 2, "image_url": null }
            ] } }).to_string()
        });
        let bare = serde_json::json!({ "topics": [ { "id": 3, "image_url": "https://a/3.png" } ] });
        for (data, id, url) in [(nested, 1, "https://a/1.png"), (bare, 3, "https://a/3.png")] {
            let doc = html::parse(&format!(
                r#"<div id="data-preloaded" data-preloaded="{}"></div>"#,
                html_escape(&data.to_string())
            ));
            let map = initial_image_map(&doc, &rules()).unwrap();
            assert_eq!(map.len(), 1);
            assert_eq!(map.get(&TopicId::from_number(id)).map(String::as_str), Some(url));
        }
        assert!(initial_image_map(&html::parse("<div></div>"), &rules()).is_none());
    }

    fn html_escape(raw: &str) -> String {
        raw.replace('&', "&amp;").replace('"', "&quot;")
    }
}
