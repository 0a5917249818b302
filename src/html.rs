//! Tolerant HTML parser producing a [`Document`].
//!
//! Good enough for forum markup: void elements, raw-text elements, implicit
//! closing of list items and table cells, and character references. Anything
//! it cannot make sense of is skipped rather than rejected.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::dom::{Document, NodeId};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid entity regex")
});

pub fn parse(input: &str) -> Document {
    let mut doc = Document::new();
    let mut stack: Vec<NodeId> = vec![doc.root()];
    let bytes = input.as_bytes();
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] != b'<' {
            let next = find_byte(bytes, idx, b'<').unwrap_or(bytes.len());
            push_text(&mut doc, &stack, &decode_entities(&input[idx..next]));
            idx = next;
            continue;
        }

        if input[idx..].starts_with("<!--") {
            idx = input[idx + 4..]
                .find("-->")
                .map(|p| idx + 4 + p + 3)
                .unwrap_or(bytes.len());
            continue;
        }

        if starts_with_any(bytes, idx, &[b"<!", b"<?"]) {
            idx = find_byte(bytes, idx, b'>').map(|p| p + 1).unwrap_or(bytes.len());
            continue;
        }

        if bytes.get(idx + 1) == Some(&b'/') {
            let (name, after) = read_name(input, idx + 2);
            idx = find_byte(bytes, after, b'>').map(|p| p + 1).unwrap_or(bytes.len());
            if !name.is_empty() {
                close_element(&doc, &mut stack, &name);
            }
            continue;
        }

        if !bytes
            .get(idx + 1)
            .map(|b| b.is_ascii_alphabetic())
            .unwrap_or(false)
        {
            push_text(&mut doc, &stack, "<");
            idx += 1;
            continue;
        }

        let (name, after_name) = read_name(input, idx + 1);
        let (attrs, self_closing, after_tag) = read_attributes(input, after_name);
        idx = after_tag;

        implicit_close(&doc, &mut stack, &name);
        let element = doc.create_element(&name);
        for (key, value) in attrs {
            if doc.attr(element, &key).is_none() {
                doc.set_attr(element, &key, &value);
            }
        }
        let parent = *stack.last().unwrap_or(&doc.root());
        doc.append_child(parent, element);

        if RAW_TEXT_ELEMENTS.contains(&name.as_str()) && !self_closing {
            let (content, after_raw) = read_raw_text(input, idx, &name);
            let text = if name == "script" || name == "style" {
                content.to_string()
            } else {
                decode_entities(content)
            };
            if !text.is_empty() {
                let node = doc.create_text(&text);
                doc.append_child(element, node);
            }
            idx = after_raw;
            continue;
        }

        if !self_closing && !VOID_ELEMENTS.contains(&name.as_str()) {
            stack.push(element);
        }
    }

    doc
}

pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    ENTITY_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match body {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some('\u{a0}'),
                    _ => None,
                }
            };
            decoded
                .map(|c| c.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn push_text(doc: &mut Document, stack: &[NodeId], text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let parent = *stack.last().unwrap_or(&doc.root());
    let node = doc.create_text(text);
    doc.append_child(parent, node);
}

fn close_element(doc: &Document, stack: &mut Vec<NodeId>, name: &str) {
    if let Some(pos) = stack
        .iter()
        .rposition(|&id| doc.tag(id) == Some(name))
    {
        if pos > 0 {
            stack.truncate(pos);
        }
    }
}

fn implicit_close(doc: &Document, stack: &mut Vec<NodeId>, name: &str) {
    let (targets, boundaries): (&[&str], &[&str]) = match name {
        "li" => (&["li"], &["ul", "ol"]),
        "td" | "th" => (&["td", "th"], &["tr", "table"]),
        "tr" => (&["tr", "td", "th"], &["table", "tbody", "thead", "tfoot"]),
        "tbody" | "thead" | "tfoot" => (&["tbody", "thead", "tfoot", "tr", "td", "th"], &["table"]),
        "p" => (&["p"], &["div", "td", "li", "blockquote", "section", "article"]),
        _ => return,
    };
    for pos in (1..stack.len()).rev() {
        let Some(tag) = doc.tag(stack[pos]) else {
            continue;
        };
        if boundaries.contains(&tag) {
            return;
        }
        if targets.contains(&tag) {
            // Keep searching for an outer target within the same boundary so
            // `<tr><td>` closes both when a new row starts.
            let mut cut = pos;
            for outer in (1..pos).rev() {
                let Some(outer_tag) = doc.tag(stack[outer]) else {
                    continue;
                };
                if boundaries.contains(&outer_tag) {
                    break;
                }
                if targets.contains(&outer_tag) {
                    cut = outer;
                }
            }
            stack.truncate(cut);
            return;
        }
    }
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|p| p + from)
}

fn starts_with_any(bytes: &[u8], idx: usize, prefixes: &[&[u8]]) -> bool {
    prefixes
        .iter()
        .any(|prefix| bytes.get(idx..idx + prefix.len()) == Some(*prefix))
}

fn read_name(input: &str, from: usize) -> (String, usize) {
    let bytes = input.as_bytes();
    let mut end = from;
    while end < bytes.len()
        && !bytes[end].is_ascii_whitespace()
        && bytes[end] != b'>'
        && bytes[end] != b'/'
    {
        end += 1;
    }
    (input[from..end].to_ascii_lowercase(), end)
}

fn read_attributes(input: &str, from: usize) -> (Vec<(String, String)>, bool, usize) {
    let bytes = input.as_bytes();
    let mut attrs = Vec::new();
    let mut idx = from;

    loop {
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= bytes.len() {
            return (attrs, false, idx);
        }
        match bytes[idx] {
            b'>' => return (attrs, false, idx + 1),
            b'/' if bytes.get(idx + 1) == Some(&b'>') => return (attrs, true, idx + 2),
            b'/' => {
                idx += 1;
                continue;
            }
            _ => {}
        }

        let start = idx;
        while idx < bytes.len()
            && !bytes[idx].is_ascii_whitespace()
            && !matches!(bytes[idx], b'=' | b'>' | b'/')
        {
            idx += 1;
        }
        if idx == start {
            idx += 1;
            continue;
        }
        let name = input[start..idx].to_ascii_lowercase();

        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if bytes.get(idx) != Some(&b'=') {
            attrs.push((name, String::new()));
            continue;
        }
        idx += 1;
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }

        let value = match bytes.get(idx) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                let end = find_byte(bytes, idx + 1, quote).unwrap_or(bytes.len());
                let raw = &input[idx + 1..end];
                idx = (end + 1).min(bytes.len());
                raw
            }
            _ => {
                let begin = idx;
                while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() && bytes[idx] != b'>' {
                    idx += 1;
                }
                &input[begin..idx]
            }
        };
        attrs.push((name, decode_entities(value)));
    }
}

fn read_raw_text<'a>(input: &'a str, from: usize, name: &str) -> (&'a str, usize) {
    let closing = format!("</{name}");
    let lower = input[from..].to_ascii_lowercase();
    match lower.find(&closing) {
        Some(pos) => {
            let end = from + pos;
            let after = find_byte(input.as_bytes(), end, b'>')
                .map(|p| p + 1)
                .unwrap_or(input.len());
            (&input[from..end], after)
        }
        None => (&input[from..], input.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;

    #[test]
    fn parses_attributes_and_entities() {
        let doc = parse(r#"<div id="data" data-preloaded="{&quot;a&quot;:1}" hidden><img src=/x.png alt='A &amp; B'></div>"#);
        let div = doc.find_by_id("data").unwrap();
        assert_eq!(doc.attr(div, "data-preloaded"), Some(r#"{"a":1}"#));
        assert_eq!(doc.attr(div, "hidden"), Some(""));
        let img = doc.query(div, &Selector::parse("img").unwrap()).unwrap();
        assert_eq!(doc.attr(img, "src"), Some("/x.png"));
        assert_eq!(doc.attr(img, "alt"), Some("A & B"));
        assert!(doc.children(img).is_empty());
    }

    #[test]
    fn table_cells_close_implicitly() {
        let doc = parse("<table><tr><td>a<td>b<tr><td>c</table>");
        let rows = doc.query_all(doc.root(), &Selector::parse("tr").unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!(doc.element_children(rows[0]).len(), 2);
        assert_eq!(doc.text_content(rows[1]), "c");
    }

    #[test]
    fn raw_text_is_not_parsed() {
        let doc = parse("<script>if (a < b) { x = '<img>'; }</script><img src=y>");
        let imgs = doc.query_all(doc.root(), &Selector::parse("img").unwrap());
        assert_eq!(imgs.len(), 1);
    }

    #[test]
    fn stray_end_tags_are_ignored() {
        let doc = parse("<div><span>a</p></span></div></div><p>b</p>");
        let body = doc.root();
        assert_eq!(doc.element_children(body).len(), 2);
    }

    #[test]
    fn numeric_references() {
        assert_eq!(decode_entities("&#39;x&#x41;&bogus;"), "'xA&bogus;");
    }
}
