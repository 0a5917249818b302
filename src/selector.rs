//! Element-matching rules for the page-structure contract.
//!
//! Supports the subset the configured rules need: type, `#id`, `.class`,
//! `[attr]`, `[attr=value]`, `:first-child`, descendant (` `) and child
//! (`>`) combinators, and comma-separated alternatives.

use std::fmt;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::SelectorConfig;
use crate::dom::{Document, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrTest {
    Exists(String),
    Equals(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
    first_child: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    // parts[i].1 joins parts[i - 1] to parts[i]; unused for i == 0.
    parts: Vec<(Compound, Combinator)>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:?})", self.source)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let alternatives = source
            .split(',')
            .map(|alt| parse_complex(alt.trim()))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("selector: parse {source:?}"))?;
        if alternatives.is_empty() {
            bail!("selector: empty selector");
        }
        Ok(Self {
            source: source.trim().to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Bare `#id` selectors report their id so removed/added roots can be
    /// recognised without walking the tree.
    pub fn simple_id(&self) -> Option<&str> {
        match self.alternatives.as_slice() {
            [complex] if complex.parts.len() == 1 => {
                let compound = &complex.parts[0].0;
                if compound.tag.is_none() && compound.classes.is_empty() && compound.attrs.is_empty()
                {
                    compound.id.as_deref()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        doc.is_element(node)
            && self
                .alternatives
                .iter()
                .any(|complex| match_complex(doc, complex, complex.parts.len() - 1, node))
    }
}

fn match_complex(doc: &Document, complex: &Complex, idx: usize, node: NodeId) -> bool {
    let (compound, combinator) = &complex.parts[idx];
    if !match_compound(doc, compound, node) {
        return false;
    }
    if idx == 0 {
        return true;
    }
    match combinator {
        Combinator::Child => doc
            .parent(node)
            .map(|parent| doc.is_element(parent) && match_complex(doc, complex, idx - 1, parent))
            .unwrap_or(false),
        Combinator::Descendant => {
            let mut current = doc.parent(node);
            while let Some(ancestor) = current {
                if doc.is_element(ancestor) && match_complex(doc, complex, idx - 1, ancestor) {
                    return true;
                }
                current = doc.parent(ancestor);
            }
            false
        }
    }
}

fn match_compound(doc: &Document, compound: &Compound, node: NodeId) -> bool {
    if let Some(tag) = &compound.tag {
        if doc.tag(node) != Some(tag.as_str()) {
            return false;
        }
    }
    if let Some(id) = &compound.id {
        if doc.attr(node, "id") != Some(id.as_str()) {
            return false;
        }
    }
    if !compound.classes.iter().all(|c| doc.has_class(node, c)) {
        return false;
    }
    let attrs_ok = compound.attrs.iter().all(|test| match test {
        AttrTest::Exists(name) => doc.attr(node, name).is_some(),
        AttrTest::Equals(name, value) => doc.attr(node, name) == Some(value.as_str()),
    });
    if !attrs_ok {
        return false;
    }
    if compound.first_child {
        let Some(parent) = doc.parent(node) else {
            return false;
        };
        if doc.element_children(parent).first() != Some(&node) {
            return false;
        }
    }
    true
}

fn parse_complex(input: &str) -> Result<Complex> {
    if input.is_empty() {
        bail!("empty alternative");
    }
    let mut parts = Vec::new();
    let mut pending = Combinator::Descendant;
    let spaced = input.replace('>', " > ");
    for token in spaced.split_ascii_whitespace() {
        if token == ">" {
            if parts.is_empty() {
                bail!("leading child combinator");
            }
            pending = Combinator::Child;
            continue;
        }
        parts.push((parse_compound(token)?, pending));
        pending = Combinator::Descendant;
    }
    if parts.is_empty() {
        bail!("no compound selectors");
    }
    Ok(Complex { parts })
}

fn parse_compound(token: &str) -> Result<Compound> {
    let mut compound = Compound::default();
    let chars: Vec<char> = token.chars().collect();
    let mut i = 0;

    let read_ident = |start: usize| -> (String, usize) {
        let mut end = start;
        while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '-' || chars[end] == '_')
        {
            end += 1;
        }
        (chars[start..end].iter().collect(), end)
    };

    if i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '*') {
        if chars[i] == '*' {
            i += 1;
        } else {
            let (tag, next) = read_ident(i);
            compound.tag = Some(tag.to_ascii_lowercase());
            i = next;
        }
    }

    while i < chars.len() {
        match chars[i] {
            '#' => {
                let (id, next) = read_ident(i + 1);
                if id.is_empty() {
                    bail!("empty id in {token:?}");
                }
                compound.id = Some(id);
                i = next;
            }
            '.' => {
                let (class, next) = read_ident(i + 1);
                if class.is_empty() {
                    bail!("empty class in {token:?}");
                }
                compound.classes.push(class);
                i = next;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| anyhow!("unterminated attribute test in {token:?}"))?;
                let body: String = chars[i + 1..close].iter().collect();
                let test = match body.split_once('=') {
                    Some((name, value)) => AttrTest::Equals(
                        name.trim().to_ascii_lowercase(),
                        value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
                    ),
                    None => AttrTest::Exists(body.trim().to_ascii_lowercase()),
                };
                compound.attrs.push(test);
                i = close + 1;
            }
            ':' => {
                let (pseudo, next) = read_ident(i + 1);
                if pseudo != "first-child" {
                    bail!("unsupported pseudo-class :{pseudo}");
                }
                compound.first_child = true;
                i = next;
            }
            other => bail!("unexpected {other:?} in {token:?}"),
        }
    }
    Ok(compound)
}

/// Compiled page-structure contract.
#[derive(Debug, Clone)]
pub struct PageRules {
    pub topic_link: Selector,
    pub topic_row: Selector,
    pub topic_cell: Selector,
    pub avatar_image: Selector,
    pub preloaded_data: Selector,
    pub main_outlet: Selector,
    pub gallery_image_link: Selector,
    pub gallery_image_fallback: Selector,
    pub enlarge_link: Selector,
    pub first_post_content: Selector,
}

impl PageRules {
    pub fn compile(cfg: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            topic_link: Selector::parse(&cfg.topic_link)?,
            topic_row: Selector::parse(&cfg.topic_row)?,
            topic_cell: Selector::parse(&cfg.topic_cell)?,
            avatar_image: Selector::parse(&cfg.avatar_image)?,
            preloaded_data: Selector::parse(&cfg.preloaded_data)?,
            main_outlet: Selector::parse(&cfg.main_outlet)?,
            gallery_image_link: Selector::parse(&cfg.gallery_image_link)?,
            gallery_image_fallback: Selector::parse(&cfg.gallery_image_fallback)?,
            enlarge_link: Selector::parse(&cfg.enlarge_link)?,
            first_post_content: Selector::parse(&cfg.first_post_content)?,
        })
    }
}
