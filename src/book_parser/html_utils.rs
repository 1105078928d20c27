//! HTML scrubbing and the footnote rewrite engine.
//!
//! Fragments are cleaned on a real DOM; the footnote marker rewrite and
//! XHTML sanitation are string-level, in a fixed order.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};

// Compiled-once regex caches.
fn re_note_id() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^note\d+$").unwrap())
}

fn re_marker() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"((?:\(\d+\)|\[\d+\]))?\s*\[(note\d+)\]").unwrap())
}

fn re_note_anchor() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"<a[^>]*href=["']#(note\d+)["'][^>]*>([^<]*)</a>"#).unwrap())
}

fn re_empty_p() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?i)<p[^>]*>(\s|&nbsp;|&#160;|<br\s*/?>)*</p>").unwrap())
}

fn re_br_runs() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?i)(<br\s*/?>\s*){3,}").unwrap())
}

fn re_newline_runs() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

pub(crate) fn re_style_url() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"url\(['"]?([^'")\s]+)"#).unwrap())
}

// Selector caches.
fn sel_target_blank() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse(r#"[target="_blank"], [target="__blank"]"#).unwrap())
}

fn sel_hidden() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse(".d-none, .d-md-block, .flex, .note-content").unwrap())
}

fn sel_containers() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("p, div, span").unwrap())
}

fn sel_img() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("img").unwrap())
}

fn sel_note_div() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("div[id]").unwrap())
}

fn sel_note_real() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse("span.note-content_real").unwrap())
}

fn sel_note_reg() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    S.get_or_init(|| Selector::parse(".note-reg").unwrap())
}

/// Footnote definitions in document order. Insertion order is the
/// iteration order; duplicate ids keep the first definition.
#[derive(Debug, Default, Clone)]
pub struct FootnoteMap {
    entries: Vec<(String, String)>,
}

impl FootnoteMap {
    pub fn insert(&mut self, id: &str, content: &str) {
        if !self.contains(id) {
            self.entries.push((id.to_string(), content.to_string()));
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == id)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── DOM surgery ────────────────────────────────────────────────

pub(crate) fn remove_comment_nodes(doc: &mut Html) {
    let ids: Vec<_> = doc
        .tree
        .nodes()
        .filter(|n| matches!(n.value(), scraper::Node::Comment(_)))
        .map(|n| n.id())
        .collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

pub(crate) fn remove_selected(doc: &mut Html, selector: &Selector) {
    let ids: Vec<_> = doc.select(selector).map(|e| e.id()).collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

pub(crate) fn remove_blank_targets(doc: &mut Html) {
    remove_selected(doc, sel_target_blank());
}

pub(crate) fn remove_hidden_elements(doc: &mut Html) {
    remove_selected(doc, sel_hidden());
}

/// Drops `p`/`div`/`span` elements that carry no text and no image.
/// Checked lazily in document order so a container emptied by an earlier
/// removal is judged on its remaining content.
pub(crate) fn remove_empty_containers(doc: &mut Html) {
    let ids: Vec<_> = doc.select(sel_containers()).map(|e| e.id()).collect();
    for id in ids {
        let is_empty = doc
            .tree
            .get(id)
            .and_then(scraper::ElementRef::wrap)
            .map(|el| {
                el.text().all(|t| t.trim().is_empty()) && el.select(sel_img()).next().is_none()
            })
            .unwrap_or(false);
        if is_empty {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

/// Scans `div[id=note<digits>]` definitions without touching the tree.
pub(crate) fn collect_footnotes(doc: &Html) -> FootnoteMap {
    let mut map = FootnoteMap::default();
    for div in doc.select(sel_note_div()) {
        let Some(id) = div.value().attr("id") else {
            continue;
        };
        if !re_note_id().is_match(id) {
            continue;
        }
        let content = match div.select(sel_note_real()).next() {
            Some(span) => span.text().collect::<String>().trim().to_string(),
            None => div.text().collect::<String>().trim().to_string(),
        };
        if !content.is_empty() {
            map.insert(id, &content);
        }
    }
    map
}

/// Removes the footnote definition divs and any `.note-reg` container.
pub(crate) fn strip_footnote_divs(doc: &mut Html) {
    let ids: Vec<_> = doc
        .select(sel_note_div())
        .filter(|div| {
            div.value()
                .attr("id")
                .map(|id| re_note_id().is_match(id))
                .unwrap_or(false)
        })
        .map(|e| e.id())
        .collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
    remove_selected(doc, sel_note_reg());
}

// ── Public content engine ──────────────────────────────────────

/// Removes comments, pop-out links, hidden elements and content-free
/// containers from an HTML fragment.
pub fn clean_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let mut doc = Html::parse_fragment(html);
    remove_comment_nodes(&mut doc);
    remove_blank_targets(&mut doc);
    remove_hidden_elements(&mut doc);
    remove_empty_containers(&mut doc);
    doc.root_element().inner_html()
}

/// String-level XHTML sanitation; the steps are order-sensitive.
pub fn sanitize_xhtml(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let safe = html.replace("&nbsp;", "&#160;");
    let safe = re_empty_p().replace_all(&safe, "");
    let safe = re_br_runs().replace_all(&safe, "<br/><br/>");
    let safe = re_newline_runs().replace_all(&safe, "\n\n");
    safe.trim().to_string()
}

pub(crate) fn collapse_newlines(html: &str) -> String {
    re_newline_runs().replace_all(html, "\n\n").into_owned()
}

/// Footnote definitions of a fragment: `note<digits>` div ids mapped to
/// their text, preferring a `span.note-content_real` child.
pub fn extract_footnote_definitions(html: &str) -> FootnoteMap {
    collect_footnotes(&Html::parse_fragment(html))
}

/// Rewrites `[noteN]` markers and `#noteN` anchors into chapter-scoped
/// noteref links. Returns the rewritten HTML and the ids that were used,
/// in first-use order without duplicates.
pub fn convert_footnote_markers(
    html: &str,
    map: &FootnoteMap,
    slug: &str,
) -> (String, Vec<String>) {
    let mut used: Vec<String> = Vec::new();
    let mut counter: usize = 1;

    let pass_one = re_marker().replace_all(html, |caps: &regex::Captures| {
        let note_id = caps[2].to_string();
        if !map.contains(&note_id) {
            return caps[0].to_string();
        }
        if !used.iter().any(|u| *u == note_id) {
            used.push(note_id.clone());
        }
        let label = match caps.get(1) {
            Some(m) => m.as_str().trim().to_string(),
            None => {
                let label = format!("[{counter}]");
                counter += 1;
                label
            }
        };
        noteref_link(slug, &note_id, &label)
    });

    let pass_two = re_note_anchor().replace_all(&pass_one, |caps: &regex::Captures| {
        let note_id = caps[1].to_string();
        if !map.contains(&note_id) {
            return caps[0].to_string();
        }
        if !used.iter().any(|u| *u == note_id) {
            used.push(note_id.clone());
        }
        let text = caps[2].trim().to_string();
        let label = if text.is_empty() {
            let label = format!("[{counter}]");
            counter += 1;
            label
        } else {
            text
        };
        noteref_link(slug, &note_id, &label)
    });

    (pass_two.into_owned(), used)
}

fn noteref_link(slug: &str, note_id: &str, label: &str) -> String {
    format!(
        r##"<a epub:type="noteref" href="#{slug}_{note_id}" class="footnote-link">{label}</a>"##
    )
}

/// Emits one aside per used id, then (optionally) one per unused
/// definition, in map insertion order.
pub fn generate_footnote_asides(
    used: &[String],
    map: &FootnoteMap,
    slug: &str,
    include_unused: bool,
) -> String {
    let mut out = String::new();
    for id in used {
        if let Some(content) = map.get(id) {
            out.push_str(&aside_block(slug, id, content, "Ghi chú"));
        }
    }
    if include_unused {
        for (id, content) in map.iter() {
            if !used.iter().any(|u| u == id) {
                out.push_str(&aside_block(slug, id, content, "Ghi chú (Thêm)"));
            }
        }
    }
    out
}

fn aside_block(slug: &str, id: &str, content: &str, header: &str) -> String {
    format!(
        "\n<aside id=\"{slug}_{id}\" epub:type=\"footnote\" class=\"footnote-content\">\n  <div class=\"note-header\">{header}:</div>\n  <p>{content}</p>\n</aside>\n"
    )
}

/// Full footnote pipeline over one fragment: extract and strip the
/// definitions, rewrite every marker, append the asides (unused ones
/// included).
pub fn process_footnotes(html: &str, slug: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let mut doc = Html::parse_fragment(html);
    let map = collect_footnotes(&doc);
    strip_footnote_divs(&mut doc);
    let serialized = doc.root_element().inner_html();

    let (converted, used) = convert_footnote_markers(&serialized, &map, slug);
    let asides = generate_footnote_asides(&used, &map, slug, true);
    format!("{converted}{asides}")
}

pub fn process_content(html: &str, slug: &str) -> String {
    sanitize_xhtml(&process_footnotes(&clean_html(html), slug))
}
