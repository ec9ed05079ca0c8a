//! HTML cleaning.
//!
//! Strips `<script>`, `<style>` and comment nodes from a captured page and
//! collapses whitespace so the stored `cleaned.html` is compact and free of
//! executable content.
//!
//! Removal is done on the parsed tree, not with regexes over markup: the
//! document is parsed by html5ever (via `scraper`) and re-serialized while
//! skipping pruned nodes. The same pruning serializer is used by
//! [`chunk`](crate::chunk) to render `rawHTML` fragments.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};

use crate::error::ParseError;

/// Default upper bound on accepted HTML input.
pub const DEFAULT_MAX_HTML_BYTES: usize = 10 * 1024 * 1024;

/// Tags removed (with their subtrees) by [`clean_html`].
pub const CLEAN_EXCLUDED_TAGS: &[&str] = &["script", "style"];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("WHITESPACE_RUN: hardcoded regex is valid"));

static NEWLINE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("NEWLINE_RUN: hardcoded regex is valid"));

/// Clean raw HTML with the default size limit.
///
/// # Example
///
/// ```rust
/// use capture_harness_core::clean::clean_html;
///
/// let cleaned = clean_html("<p>Hi</p><script>alert(1)</script>").unwrap();
/// assert!(!cleaned.contains("script"));
/// assert!(cleaned.contains("<p>Hi</p>"));
/// ```
pub fn clean_html(raw: &str) -> Result<String, ParseError> {
    clean_html_with_limit(raw, DEFAULT_MAX_HTML_BYTES)
}

/// Clean raw HTML, rejecting inputs larger than `max_bytes`.
pub fn clean_html_with_limit(raw: &str, max_bytes: usize) -> Result<String, ParseError> {
    if raw.len() > max_bytes {
        return Err(ParseError::Oversized {
            size: raw.len(),
            limit: max_bytes,
        });
    }
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let document = Html::parse_document(raw);
    let mut out = String::with_capacity(raw.len());
    write_pruned(&document.root_element(), CLEAN_EXCLUDED_TAGS, &mut out);

    let collapsed = WHITESPACE_RUN.replace_all(&out, " ");
    Ok(NEWLINE_RUN.replace_all(&collapsed, "\n").into_owned())
}

/// Serialize `element` (outer HTML) while skipping comments and any
/// descendant whose tag is in `excluded`.
///
/// Attributes are written in name order so output is stable across runs.
pub fn write_pruned(element: &ElementRef, excluded: &[&str], out: &mut String) {
    let name = element.value().name();
    if excluded.contains(&name) {
        return;
    }

    out.push('<');
    out.push_str(name);
    let mut attrs: Vec<(&str, &str)> = element.value().attrs().collect();
    attrs.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (key, value) in attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_into(value, true, out);
        out.push('"');
    }
    out.push('>');

    if VOID_ELEMENTS.contains(&name) {
        return;
    }

    for child in element.children() {
        use scraper::node::Node;

        match child.value() {
            Node::Text(text) => escape_into(text, false, out),
            Node::Element(_) => {
                if let Some(child_elem) = ElementRef::wrap(child) {
                    write_pruned(&child_elem, excluded, out);
                }
            }
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Render `element` with [`write_pruned`] into a new string.
pub fn pruned_html(element: &ElementRef, excluded: &[&str]) -> String {
    let mut out = String::new();
    write_pruned(element, excluded, &mut out);
    out
}

fn escape_into(s: &str, attr: bool, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_script_style_and_comments() {
        let raw = r#"<html><head><style>body{}</style></head><body>
            <!-- tracking -->
            <div id="a">Keep me</div>
            <script>var x = "<b>";</script>
        </body></html>"#;
        let cleaned = clean_html(raw).unwrap();
        assert!(!cleaned.contains("<script"));
        assert!(!cleaned.contains("<style"));
        assert!(!cleaned.contains("tracking"));
        assert!(cleaned.contains(r#"<div id="a">Keep me</div>"#));
    }

    #[test]
    fn test_collapses_whitespace() {
        let cleaned = clean_html("<p>a    b\n\n\n\nc</p>").unwrap();
        assert!(cleaned.contains("<p>a b c</p>"));
        assert!(!cleaned.contains("  "));
    }

    #[test]
    fn test_escapes_text_and_attrs() {
        let cleaned = clean_html(r#"<p title="a&quot;b">1 &lt; 2</p>"#).unwrap();
        assert!(cleaned.contains(r#"title="a&quot;b""#));
        assert!(cleaned.contains("1 &lt; 2"));
    }

    #[test]
    fn test_void_elements_not_closed() {
        let cleaned = clean_html(r#"<p>x<br>y<img src="a.png"></p>"#).unwrap();
        assert!(cleaned.contains("<br>"));
        assert!(!cleaned.contains("</br>"));
        assert!(!cleaned.contains("</img>"));
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert_eq!(clean_html("   "), Err(ParseError::Empty));
        assert_eq!(
            clean_html_with_limit("<p>hello</p>", 4),
            Err(ParseError::Oversized { size: 12, limit: 4 })
        );
    }

    #[test]
    fn test_deterministic_attr_order() {
        let a = clean_html(r#"<div class="c" id="x">t</div>"#).unwrap();
        let b = clean_html(r#"<div id="x" class="c">t</div>"#).unwrap();
        assert_eq!(a, b);
    }
}
