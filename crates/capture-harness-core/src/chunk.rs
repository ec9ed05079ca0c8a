//! Structural HTML chunker.
//!
//! Turns a captured page into a bounded list of [`ContentChunk`]s that
//! summarize the layout of the page body. The output is small enough to be
//! shipped to the analysis service alongside a screenshot.
//!
//! # Algorithm
//!
//! 1. Clean the input with [`clean_html`].
//! 2. Starting at `<body>` (depth 0), build a tree of retained elements down
//!    to depth [`MAX_DEPTH`]. Elements in [`EXCLUDED_TAGS`] are pruned with
//!    their whole subtree.
//! 3. Each retained node records its tag, the allow-listed attributes in
//!    [`ALLOWED_ATTRS`] that are non-empty, its trimmed text (truncated to
//!    [`TEXT_LIMIT`] characters plus `"..."`), and for [`CONTAINER_TAGS`]
//!    its pruned outer HTML when shorter than [`RAW_HTML_LIMIT`] characters.
//! 4. Flatten: walk the tree and emit nodes at [`TARGET_DEPTH`]. A shallower
//!    node with no retained children is a leaf and is emitted where it
//!    stands. Only nodes carrying text or attributes are emitted, and the
//!    walk stops after [`MAX_CHUNKS`] chunks in document order.
//!
//! # Guarantees
//!
//! - Identical input yields an identical document.
//! - No chunk, child, or `rawHTML` fragment contains an excluded tag.
//! - `text` is at most `TEXT_LIMIT + 3` characters.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use crate::clean::{clean_html_with_limit, pruned_html, DEFAULT_MAX_HTML_BYTES};
use crate::error::ParseError;
use crate::models::{CaptureMetadata, ChunkedDocument, ContentChunk, SCHEMA_VERSION};

pub use crate::clean::clean_html;

/// Tags pruned together with their subtrees.
pub const EXCLUDED_TAGS: &[&str] = &["script", "style", "meta", "noscript", "link", "path", "svg"];

/// Attributes copied into [`ContentChunk::attrs`].
pub const ALLOWED_ATTRS: &[&str] = &["id", "class", "href", "src", "alt", "title"];

/// Tags whose serialized form may be kept as `rawHTML`.
pub const CONTAINER_TAGS: &[&str] = &["div", "section", "article", "main", "header", "footer"];

/// Deepest level (body = 0) included in the tree.
pub const MAX_DEPTH: usize = 4;

/// Level at which the flattener emits chunks.
pub const TARGET_DEPTH: usize = 3;

/// Maximum number of emitted chunks.
pub const MAX_CHUNKS: usize = 100;

/// Maximum characters of text before truncation.
pub const TEXT_LIMIT: usize = 50;

/// `rawHTML` is kept only when strictly shorter than this many characters.
pub const RAW_HTML_LIMIT: usize = 500;

const ELLIPSIS: &str = "...";

static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("BODY: hardcoded selector is valid"));

/// Clean and chunk a captured page.
///
/// # Example
///
/// ```rust
/// use capture_harness_core::chunk::chunk_html;
/// use capture_harness_core::models::CaptureMetadata;
///
/// let meta = CaptureMetadata {
///     url: "https://example.com".into(),
///     title: "Example".into(),
///     timestamp: "2024-01-01T00-00-00-000Z".into(),
///     capture_time: "2024-01-01T00:00:00.000Z".into(),
///     original_path: None,
/// };
/// let doc = chunk_html(r#"<body><a href="/x">Link</a></body>"#, meta).unwrap();
/// assert_eq!(doc.structure.len(), 1);
/// assert_eq!(doc.structure[0].tag, "a");
/// ```
pub fn chunk_html(html: &str, metadata: CaptureMetadata) -> Result<ChunkedDocument, ParseError> {
    chunk_html_with_limit(html, metadata, DEFAULT_MAX_HTML_BYTES)
}

/// [`chunk_html`] with an explicit input size limit.
pub fn chunk_html_with_limit(
    html: &str,
    metadata: CaptureMetadata,
    max_bytes: usize,
) -> Result<ChunkedDocument, ParseError> {
    let cleaned = clean_html_with_limit(html, max_bytes)?;
    let document = Html::parse_document(&cleaned);
    let body = document.select(&BODY).next().ok_or(ParseError::MissingBody)?;

    let tree = build_node(&body, 0);
    let mut structure = Vec::new();
    flatten(tree, 0, &mut structure);

    Ok(ChunkedDocument {
        schema_version: SCHEMA_VERSION,
        metadata,
        structure,
    })
}

fn build_node(element: &ElementRef, depth: usize) -> ContentChunk {
    let tag = element.value().name().to_string();

    let attrs: BTreeMap<String, String> = ALLOWED_ATTRS
        .iter()
        .filter_map(|name| {
            element
                .value()
                .attr(name)
                .filter(|v| !v.is_empty())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let mut text = String::new();
    collect_text(element, &mut text);
    let text = truncate_text(text.trim());

    let raw_html = if CONTAINER_TAGS.contains(&tag.as_str()) {
        let rendered = pruned_html(element, EXCLUDED_TAGS);
        (rendered.chars().count() < RAW_HTML_LIMIT).then_some(rendered)
    } else {
        None
    };

    let children = if depth < MAX_DEPTH {
        element
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|child| !EXCLUDED_TAGS.contains(&child.value().name()))
            .map(|child| build_node(&child, depth + 1))
            .collect()
    } else {
        Vec::new()
    };

    ContentChunk {
        tag,
        attrs: (!attrs.is_empty()).then_some(attrs),
        text: (!text.is_empty()).then_some(text),
        raw_html,
        children,
    }
}

/// Concatenate descendant text, skipping excluded subtrees.
fn collect_text(element: &ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_elem) = ElementRef::wrap(child) {
            if !EXCLUDED_TAGS.contains(&child_elem.value().name()) {
                collect_text(&child_elem, out);
            }
        }
    }
}

fn truncate_text(text: &str) -> String {
    if text.chars().count() > TEXT_LIMIT {
        let mut short: String = text.chars().take(TEXT_LIMIT).collect();
        short.push_str(ELLIPSIS);
        short
    } else {
        text.to_string()
    }
}

fn flatten(node: ContentChunk, depth: usize, out: &mut Vec<ContentChunk>) {
    if out.len() >= MAX_CHUNKS {
        return;
    }
    if depth == TARGET_DEPTH || node.children.is_empty() {
        if node.has_content() {
            out.push(node);
        }
        return;
    }
    for child in node.children {
        flatten(child, depth + 1, out);
    }
}
