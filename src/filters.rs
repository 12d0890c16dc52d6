//! Filters - the stages a pipeline is made of
//!
//! Text filters rewrite a string (markdown to HTML, sanitizing). Document
//! filters rewrite the parsed tree (reference linking). The transform moves
//! between the two representations as the stage list requires.

use ammonia::Builder;
use pulldown_cmark::{html, Options, Parser};
use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;

use crate::context::Owner;
use crate::document::{escape_text, Document, NodeData, NodeId};
use crate::reference::{
    kinds, ReferenceKind, CONTAINER_ATTR, KIND_ATTR, MENTION_ALL_ATTR, ORIGINAL_ATTR,
    PRESERVE_ORIGINAL_ATTR, REFERENCE_ATTR,
};

#[derive(Debug, Error)]
#[error("{stage}: {message}")]
pub struct FilterError {
    pub stage: String,
    pub message: String,
}

/// Render-time inputs shared by every stage.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// Owner of the text being rendered, used to build links for bare
    /// references. Visibility never depends on it.
    pub owner: Option<Owner>,
    /// Prefix for generated hrefs, e.g. `https://example.com` or `""`.
    pub base_path: String,
}

impl FilterContext {
    pub fn for_owner(owner: Option<Owner>) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }
}

pub trait TextFilter: Send + Sync {
    fn call(&self, text: String, context: &FilterContext) -> Result<String, FilterError>;
}

pub trait DocumentFilter: Send + Sync {
    fn call(&self, doc: &mut Document, context: &FilterContext) -> Result<(), FilterError>;
}

pub enum Filter {
    Text(Box<dyn TextFilter>),
    Document(Box<dyn DocumentFilter>),
}

// --- Text filters ---

/// CommonMark plus tables, strikethrough, footnotes and task lists. Raw HTML
/// passes through untouched; the sanitize stage deals with it.
pub struct MarkdownFilter;

impl TextFilter for MarkdownFilter {
    fn call(&self, text: String, _context: &FilterContext) -> Result<String, FilterError> {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_FOOTNOTES);
        options.insert(Options::ENABLE_TASKLISTS);

        let parser = Parser::new_ext(&text, options);
        let mut html_output = String::new();
        html::push_html(&mut html_output, parser);
        Ok(html_output)
    }
}

/// Allow-list sanitizer. Strips every `data-*` attribute, so reference
/// markers can only come from the reference filters that run afterwards.
pub struct SanitizeFilter;

impl TextFilter for SanitizeFilter {
    fn call(&self, text: String, _context: &FilterContext) -> Result<String, FilterError> {
        Ok(Builder::default()
            .link_rel(Some("noopener noreferrer nofollow"))
            .clean(&text)
            .to_string())
    }
}

/// Escapes the text and wraps it in a paragraph, line breaks preserved.
pub struct PlainTextFilter;

impl TextFilter for PlainTextFilter {
    fn call(&self, text: String, _context: &FilterContext) -> Result<String, FilterError> {
        let body: Vec<String> = text.trim_end().lines().map(escape_text).collect();
        Ok(format!("<p>{}</p>", body.join("<br>")))
    }
}

// --- Document filters ---

/// Unwraps top-level paragraphs so the output fits inside a single line.
pub struct SingleLineFilter;

impl DocumentFilter for SingleLineFilter {
    fn call(&self, doc: &mut Document, _context: &FilterContext) -> Result<(), FilterError> {
        let paragraphs: Vec<NodeId> = doc
            .children(doc.root())
            .iter()
            .copied()
            .filter(|n| doc.name(*n) == Some("p"))
            .collect();
        for p in paragraphs {
            doc.unwrap_element(p);
        }
        Ok(())
    }
}

/// Text inside these elements is never turned into references.
const IGNORED_ANCESTORS: &[&str] = &["a", "code", "pre", "script", "style"];

/// Path segment shared by qualified references: `group/sub/project`.
const CONTAINER_PATTERN: &str = r"[A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)+";

/// How one kind is written in text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSyntax {
    /// `#7`, `group/proj#7`
    Issue,
    /// `!7`, `group/proj!7`
    MergeRequest,
    /// `$7`, `group/proj$7`
    Snippet,
    /// `1a2b3c4`, `group/proj@1a2b3c4`
    Commit,
    /// `@alice`, `@all`
    User,
}

static ISSUE_RE: LazyLock<Regex> = LazyLock::new(|| sigil_pattern("#"));
static MERGE_REQUEST_RE: LazyLock<Regex> = LazyLock::new(|| sigil_pattern("!"));
static SNIPPET_RE: LazyLock<Regex> = LazyLock::new(|| sigil_pattern("$"));
static COMMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:(?P<container>{})@)?(?P<id>[0-9a-f]{{7,40}})",
        CONTAINER_PATTERN
    ))
    .unwrap()
});
static USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(?P<id>[A-Za-z0-9_](?:[A-Za-z0-9_.\-]*[A-Za-z0-9_])?)").unwrap()
});

fn sigil_pattern(sigil: &str) -> Regex {
    Regex::new(&format!(
        r"(?P<container>{})?{}(?P<id>\d+)",
        CONTAINER_PATTERN,
        regex::escape(sigil)
    ))
    .unwrap()
}

fn is_commit_id(id: &str) -> bool {
    id.bytes().any(|b| b.is_ascii_digit()) && id.bytes().any(|b| b.is_ascii_alphabetic())
}

/// One reference recognized in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    pub kind: ReferenceKind,
    pub container: Option<String>,
    pub id: String,
    /// `@all`: targets the container's members, not a user.
    pub mention_all: bool,
}

impl ReferenceSyntax {
    pub const ALL: [ReferenceSyntax; 5] = [
        Self::Issue,
        Self::MergeRequest,
        Self::Snippet,
        Self::Commit,
        Self::User,
    ];

    pub fn kind(self) -> ReferenceKind {
        ReferenceKind::from(match self {
            Self::Issue => kinds::ISSUE,
            Self::MergeRequest => kinds::MERGE_REQUEST,
            Self::Snippet => kinds::SNIPPET,
            Self::Commit => kinds::COMMIT,
            Self::User => kinds::USER,
        })
    }

    fn regex(self) -> &'static Regex {
        match self {
            Self::Issue => &*ISSUE_RE,
            Self::MergeRequest => &*MERGE_REQUEST_RE,
            Self::Snippet => &*SNIPPET_RE,
            Self::Commit => &*COMMIT_RE,
            Self::User => &*USER_RE,
        }
    }

    fn from_captures(self, caps: &Captures<'_>) -> Option<ParsedReference> {
        let id = caps.name("id")?.as_str();
        // Commit ids mix digits and hex letters; pure numbers and words
        // such as `defaced` are plain text.
        if self == Self::Commit && !is_commit_id(id) {
            return None;
        }
        let mention_all = self == Self::User && id == "all";
        Some(ParsedReference {
            kind: self.kind(),
            container: caps.name("container").map(|m| m.as_str().to_string()),
            id: if mention_all { String::new() } else { id.to_string() },
            mention_all,
        })
    }

    /// Every reference in `text`, with its byte range. Matches glued to
    /// surrounding word characters (`a#1`, `me@host`, `#7x`) are skipped.
    pub fn find_all(self, text: &str) -> Vec<(std::ops::Range<usize>, ParsedReference)> {
        self.regex()
            .captures_iter(text)
            .filter_map(|caps| {
                let m = caps.get(0)?;
                if !at_boundary(text, m.start(), m.end()) {
                    return None;
                }
                self.from_captures(&caps).map(|r| (m.range(), r))
            })
            .collect()
    }

    /// Parse a string that must be exactly one reference (a link target).
    pub fn parse_exact(self, text: &str) -> Option<ParsedReference> {
        let caps = self.regex().captures(text)?;
        let m = caps.get(0)?;
        if m.start() != 0 || m.end() != text.len() {
            return None;
        }
        self.from_captures(&caps)
    }

    fn route(self) -> &'static str {
        match self {
            Self::Issue => "issues",
            Self::MergeRequest => "merge_requests",
            Self::Snippet => "snippets",
            Self::Commit => "commit",
            Self::User => "",
        }
    }

    fn for_kind(kind: &ReferenceKind) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.kind() == *kind)
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'/' | b'&' | b'@') || b >= 0x80
}

fn at_boundary(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let before_ok = start == 0 || !is_word_byte(bytes[start - 1]);
    let after_ok = end == bytes.len() || !(bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_');
    before_ok && after_ok
}

/// Link target for a reference, when one can be built.
fn reference_href(parsed: &ParsedReference, context: &FilterContext) -> Option<String> {
    let syntax = ReferenceSyntax::for_kind(&parsed.kind)?;
    if syntax == ReferenceSyntax::User {
        if parsed.mention_all {
            return None;
        }
        return Some(format!("{}/{}", context.base_path, parsed.id));
    }
    let container = parsed
        .container
        .clone()
        .or_else(|| context.owner.as_ref().map(|o| o.full_path.clone()));
    match (syntax, container) {
        (ReferenceSyntax::Snippet, None) => {
            Some(format!("{}/-/snippets/{}", context.base_path, parsed.id))
        }
        (_, Some(c)) => Some(format!(
            "{}/{}/-/{}/{}",
            context.base_path,
            c,
            syntax.route(),
            parsed.id
        )),
        (_, None) => None,
    }
}

/// Attributes that make an anchor a reference node.
fn reference_attrs(
    parsed: &ParsedReference,
    original: &str,
    context: &FilterContext,
) -> Vec<(String, String)> {
    let kind = parsed.kind.as_str();
    let mut attrs = Vec::new();
    if let Some(href) = reference_href(parsed, context) {
        attrs.push(("href".to_string(), href));
    }
    attrs.push((
        "class".to_string(),
        format!("gfm gfm-{}", kind.replace('_', "-")),
    ));
    attrs.push((REFERENCE_ATTR.to_string(), "true".to_string()));
    attrs.push((KIND_ATTR.to_string(), kind.to_string()));
    if parsed.mention_all {
        attrs.push((MENTION_ALL_ATTR.to_string(), "true".to_string()));
    } else {
        attrs.push((parsed.kind.id_attr(), parsed.id.clone()));
    }
    if let Some(container) = &parsed.container {
        attrs.push((CONTAINER_ATTR.to_string(), container.clone()));
    }
    attrs.push((ORIGINAL_ATTR.to_string(), original.to_string()));
    attrs
}

/// Turns written references of one kind into reference anchors.
pub struct ReferenceFilter {
    syntax: ReferenceSyntax,
}

impl ReferenceFilter {
    pub fn new(syntax: ReferenceSyntax) -> Self {
        Self { syntax }
    }
}

impl DocumentFilter for ReferenceFilter {
    fn call(&self, doc: &mut Document, context: &FilterContext) -> Result<(), FilterError> {
        let text_nodes: Vec<NodeId> = doc
            .descendants(doc.root())
            .into_iter()
            .filter(|n| matches!(doc.data(*n), NodeData::Text(_)))
            .filter(|n| !doc.has_ancestor(*n, IGNORED_ANCESTORS))
            .collect();

        for node in text_nodes {
            let NodeData::Text(text) = doc.data(node) else {
                continue;
            };
            let text = text.clone();
            let found = self.syntax.find_all(&text);
            if found.is_empty() {
                continue;
            }

            let mut replacements = Vec::new();
            let mut cursor = 0;
            for (range, parsed) in found {
                if range.start > cursor {
                    replacements.push(doc.create_text(&text[cursor..range.start]));
                }
                let original = &text[range.clone()];
                let anchor = doc.create_element("a", reference_attrs(&parsed, original, context));
                let label = doc.create_text(original);
                doc.append_child(anchor, label);
                replacements.push(anchor);
                cursor = range.end;
            }
            if cursor < text.len() {
                replacements.push(doc.create_text(&text[cursor..]));
            }
            doc.replace_with(node, replacements);
        }
        Ok(())
    }
}

/// Markdown links whose target is itself a reference (`[the bug](#7)`).
///
/// The author's link text is kept as the visible label and recorded as the
/// original payload with the preserve flag set, so redaction collapses the
/// link to exactly what the author wrote.
pub struct LinkReferenceFilter;

impl DocumentFilter for LinkReferenceFilter {
    fn call(&self, doc: &mut Document, context: &FilterContext) -> Result<(), FilterError> {
        let anchors: Vec<NodeId> = doc
            .descendants(doc.root())
            .into_iter()
            .filter(|n| doc.name(*n) == Some("a") && !doc.has_attr(*n, REFERENCE_ATTR))
            .collect();

        for anchor in anchors {
            let Some(href) = doc.attr(anchor, "href").map(|h| h.trim().to_string()) else {
                continue;
            };
            let parsed = ReferenceSyntax::ALL
                .into_iter()
                .filter(|s| *s != ReferenceSyntax::User)
                .find_map(|s| s.parse_exact(&href));
            let Some(parsed) = parsed else {
                continue;
            };

            let label = doc.text_content(anchor);
            doc.remove_attr(anchor, "href");
            for (name, value) in reference_attrs(&parsed, &label, context) {
                doc.set_attr(anchor, &name, value);
            }
            doc.set_attr(anchor, PRESERVE_ORIGINAL_ATTR, "true");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(filter: &dyn DocumentFilter, html: &str, context: &FilterContext) -> Document {
        let mut doc = Document::parse(html);
        filter.call(&mut doc, context).unwrap();
        doc
    }

    #[test]
    fn test_markdown_keeps_raw_html_for_sanitizer() {
        let out = MarkdownFilter
            .call("*hi* <b>there</b>".to_string(), &FilterContext::default())
            .unwrap();
        assert!(out.contains("<em>hi</em>"));
        assert!(out.contains("<b>there</b>"));
    }

    #[test]
    fn test_sanitize_strips_scripts_and_data_attributes() {
        let out = SanitizeFilter
            .call(
                r#"<p data-reference="true" data-reference-type="issue">x<script>alert(1)</script></p>"#
                    .to_string(),
                &FilterContext::default(),
            )
            .unwrap();
        assert!(!out.contains("script"));
        assert!(!out.contains("data-reference"));
    }

    #[test]
    fn test_plain_text_escapes() {
        let out = PlainTextFilter
            .call("a < b\nc".to_string(), &FilterContext::default())
            .unwrap();
        assert_eq!(out, "<p>a &lt; b<br>c</p>");
    }

    #[test]
    fn test_issue_reference_bare_and_qualified() {
        let doc = run(
            &ReferenceFilter::new(ReferenceSyntax::Issue),
            "<p>fixes #7 and group/proj#8</p>",
            &FilterContext::default(),
        );
        let html = doc.to_html();
        assert!(html.contains(r#"data-issue="7""#));
        assert!(html.contains(r#"data-issue="8" data-project="group/proj""#));
        assert!(html.contains(r#"href="/group/proj/-/issues/8""#));
        assert!(html.contains(r##"data-original="#7""##));
    }

    #[test]
    fn test_bare_reference_href_uses_render_owner() {
        let ctx = FilterContext::for_owner(Some(Owner::new(1, "acme/web")));
        let doc = run(&ReferenceFilter::new(ReferenceSyntax::MergeRequest), "<p>!12</p>", &ctx);
        let html = doc.to_html();
        assert!(html.contains(r#"href="/acme/web/-/merge_requests/12""#));
        assert!(!html.contains("data-project"));
    }

    #[test]
    fn test_references_skip_code_and_links() {
        let doc = run(
            &ReferenceFilter::new(ReferenceSyntax::Issue),
            r##"<p><code>#1</code> <a href="/x">#2</a> a#3 #4x</p>"##,
            &FilterContext::default(),
        );
        assert!(!doc.to_html().contains(REFERENCE_ATTR));
    }

    #[test]
    fn test_commit_requires_digit_and_hex_letter() {
        let found = ReferenceSyntax::Commit.find_all("1234567 and deadbeef1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.id, "deadbeef1");
    }

    #[test]
    fn test_hex_letter_words_are_not_commits() {
        assert!(ReferenceSyntax::Commit
            .find_all("the defaced and effaced facades, deadbeef")
            .is_empty());
        let found = ReferenceSyntax::Commit.find_all("g/p@cafe123 fixed it");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.container.as_deref(), Some("g/p"));
    }

    #[test]
    fn test_user_mentions() {
        let found = ReferenceSyntax::User.find_all("cc @alice. and @all, not me@host");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1.id, "alice");
        assert!(found[1].1.mention_all);
    }

    #[test]
    fn test_link_reference_sets_preserve_flag() {
        let doc = run(
            &LinkReferenceFilter,
            r##"<p><a href="#7" rel="noopener">the <em>bug</em></a></p>"##,
            &FilterContext::default(),
        );
        let html = doc.to_html();
        assert!(html.contains(r#"data-issue="7""#));
        assert!(html.contains(r#"data-original="the bug""#));
        assert!(html.contains(r#"data-preserve-original="true""#));
        assert!(html.contains("<em>bug</em>"));
    }

    #[test]
    fn test_single_line_unwraps_paragraphs() {
        let doc = run(&SingleLineFilter, "<p>a</p><p>b</p>", &FilterContext::default());
        assert_eq!(doc.to_html(), "ab");
    }
}
