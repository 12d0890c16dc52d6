//! Rendered Document Tree
//!
//! An arena-backed HTML fragment tree. Pipelines produce it, the cache
//! serializes it, the redaction pass mutates it in place.
//!
//! The parser is deliberately lenient: it accepts the well-formed output of
//! the sanitizer and anything this module serialized itself, and never fails
//! on malformed input (stray close tags are dropped, unclosed elements are
//! closed at the end of input).

use uuid::Uuid;

/// Elements that never have children or a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Elements whose content is kept verbatim (no entity decoding, no tags).
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Index of a node inside its owning [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Identity of a document for the lifetime of one process.
///
/// Every parsed or freshly built document gets a new id, so two documents
/// with identical markup are still distinct for context lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Uuid);

impl DocumentId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    /// The synthetic root every fragment hangs from.
    Fragment,
    Element {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An HTML fragment.
#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    nodes: Vec<Node>,
    root: NodeId,
}

/// A clone is a separate document: same tree, same node ids, new
/// [`DocumentId`].
impl Clone for Document {
    fn clone(&self) -> Self {
        Self {
            id: DocumentId::new(),
            nodes: self.nodes.clone(),
            root: self.root,
        }
    }
}

impl Document {
    /// Create an empty fragment.
    pub fn new() -> Self {
        Self {
            id: DocumentId::new(),
            nodes: vec![Node {
                data: NodeData::Fragment,
                parent: None,
                children: vec![],
            }],
            root: NodeId(0),
        }
    }

    /// Parse an HTML fragment.
    pub fn parse(html: &str) -> Self {
        let mut doc = Self::new();
        Parser::new(html, &mut doc).run();
        doc
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0].data
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Tag name, for element nodes.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id.0].data {
            NodeData::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn attr(&self, id: NodeId, attr: &str) -> Option<&str> {
        match &self.nodes[id.0].data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == attr)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn has_attr(&self, id: NodeId, attr: &str) -> bool {
        self.attr(id, attr).is_some()
    }

    /// All attributes of an element, in source order.
    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        match &self.nodes[id.0].data {
            NodeData::Element { attrs, .. } => attrs,
            _ => &[],
        }
    }

    pub fn set_attr(&mut self, id: NodeId, attr: &str, value: impl Into<String>) {
        if let NodeData::Element { attrs, .. } = &mut self.nodes[id.0].data {
            let value = value.into();
            match attrs.iter_mut().find(|(k, _)| k == attr) {
                Some(slot) => slot.1 = value,
                None => attrs.push((attr.to_string(), value)),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, attr: &str) {
        if let NodeData::Element { attrs, .. } = &mut self.nodes[id.0].data {
            attrs.retain(|(k, _)| k != attr);
        }
    }

    /// Allocate a detached node. Attach it with [`Document::append_child`]
    /// or [`Document::replace_with`].
    pub fn create(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            data,
            parent: None,
            children: vec![],
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_element(&mut self, name: &str, attrs: Vec<(String, String)>) -> NodeId {
        self.create(NodeData::Element {
            name: name.to_string(),
            attrs,
        })
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.create(NodeData::Text(text.into()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Remove a node from its parent. The node and its subtree stay in the
    /// arena but are no longer reachable from the root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != id);
        }
    }

    /// Put `replacements` where `id` was, in order, and detach `id`.
    pub fn replace_with(&mut self, id: NodeId, replacements: Vec<NodeId>) {
        let Some(parent) = self.nodes[id.0].parent else {
            return;
        };
        for r in &replacements {
            self.detach(*r);
        }
        let siblings = &self.nodes[parent.0].children;
        let Some(pos) = siblings.iter().position(|c| *c == id) else {
            return;
        };
        for r in &replacements {
            self.nodes[r.0].parent = Some(parent);
        }
        self.nodes[parent.0]
            .children
            .splice(pos..=pos, replacements);
        self.nodes[id.0].parent = None;
    }

    /// Replace an element with its own children.
    pub fn unwrap_element(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for c in &children {
            self.nodes[c.0].parent = None;
        }
        self.replace_with(id, children);
    }

    /// Replace a node with a single text node.
    pub fn replace_with_text(&mut self, id: NodeId, text: impl Into<String>) -> NodeId {
        let text = self.create_text(text);
        self.replace_with(id, vec![text]);
        text
    }

    /// True when the node is reachable from the root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut cur = id;
        loop {
            if cur == self.root {
                return true;
            }
            match self.nodes[cur.0].parent {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// Pre-order walk of `id` and everything below it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            out.push(cur);
            for child in self.nodes[cur.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// True when `id` has an ancestor element named one of `names`.
    pub fn has_ancestor(&self, id: NodeId, names: &[&str]) -> bool {
        let mut cur = self.nodes[id.0].parent;
        while let Some(p) = cur {
            if let Some(name) = self.name(p) {
                if names.contains(&name) {
                    return true;
                }
            }
            cur = self.nodes[p.0].parent;
        }
        false
    }

    /// Concatenated text of a subtree.
    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|n| match &self.nodes[n.0].data {
                NodeData::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn to_html(&self) -> String {
        self.inner_html(self.root)
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        let raw = self
            .name(id)
            .is_some_and(|n| RAW_TEXT_ELEMENTS.contains(&n));
        for child in &self.nodes[id.0].children {
            if raw {
                if let NodeData::Text(t) = &self.nodes[child.0].data {
                    out.push_str(t);
                    continue;
                }
            }
            self.write_node(*child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id.0].data {
            NodeData::Fragment => out.push_str(&self.inner_html(id)),
            NodeData::Text(t) => escape_into(t, false, out),
            NodeData::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeData::Element { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    escape_into(v, true, out);
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&name.as_str()) {
                    return;
                }
                out.push_str(&self.inner_html(id));
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape text the way the sanitizer's serializer does, so that parsing and
/// re-serializing sanitized output is byte-stable.
pub fn escape_into(s: &str, attr_mode: bool, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attr_mode => out.push_str("&quot;"),
            '<' if !attr_mode => out.push_str("&lt;"),
            '>' if !attr_mode => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_into(s, false, &mut out);
    out
}

/// Decode the character references the serializer can produce, plus numeric
/// references. Unknown references are left as written.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|end| *end <= 12).and_then(|end| {
            let entity = &rest[1..end];
            decode_entity(entity).map(|c| (c, end + 1))
        });
        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

struct Parser<'a, 'd> {
    input: &'a str,
    pos: usize,
    doc: &'d mut Document,
    open: Vec<NodeId>,
}

impl<'a, 'd> Parser<'a, 'd> {
    fn new(input: &'a str, doc: &'d mut Document) -> Self {
        let root = doc.root();
        Self {
            input,
            pos: 0,
            doc,
            open: vec![root],
        }
    }

    fn current(&self) -> NodeId {
        self.open.last().copied().unwrap_or(self.doc.root())
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn run(mut self) {
        while self.pos < self.input.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.comment();
            } else if rest.starts_with("</") {
                self.end_tag();
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                self.skip_past('>');
            } else if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                self.start_tag();
            } else {
                self.text();
            }
        }
    }

    fn push_text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        let parent = self.current();
        // Merge with a preceding text sibling so text nodes stay maximal.
        if let Some(last) = self.doc.children(parent).last().copied() {
            if let NodeData::Text(prev) = &mut self.doc.nodes[last.0].data {
                prev.push_str(&text);
                return;
            }
        }
        let node = self.doc.create_text(text);
        self.doc.append_child(parent, node);
    }

    fn text(&mut self) {
        let rest = self.rest();
        // A '<' that does not open markup is literal text.
        let first = rest.chars().next().map_or(1, char::len_utf8);
        let end = rest[first..]
            .find('<')
            .map(|i| i + first)
            .unwrap_or(rest.len());
        let raw = &rest[..end];
        self.pos += end;
        self.push_text(decode_entities(raw));
    }

    fn comment(&mut self) {
        let rest = &self.rest()[4..];
        let (body, consumed) = match rest.find("-->") {
            Some(end) => (&rest[..end], 4 + end + 3),
            None => (rest, 4 + rest.len()),
        };
        let node = self.doc.create(NodeData::Comment(body.to_string()));
        let parent = self.current();
        self.doc.append_child(parent, node);
        self.pos += consumed;
    }

    fn skip_past(&mut self, c: char) {
        match self.rest().find(c) {
            Some(i) => self.pos += i + 1,
            None => self.pos = self.input.len(),
        }
    }

    fn end_tag(&mut self) {
        let rest = &self.rest()[2..];
        let end = rest.find('>').unwrap_or(rest.len());
        let name = rest[..end].trim().to_ascii_lowercase();
        self.skip_past('>');
        if let Some(idx) = self
            .open
            .iter()
            .rposition(|n| self.doc.name(*n) == Some(name.as_str()))
        {
            self.open.truncate(idx);
        }
    }

    fn start_tag(&mut self) {
        let bytes = self.input.as_bytes();
        let mut i = self.pos + 1;
        let name_start = i;
        while i < bytes.len() && !is_tag_delim(bytes[i]) {
            i += 1;
        }
        let name = self.input[name_start..i].to_ascii_lowercase();
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }
            match bytes[i] {
                b'>' => {
                    i += 1;
                    break;
                }
                b'/' => {
                    i += 1;
                    if i < bytes.len() && bytes[i] == b'>' {
                        self_closing = true;
                    }
                    continue;
                }
                _ => {}
            }
            let attr_start = i;
            while i < bytes.len() && !is_tag_delim(bytes[i]) && bytes[i] != b'=' {
                i += 1;
            }
            let attr_name = self.input[attr_start..i].to_ascii_lowercase();
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let mut value = String::new();
            if i < bytes.len() && bytes[i] == b'=' {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                    let quote = bytes[i];
                    i += 1;
                    let value_start = i;
                    while i < bytes.len() && bytes[i] != quote {
                        i += 1;
                    }
                    value = decode_entities(&self.input[value_start..i]);
                    i = (i + 1).min(bytes.len());
                } else {
                    let value_start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>'
                    {
                        i += 1;
                    }
                    value = decode_entities(&self.input[value_start..i]);
                }
            }
            if !attr_name.is_empty() && !attrs.iter().any(|(k, _)| *k == attr_name) {
                attrs.push((attr_name, value));
            }
        }
        self.pos = i.min(self.input.len());

        let node = self.doc.create_element(&name, attrs);
        let parent = self.current();
        self.doc.append_child(parent, node);

        if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
            return;
        }
        if RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
            self.raw_text(node, &name);
            return;
        }
        self.open.push(node);
    }

    fn raw_text(&mut self, node: NodeId, name: &str) {
        let rest = self.rest();
        let close = format!("</{}", name);
        let end = rest
            .to_ascii_lowercase()
            .find(&close)
            .unwrap_or(rest.len());
        if end > 0 {
            let text = self.doc.create_text(&rest[..end]);
            self.doc.append_child(node, text);
        }
        self.pos += end;
        if self.pos < self.input.len() {
            self.skip_past('>');
        }
    }
}

fn is_tag_delim(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'>' || b == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_sanitized_markup() {
        let html = r#"<p>See <a href="/g/p/-/issues/7" rel="noopener">#7</a> &amp; <code>x &lt; y</code></p>"#;
        let doc = Document::parse(html);
        assert_eq!(doc.to_html(), html);
    }

    #[test]
    fn test_void_and_self_closing_elements() {
        let doc = Document::parse("<p>a<br>b<img src=\"x.png\"/></p>");
        assert_eq!(doc.to_html(), "<p>a<br>b<img src=\"x.png\"></p>");
    }

    #[test]
    fn test_entities_decoded_in_text_and_attributes() {
        let doc = Document::parse(r#"<a title="&quot;hi&quot; &#39;there&#x27;">&lt;b&gt;&nbsp;</a>"#);
        let a = doc.children(doc.root())[0];
        assert_eq!(doc.attr(a, "title"), Some("\"hi\" 'there'"));
        assert_eq!(doc.text_content(a), "<b>\u{a0}");
    }

    #[test]
    fn test_stray_close_tag_is_dropped() {
        let doc = Document::parse("a</span>b<em>c");
        assert_eq!(doc.to_html(), "ab<em>c</em>");
    }

    #[test]
    fn test_unwrap_keeps_children_in_place() {
        let mut doc = Document::parse("<p>x <a href=\"#\"><em>y</em> z</a> w</p>");
        let p = doc.children(doc.root())[0];
        let a = doc.children(p)[1];
        doc.unwrap_element(a);
        assert_eq!(doc.to_html(), "<p>x <em>y</em> z w</p>");
        assert!(!doc.is_attached(a));
    }

    #[test]
    fn test_replace_with_text() {
        let mut doc = Document::parse("<p><a>x</a>!</p>");
        let p = doc.children(doc.root())[0];
        let a = doc.children(p)[0];
        doc.replace_with_text(a, "<plain>");
        assert_eq!(doc.to_html(), "<p>&lt;plain&gt;!</p>");
    }

    #[test]
    fn test_raw_text_element_kept_verbatim() {
        let html = "<style>a > b { color: red; }</style><p>x</p>";
        let doc = Document::parse(html);
        assert_eq!(doc.to_html(), html);
    }

    #[test]
    fn test_distinct_documents_have_distinct_ids() {
        let a = Document::parse("<p>x</p>");
        let b = Document::parse("<p>x</p>");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_clone_gets_its_own_id() {
        let a = Document::parse("<p><a>#7</a></p>");
        let b = a.clone();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_html(), b.to_html());
    }
}
