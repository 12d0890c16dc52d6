//! Reference Nodes - tagged links to other entities inside rendered output
//!
//! Reference filters emit anchors carrying these attributes; the scanner,
//! visibility adapters, redaction engine and object extractor read them back.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::{ContextScope, RenderContext};
use crate::document::{DocumentId, NodeId};

/// Marker attribute: present on every reference node.
pub const REFERENCE_ATTR: &str = "data-reference";
/// Companion attribute naming the reference kind.
pub const KIND_ATTR: &str = "data-reference-type";
/// Explicit owning container (full path), set only for qualified references.
pub const CONTAINER_ATTR: &str = "data-project";
/// Verbatim text the author wrote.
pub const ORIGINAL_ATTR: &str = "data-original";
/// Restore `data-original` instead of the node's content on redaction.
pub const PRESERVE_ORIGINAL_ATTR: &str = "data-preserve-original";
/// Set on `@all` mentions, which target the container rather than a user.
pub const MENTION_ALL_ATTR: &str = "data-mention-all";

/// Well-known kind labels.
pub mod kinds {
    pub const ISSUE: &str = "issue";
    pub const MERGE_REQUEST: &str = "merge_request";
    pub const COMMIT: &str = "commit";
    pub const SNIPPET: &str = "snippet";
    pub const USER: &str = "user";
}

/// Kind label of a reference node, as read from [`KIND_ATTR`].
///
/// Kept open (a string, not an enum) because rendered HTML may carry kinds
/// this process has no adapter for; dispatch rejects those loudly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceKind(String);

impl ReferenceKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Attribute holding the target id: `merge_request` -> `data-merge-request`.
    pub fn id_attr(&self) -> String {
        format!("data-{}", self.0.replace('_', "-"))
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Address of a node within one redaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub document: DocumentId,
    pub node: NodeId,
}

/// What an authorization or load query is asked about: an id, scoped to a
/// container for container-local kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub container: Option<String>,
    pub id: String,
}

impl Target {
    pub fn scoped(container: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            id: id.into(),
        }
    }

    pub fn global(id: impl Into<String>) -> Self {
        Self {
            container: None,
            id: id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(c) => write!(f, "{}:{}", c, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// A reference node found by the scanner.
///
/// Holds a snapshot of the element's attributes so adapters can decide
/// visibility without borrowing the documents being redacted.
#[derive(Debug, Clone)]
pub struct ReferenceNode {
    handle: NodeRef,
    kind: ReferenceKind,
    attrs: Vec<(String, String)>,
}

impl ReferenceNode {
    pub fn new(handle: NodeRef, kind: ReferenceKind, attrs: Vec<(String, String)>) -> Self {
        Self {
            handle,
            kind,
            attrs,
        }
    }

    pub fn handle(&self) -> NodeRef {
        self.handle
    }

    pub fn kind(&self) -> &ReferenceKind {
        &self.kind
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn target_id(&self) -> Option<&str> {
        self.attr(&self.kind.id_attr()).filter(|v| !v.is_empty())
    }

    pub fn explicit_container(&self) -> Option<&str> {
        self.attr(CONTAINER_ATTR).filter(|v| !v.is_empty())
    }

    pub fn original(&self) -> Option<&str> {
        self.attr(ORIGINAL_ATTR)
    }

    pub fn preserve_original_on_redact(&self) -> bool {
        self.attr(PRESERVE_ORIGINAL_ATTR) == Some("true")
    }

    /// Container this node resolves against: its own `data-project`, else
    /// whatever the context associates with the node or its document.
    pub fn container(&self, context: &RenderContext) -> Option<String> {
        match self.explicit_container() {
            Some(c) => Some(c.to_string()),
            None => context
                .owner_for(ContextScope::Node(self.handle))
                .map(|o| o.full_path.clone()),
        }
    }

    /// Target for container-local kinds. `None` when no container is known,
    /// which callers treat as "resolves to nothing".
    pub fn scoped_target(&self, context: &RenderContext) -> Option<Target> {
        let id = self.target_id()?;
        let container = self.container(context)?;
        Some(Target::scoped(container, id))
    }

    /// Target for kinds addressed by a global id.
    pub fn global_target(&self) -> Option<Target> {
        self.target_id().map(Target::global)
    }
}
