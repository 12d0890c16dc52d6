//! Render Context - who is looking, and which container owns what
//!
//! A context lives for exactly one redaction pass. It is passed explicitly to
//! every component that needs an owner; nothing here is global.
//!
//! Owner lookup precedence: node association, then document association,
//! then the pass-wide default owner. No match means "no owner", which is not
//! an error: references that need one resolve to nothing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::document::DocumentId;
use crate::reference::NodeRef;

/// The container (project or namespace) a bare reference resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub id: u64,
    pub full_path: String,
}

impl Owner {
    pub fn new(id: u64, full_path: impl Into<String>) -> Self {
        Self {
            id,
            full_path: full_path.into(),
        }
    }
}

/// The user a pass redacts for. `None` in a context means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewer {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

impl Viewer {
    pub fn new(id: u64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            admin: false,
        }
    }
}

/// Key for an owner association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextScope {
    Document(DocumentId),
    Node(NodeRef),
}

impl From<DocumentId> for ContextScope {
    fn from(id: DocumentId) -> Self {
        Self::Document(id)
    }
}

impl From<NodeRef> for ContextScope {
    fn from(node: NodeRef) -> Self {
        Self::Node(node)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    viewer: Option<Viewer>,
    default_owner: Option<Owner>,
    documents: HashMap<DocumentId, Owner>,
    nodes: HashMap<NodeRef, Owner>,
    skip_project_check: bool,
}

impl RenderContext {
    pub fn new(viewer: Option<Viewer>, default_owner: Option<Owner>) -> Self {
        Self {
            viewer,
            default_owner,
            ..Self::default()
        }
    }

    /// Skip the batched container-readability check for qualified references.
    pub fn with_skip_project_check(mut self, skip: bool) -> Self {
        self.skip_project_check = skip;
        self
    }

    pub fn viewer(&self) -> Option<&Viewer> {
        self.viewer.as_ref()
    }

    pub fn default_owner(&self) -> Option<&Owner> {
        self.default_owner.as_ref()
    }

    pub fn skip_project_check(&self) -> bool {
        self.skip_project_check
    }

    pub fn associate(&mut self, scope: impl Into<ContextScope>, owner: Owner) {
        match scope.into() {
            ContextScope::Document(id) => {
                self.documents.insert(id, owner);
            }
            ContextScope::Node(node) => {
                self.nodes.insert(node, owner);
            }
        }
    }

    pub fn owner_for(&self, scope: impl Into<ContextScope>) -> Option<&Owner> {
        match scope.into() {
            ContextScope::Node(node) => self
                .nodes
                .get(&node)
                .or_else(|| self.documents.get(&node.document))
                .or(self.default_owner.as_ref()),
            ContextScope::Document(id) => {
                self.documents.get(&id).or(self.default_owner.as_ref())
            }
        }
    }
}

/// Caller-facing description of a pass, turned into a [`RenderContext`] once
/// the documents exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderContextSeed {
    #[serde(default)]
    pub viewer: Option<Viewer>,
    /// Used for documents whose object has no natural owner.
    #[serde(default)]
    pub default_owner: Option<Owner>,
    /// Forces every document in the batch onto this owner.
    #[serde(default)]
    pub owner_override: Option<Owner>,
    #[serde(default)]
    pub skip_project_check: bool,
}

impl RenderContextSeed {
    pub fn for_viewer(viewer: Option<Viewer>) -> Self {
        Self {
            viewer,
            ..Self::default()
        }
    }

    pub fn with_default_owner(mut self, owner: Owner) -> Self {
        self.default_owner = Some(owner);
        self
    }

    /// Build the pass context, associating each document with the override
    /// if there is one, else with its natural owner.
    pub fn build<'a>(
        &self,
        documents: impl IntoIterator<Item = (DocumentId, Option<&'a Owner>)>,
    ) -> RenderContext {
        let mut context = RenderContext::new(self.viewer.clone(), self.default_owner.clone())
            .with_skip_project_check(self.skip_project_check);
        for (id, natural) in documents {
            if let Some(owner) = self.owner_override.as_ref().or(natural) {
                context.associate(id, owner.clone());
            }
        }
        context
    }
}
