//! Visibility Resolution - which reference nodes a viewer may see
//!
//! Every adapter turns its whole batch into ONE query against the
//! authorization engine. Adapters never query per node.
//!
//! Kinds are dispatched through an explicit table. A kind with no adapter
//! is a configuration error, surfaced by the redaction engine.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::context::{RenderContext, Viewer};
use crate::reference::{kinds, NodeRef, ReferenceKind, ReferenceNode, Target, MENTION_ALL_ATTR};

/// Abilities understood by the standard adapters.
pub mod abilities {
    pub const READ_PROJECT: &str = "read_project";
    pub const READ_ISSUE: &str = "read_issue";
    pub const READ_MERGE_REQUEST: &str = "read_merge_request";
    pub const READ_CODE: &str = "read_code";
    pub const READ_SNIPPET: &str = "read_snippet";
    pub const READ_USER: &str = "read_user";
}

#[derive(Debug, Error)]
#[error("Authorization check {ability} failed: {message}")]
pub struct AccessError {
    pub ability: String,
    pub message: String,
}

impl AccessError {
    pub fn new(ability: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ability: ability.into(),
            message: message.into(),
        }
    }
}

/// "Which of these targets may the viewer exercise `ability` on?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessQuery {
    pub ability: String,
    pub targets: Vec<Target>,
}

impl AccessQuery {
    pub fn new(ability: impl Into<String>, targets: impl IntoIterator<Item = Target>) -> Self {
        let mut targets: Vec<Target> = targets.into_iter().collect();
        targets.sort();
        targets.dedup();
        Self {
            ability: ability.into(),
            targets,
        }
    }
}

/// The authorization engine.
pub trait AccessPolicy: Send + Sync {
    /// The permitted subset of `query.targets`. Order carries no meaning.
    fn permitted(
        &self,
        viewer: Option<&Viewer>,
        query: &AccessQuery,
    ) -> Result<HashSet<Target>, AccessError>;
}

/// How a kind's nodes are addressed in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    /// Ids local to a container; bare references take the context owner.
    Container,
    /// Ids valid on their own; a qualified reference keeps its container.
    Global,
}

impl TargetScope {
    pub fn for_kind(kind: &ReferenceKind) -> Self {
        match kind.as_str() {
            kinds::SNIPPET | kinds::USER => TargetScope::Global,
            _ => TargetScope::Container,
        }
    }

    /// `None` means the node resolves to nothing.
    pub fn target_for(self, node: &ReferenceNode, context: &RenderContext) -> Option<Target> {
        match self {
            TargetScope::Container => node.scoped_target(context),
            TargetScope::Global => match node.explicit_container() {
                Some(container) => node
                    .target_id()
                    .map(|id| Target::scoped(container, id)),
                None => node.global_target(),
            },
        }
    }
}

/// Per-kind visibility capability.
pub trait VisibilityAdapter: Send + Sync {
    fn kind(&self) -> ReferenceKind;

    /// The subset of `nodes` the context's viewer may see.
    fn visible_to(
        &self,
        nodes: &[ReferenceNode],
        context: &RenderContext,
        policy: &dyn AccessPolicy,
    ) -> Result<HashSet<NodeRef>, AccessError>;
}

/// Adapter for kinds whose visibility is one ability over node targets.
#[derive(Debug, Clone)]
pub struct AbilityAdapter {
    kind: ReferenceKind,
    ability: String,
    scope: TargetScope,
}

impl AbilityAdapter {
    pub fn new(kind: &str, ability: &str) -> Self {
        let kind = ReferenceKind::from(kind);
        let scope = TargetScope::for_kind(&kind);
        Self {
            kind,
            ability: ability.to_string(),
            scope,
        }
    }

    pub fn issue() -> Self {
        Self::new(kinds::ISSUE, abilities::READ_ISSUE)
    }

    pub fn merge_request() -> Self {
        Self::new(kinds::MERGE_REQUEST, abilities::READ_MERGE_REQUEST)
    }

    pub fn commit() -> Self {
        Self::new(kinds::COMMIT, abilities::READ_CODE)
    }

    pub fn snippet() -> Self {
        Self::new(kinds::SNIPPET, abilities::READ_SNIPPET)
    }
}

impl VisibilityAdapter for AbilityAdapter {
    fn kind(&self) -> ReferenceKind {
        self.kind.clone()
    }

    fn visible_to(
        &self,
        nodes: &[ReferenceNode],
        context: &RenderContext,
        policy: &dyn AccessPolicy,
    ) -> Result<HashSet<NodeRef>, AccessError> {
        let targeted: Vec<(NodeRef, Target)> = nodes
            .iter()
            .filter_map(|n| self.scope.target_for(n, context).map(|t| (n.handle(), t)))
            .collect();
        if targeted.is_empty() {
            return Ok(HashSet::new());
        }

        let query = AccessQuery::new(&self.ability, targeted.iter().map(|(_, t)| t.clone()));
        let permitted = policy.permitted(context.viewer(), &query)?;
        Ok(targeted
            .into_iter()
            .filter(|(_, t)| permitted.contains(t))
            .map(|(n, _)| n)
            .collect())
    }
}

/// User mentions. Named users need `read_user`; `@all` needs `read_project`
/// on the container it was written in.
#[derive(Debug, Clone, Default)]
pub struct UserAdapter;

impl VisibilityAdapter for UserAdapter {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::from(kinds::USER)
    }

    fn visible_to(
        &self,
        nodes: &[ReferenceNode],
        context: &RenderContext,
        policy: &dyn AccessPolicy,
    ) -> Result<HashSet<NodeRef>, AccessError> {
        let mut users = Vec::new();
        let mut everyone = Vec::new();
        for node in nodes {
            if node.attr(MENTION_ALL_ATTR) == Some("true") {
                if let Some(container) = node.container(context) {
                    everyone.push((node.handle(), Target::global(container)));
                }
            } else if let Some(target) = node.global_target() {
                users.push((node.handle(), target));
            }
        }

        let mut visible = HashSet::new();
        for (ability, targeted) in [
            (abilities::READ_USER, users),
            (abilities::READ_PROJECT, everyone),
        ] {
            if targeted.is_empty() {
                continue;
            }
            let query = AccessQuery::new(ability, targeted.iter().map(|(_, t)| t.clone()));
            let permitted = policy.permitted(context.viewer(), &query)?;
            visible.extend(
                targeted
                    .into_iter()
                    .filter(|(_, t)| permitted.contains(t))
                    .map(|(n, _)| n),
            );
        }
        Ok(visible)
    }
}

/// Fixed kind -> adapter table.
pub struct VisibilityRegistry {
    adapters: HashMap<ReferenceKind, Box<dyn VisibilityAdapter>>,
}

impl VisibilityRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Adapters for every kind the standard stages emit.
    pub fn standard() -> Self {
        Self::empty()
            .with_adapter(Box::new(AbilityAdapter::issue()))
            .with_adapter(Box::new(AbilityAdapter::merge_request()))
            .with_adapter(Box::new(AbilityAdapter::commit()))
            .with_adapter(Box::new(AbilityAdapter::snippet()))
            .with_adapter(Box::new(UserAdapter))
    }

    pub fn with_adapter(mut self, adapter: Box<dyn VisibilityAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: &ReferenceKind) -> Option<&dyn VisibilityAdapter> {
        self.adapters.get(kind).map(|a| a.as_ref())
    }

    pub fn knows(&self, kind: &ReferenceKind) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&ReferenceKind> {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        kinds
    }
}

impl Default for VisibilityRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Readability of explicitly named containers, as one query.
pub fn readable_containers<'a>(
    containers: impl IntoIterator<Item = &'a str>,
    context: &RenderContext,
    policy: &dyn AccessPolicy,
) -> Result<HashSet<String>, AccessError> {
    let query = AccessQuery::new(
        abilities::READ_PROJECT,
        containers.into_iter().map(Target::global),
    );
    if query.targets.is_empty() {
        return Ok(HashSet::new());
    }
    let permitted = policy.permitted(context.viewer(), &query)?;
    debug!(
        checked = query.targets.len(),
        readable = permitted.len(),
        "container readability checked"
    );
    Ok(permitted.into_iter().map(|t| t.id).collect())
}
