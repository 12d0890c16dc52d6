//! Redaction Engine - strips references the viewer may not see
//!
//! # Pass Order
//! 1. Scan every document once
//! 2. Reject kinds without an adapter
//! 3. One container-readability query for qualified references
//! 4. One adapter call per kind over the whole batch
//! 5. Mutate: redact hidden nodes, count visible ones
//!
//! Visibility is fully decided before the first mutation. If any step before
//! mutation fails, every scanned node is redacted, no node is counted, and
//! the error is returned. A batch is never left half-decided.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::RenderContext;
use crate::document::{Document, DocumentId};
use crate::reference::{NodeRef, ReferenceKind, ReferenceNode};
use crate::renderer::RenderedDocument;
use crate::scanner::{NodesByKind, ReferenceScanner};
use crate::visibility::{readable_containers, AccessError, AccessPolicy, VisibilityRegistry};

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("No visibility adapter registered for reference kind: {0}")]
    UnknownReferenceKind(ReferenceKind),

    #[error("Authorization failed for {kind}: {source}")]
    Authorization {
        kind: String,
        #[source]
        source: AccessError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedactionResult {
    pub document: DocumentId,
    pub visible_count: usize,
}

pub struct RedactionEngine {
    registry: Arc<VisibilityRegistry>,
    policy: Arc<dyn AccessPolicy>,
}

impl RedactionEngine {
    pub fn new(registry: Arc<VisibilityRegistry>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { registry, policy }
    }

    /// Redact a batch in place. Results follow input order.
    pub fn redact(
        &self,
        documents: &mut [RenderedDocument],
        context: &RenderContext,
    ) -> Result<Vec<RedactionResult>, RedactionError> {
        let found = ReferenceScanner::scan(documents);
        let total = ReferenceScanner::count(&found);

        let visible = match self.resolve(&found, context) {
            Ok(visible) => visible,
            Err(e) => {
                warn!(nodes = total, error = %e, "visibility unresolved, redacting every reference");
                let all = found.values().flatten();
                apply(documents, all, &HashSet::new());
                return Err(e);
            }
        };

        apply(documents, found.values().flatten(), &visible);
        info!(
            documents = documents.len(),
            references = total,
            visible = visible.len(),
            "redaction complete"
        );
        Ok(documents
            .iter()
            .map(|d| RedactionResult {
                document: d.document.id(),
                visible_count: d.visible_reference_count(),
            })
            .collect())
    }

    fn resolve(
        &self,
        found: &NodesByKind,
        context: &RenderContext,
    ) -> Result<HashSet<NodeRef>, RedactionError> {
        if let Some(kind) = found.keys().find(|k| !self.registry.knows(k)) {
            return Err(RedactionError::UnknownReferenceKind(kind.clone()));
        }

        let readable = self.readable_containers(found, context)?;

        let mut visible = HashSet::new();
        for (kind, nodes) in found {
            let Some(adapter) = self.registry.get(kind) else {
                return Err(RedactionError::UnknownReferenceKind(kind.clone()));
            };
            let candidates: Vec<ReferenceNode> = nodes
                .iter()
                .filter(|n| match (n.explicit_container(), &readable) {
                    (Some(container), Some(readable)) => readable.contains(container),
                    _ => true,
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let seen = adapter
                .visible_to(&candidates, context, self.policy.as_ref())
                .map_err(|source| RedactionError::Authorization {
                    kind: kind.to_string(),
                    source,
                })?;
            let before = visible.len();
            visible.extend(
                candidates
                    .iter()
                    .map(ReferenceNode::handle)
                    .filter(|h| seen.contains(h)),
            );
            debug!(
                kind = %kind,
                nodes = candidates.len(),
                visible = visible.len() - before,
                "visibility batch resolved"
            );
        }
        Ok(visible)
    }

    /// `None` when the check is skipped or nothing names a container.
    fn readable_containers(
        &self,
        found: &NodesByKind,
        context: &RenderContext,
    ) -> Result<Option<HashSet<String>>, RedactionError> {
        if context.skip_project_check() {
            return Ok(None);
        }
        let containers: HashSet<&str> = found
            .values()
            .flatten()
            .filter_map(ReferenceNode::explicit_container)
            .collect();
        if containers.is_empty() {
            return Ok(None);
        }
        readable_containers(containers, context, self.policy.as_ref())
            .map(Some)
            .map_err(|source| RedactionError::Authorization {
                kind: "project".to_string(),
                source,
            })
    }
}

/// Redact every node not in `visible`, then count the visible nodes that
/// are still attached.
fn apply<'a>(
    documents: &mut [RenderedDocument],
    nodes: impl Iterator<Item = &'a ReferenceNode>,
    visible: &HashSet<NodeRef>,
) {
    let index: HashMap<DocumentId, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.document.id(), i))
        .collect();

    let mut kept = Vec::new();
    for node in nodes {
        let Some(&i) = index.get(&node.handle().document) else {
            continue;
        };
        if visible.contains(&node.handle()) {
            kept.push((i, node.handle()));
        } else {
            redact_node(&mut documents[i].document, node);
        }
    }

    for (i, handle) in kept {
        if documents[i].document.is_attached(handle.node) {
            documents[i].record_visible();
        }
    }
}

/// Replace a reference element with inert content.
pub fn redact_node(doc: &mut Document, node: &ReferenceNode) {
    let id = node.handle().node;
    if !doc.is_attached(id) {
        return;
    }
    match node.original() {
        Some(original) if node.preserve_original_on_redact() => {
            doc.replace_with_text(id, original);
        }
        _ => doc.unwrap_element(id),
    }
}
