//! Reference Scanner - collects reference nodes from a batch of documents

use std::collections::BTreeMap;

use crate::document::Document;
use crate::reference::{NodeRef, ReferenceKind, ReferenceNode, KIND_ATTR, REFERENCE_ATTR};
use crate::renderer::RenderedDocument;

/// Reference nodes grouped by kind, in document order within each kind.
pub type NodesByKind = BTreeMap<ReferenceKind, Vec<ReferenceNode>>;

pub struct ReferenceScanner;

impl ReferenceScanner {
    /// One walk per document. Marker nodes without a kind are skipped.
    pub fn scan(documents: &[RenderedDocument]) -> NodesByKind {
        let mut found = NodesByKind::new();
        for rendered in documents {
            Self::scan_document(&rendered.document, &mut found);
        }
        found
    }

    pub fn scan_document(doc: &Document, found: &mut NodesByKind) {
        for id in doc.descendants(doc.root()) {
            if !doc.has_attr(id, REFERENCE_ATTR) {
                continue;
            }
            let Some(kind) = doc.attr(id, KIND_ATTR).filter(|k| !k.is_empty()) else {
                continue;
            };
            let kind = ReferenceKind::new(kind);
            let node = ReferenceNode::new(
                NodeRef {
                    document: doc.id(),
                    node: id,
                },
                kind.clone(),
                doc.attrs(id).to_vec(),
            );
            found.entry(kind).or_default().push(node);
        }
    }

    /// Total nodes across all kinds.
    pub fn count(found: &NodesByKind) -> usize {
        found.values().map(Vec::len).sum()
    }
}
