//! Object Extractor - loads the entities behind reference nodes
//!
//! One load per kind per call, and every answer (misses included) is
//! remembered for the extractor's lifetime. Construct one per request; it
//! is not meant to be shared between requests.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::context::RenderContext;
use crate::reference::{NodeRef, ReferenceKind, ReferenceNode, Target};
use crate::visibility::TargetScope;

#[derive(Debug, Error)]
#[error("Failed to load {kind} entities: {message}")]
pub struct LoadError {
    pub kind: String,
    pub message: String,
}

/// Batched entity source.
pub trait EntityLoader {
    type Entity: Clone;

    /// Entities for the targets that exist. Absent targets are simply missing
    /// from the map.
    fn load(
        &self,
        kind: &ReferenceKind,
        targets: &[Target],
    ) -> Result<HashMap<Target, Self::Entity>, LoadError>;
}

pub struct ObjectExtractor<L: EntityLoader> {
    loader: L,
    memo: HashMap<(ReferenceKind, Target), Option<L::Entity>>,
}

impl<L: EntityLoader> ObjectExtractor<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            memo: HashMap::new(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Entity behind each node that resolves to one.
    pub fn extract(
        &mut self,
        nodes: &[ReferenceNode],
        context: &RenderContext,
    ) -> Result<HashMap<NodeRef, L::Entity>, LoadError> {
        let mut targeted: Vec<(NodeRef, ReferenceKind, Target)> = Vec::new();
        let mut pending: BTreeMap<ReferenceKind, Vec<Target>> = BTreeMap::new();
        for node in nodes {
            let kind = node.kind().clone();
            let Some(target) = TargetScope::for_kind(&kind).target_for(node, context) else {
                continue;
            };
            if !self.memo.contains_key(&(kind.clone(), target.clone())) {
                let batch = pending.entry(kind.clone()).or_default();
                if !batch.contains(&target) {
                    batch.push(target.clone());
                }
            }
            targeted.push((node.handle(), kind, target));
        }

        for (kind, targets) in pending {
            let mut loaded = self.loader.load(&kind, &targets)?;
            debug!(kind = %kind, requested = targets.len(), found = loaded.len(), "entities loaded");
            for target in targets {
                let entity = loaded.remove(&target);
                self.memo.insert((kind.clone(), target), entity);
            }
        }

        Ok(targeted
            .into_iter()
            .filter_map(|(handle, kind, target)| {
                self.memo
                    .get(&(kind, target))
                    .and_then(|e| e.clone())
                    .map(|e| (handle, e))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Owner;
    use crate::document::Document;
    use crate::renderer::RenderedDocument;
    use crate::scanner::ReferenceScanner;
    use std::cell::RefCell;

    #[derive(Default)]
    struct CountingLoader {
        calls: RefCell<Vec<(String, usize)>>,
    }

    impl EntityLoader for CountingLoader {
        type Entity = String;

        fn load(
            &self,
            kind: &ReferenceKind,
            targets: &[Target],
        ) -> Result<HashMap<Target, String>, LoadError> {
            self.calls
                .borrow_mut()
                .push((kind.to_string(), targets.len()));
            Ok(targets
                .iter()
                .filter(|t| t.id != "404")
                .map(|t| (t.clone(), format!("{kind} {t}")))
                .collect())
        }
    }

    fn nodes() -> Vec<ReferenceNode> {
        let doc = Document::parse(
            r#"<a data-reference="true" data-reference-type="issue" data-issue="1">#1</a>
<a data-reference="true" data-reference-type="issue" data-issue="1">#1</a>
<a data-reference="true" data-reference-type="issue" data-issue="404">#404</a>
<a data-reference="true" data-reference-type="merge_request" data-merge-request="2">!2</a>"#,
        );
        let found = ReferenceScanner::scan(&[RenderedDocument::new(doc, None)]);
        found.into_values().flatten().collect()
    }

    #[test]
    fn test_one_load_per_kind_and_memoized() {
        let ctx = RenderContext::new(None, Some(Owner::new(1, "g/p")));
        let nodes = nodes();
        let mut extractor = ObjectExtractor::new(CountingLoader::default());

        let first = extractor.extract(&nodes, &ctx).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(
            *extractor.loader().calls.borrow(),
            vec![("issue".to_string(), 2), ("merge_request".to_string(), 1)]
        );

        let second = extractor.extract(&nodes, &ctx).unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(extractor.loader().calls.borrow().len(), 2);
    }

    #[test]
    fn test_unresolvable_nodes_are_skipped() {
        let ctx = RenderContext::new(None, None);
        let mut extractor = ObjectExtractor::new(CountingLoader::default());
        assert!(extractor.extract(&nodes(), &ctx).unwrap().is_empty());
        assert!(extractor.loader().calls.borrow().is_empty());
    }
}
