//! Markup Transform - runs a pipeline's stages over raw text
//!
//! The transform is the expensive step the cache exists to avoid. It must be
//! deterministic for identical text and stages.

use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::document::Document;
use crate::filters::{
    Filter, FilterContext, FilterError, LinkReferenceFilter, MarkdownFilter, PlainTextFilter,
    ReferenceFilter, ReferenceSyntax, SanitizeFilter, SingleLineFilter,
};
use crate::pipeline::{stages, PipelineSpec, StageId};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Unknown stage {stage} in pipeline {pipeline}")]
    UnknownStage { pipeline: String, stage: String },

    #[error("Stage failed: {0}")]
    Filter(#[from] FilterError),
}

/// Raw text plus stages in, tree out.
pub trait MarkupTransform: Send + Sync {
    fn transform(
        &self,
        raw: &str,
        pipeline: &PipelineSpec,
        context: &FilterContext,
    ) -> Result<Document, TransformError>;
}

/// Intermediate content between stages.
enum Content {
    Text(String),
    Tree(Document),
}

impl Content {
    fn into_text(self) -> String {
        match self {
            Content::Text(t) => t,
            Content::Tree(doc) => doc.to_html(),
        }
    }

    fn into_tree(self) -> Document {
        match self {
            Content::Text(t) => Document::parse(&t),
            Content::Tree(doc) => doc,
        }
    }
}

/// Transform backed by a table of named filters.
pub struct StageTransform {
    filters: HashMap<StageId, Filter>,
}

impl StageTransform {
    /// A transform that knows no stages.
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Every built-in stage.
    pub fn standard() -> Self {
        let references = [
            (stages::ISSUE_REFERENCE, ReferenceSyntax::Issue),
            (stages::MERGE_REQUEST_REFERENCE, ReferenceSyntax::MergeRequest),
            (stages::SNIPPET_REFERENCE, ReferenceSyntax::Snippet),
            (stages::COMMIT_REFERENCE, ReferenceSyntax::Commit),
            (stages::USER_REFERENCE, ReferenceSyntax::User),
        ];
        let mut transform = Self::empty()
            .with_filter(stages::MARKDOWN, Filter::Text(Box::new(MarkdownFilter)))
            .with_filter(stages::SANITIZE, Filter::Text(Box::new(SanitizeFilter)))
            .with_filter(stages::PLAIN_TEXT, Filter::Text(Box::new(PlainTextFilter)))
            .with_filter(stages::SINGLE_LINE, Filter::Document(Box::new(SingleLineFilter)))
            .with_filter(
                stages::LINK_REFERENCE,
                Filter::Document(Box::new(LinkReferenceFilter)),
            );
        for (stage, syntax) in references {
            transform = transform.with_filter(
                stage,
                Filter::Document(Box::new(ReferenceFilter::new(syntax))),
            );
        }
        transform
    }

    pub fn with_filter(mut self, stage: impl Into<StageId>, filter: Filter) -> Self {
        self.filters.insert(stage.into(), filter);
        self
    }

    pub fn knows(&self, stage: &StageId) -> bool {
        self.filters.contains_key(stage)
    }
}

impl Default for StageTransform {
    fn default() -> Self {
        Self::standard()
    }
}

impl MarkupTransform for StageTransform {
    fn transform(
        &self,
        raw: &str,
        pipeline: &PipelineSpec,
        context: &FilterContext,
    ) -> Result<Document, TransformError> {
        // Check every stage up front so an unknown one fails before any work.
        if let Some(missing) = pipeline.stages().iter().find(|s| !self.knows(s)) {
            return Err(TransformError::UnknownStage {
                pipeline: pipeline.name().to_string(),
                stage: missing.to_string(),
            });
        }

        let mut content = Content::Text(raw.to_string());
        for stage in pipeline.stages() {
            let Some(filter) = self.filters.get(stage) else {
                continue;
            };
            content = match filter {
                Filter::Text(f) => Content::Text(f.call(content.into_text(), context)?),
                Filter::Document(f) => {
                    let mut doc = content.into_tree();
                    f.call(&mut doc, context)?;
                    Content::Tree(doc)
                }
            };
        }
        debug!(pipeline = pipeline.name(), stages = pipeline.stages().len(), "transformed markup");
        Ok(content.into_tree())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineRegistry;

    #[test]
    fn test_full_pipeline_links_and_sanitizes() {
        let spec = PipelineRegistry::standard().get("full").cloned().unwrap();
        let doc = StageTransform::standard()
            .transform(
                "Fixes #7 <script>x()</script> per @alice",
                &spec,
                &FilterContext::default(),
            )
            .unwrap();
        let html = doc.to_html();
        assert!(!html.contains("<script"));
        assert!(html.contains(r#"data-reference-type="issue""#));
        assert!(html.contains(r#"data-user="alice""#));
    }

    #[test]
    fn test_unknown_stage_fails_before_running() {
        let spec = PipelineSpec::custom(vec![StageId::from("markdown"), StageId::from("emoji")]);
        let err = StageTransform::standard()
            .transform("x", &spec, &FilterContext::default())
            .unwrap_err();
        assert!(matches!(err, TransformError::UnknownStage { ref stage, .. } if stage == "emoji"));
    }

    #[test]
    fn test_deterministic_output() {
        let spec = PipelineRegistry::standard().get("full").cloned().unwrap();
        let transform = StageTransform::standard();
        let ctx = FilterContext::default();
        let a = transform.transform("see !3 and $4", &spec, &ctx).unwrap();
        let b = transform.transform("see !3 and $4", &spec, &ctx).unwrap();
        assert_eq!(a.to_html(), b.to_html());
    }
}
