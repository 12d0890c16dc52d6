//! Batch Renderer - render a field across many objects, then redact once
//!
//! CRITICAL: every document in the batch is rendered before redaction
//! starts, so each reference kind is authorized with a single call for the
//! whole batch.

use thiserror::Error;
use tracing::debug;

use crate::cache::{FieldKey, RenderCache, Renderable, StoreError};
use crate::config::ConfigError;
use crate::context::{Owner, RenderContextSeed};
use crate::document::Document;
use crate::pipeline::PipelineError;
use crate::redaction::{RedactionEngine, RedactionError};
use crate::transform::TransformError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Object {object} has no renderable field {field}")]
    UnknownField { object: usize, field: String },

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Redaction error: {0}")]
    Redaction(#[from] RedactionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A rendered tree for one request, with the owner it resolves against.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub document: Document,
    pub owner: Option<Owner>,
    pub key: Option<FieldKey>,
    visible_reference_count: usize,
}

impl RenderedDocument {
    pub fn new(document: Document, owner: Option<Owner>) -> Self {
        Self {
            document,
            owner,
            key: None,
            visible_reference_count: 0,
        }
    }

    pub fn with_key(mut self, key: FieldKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Reference nodes left visible by redaction. Zero until redacted.
    pub fn visible_reference_count(&self) -> usize {
        self.visible_reference_count
    }

    pub(crate) fn record_visible(&mut self) {
        self.visible_reference_count += 1;
    }

    pub fn html(&self) -> String {
        self.document.to_html()
    }
}

pub struct BatchRenderer<'a> {
    cache: &'a RenderCache,
    redaction: &'a RedactionEngine,
}

impl<'a> BatchRenderer<'a> {
    pub fn new(cache: &'a RenderCache, redaction: &'a RedactionEngine) -> Self {
        Self { cache, redaction }
    }

    /// Render `field` of every object, then redact the whole batch in one pass.
    pub fn render<T: Renderable>(
        &self,
        objects: &[T],
        field: &str,
        seed: &RenderContextSeed,
    ) -> Result<Vec<RenderedDocument>, RenderError> {
        let mut documents = Vec::with_capacity(objects.len());
        for (i, object) in objects.iter().enumerate() {
            let renderable = object
                .renderable_field(field)
                .ok_or_else(|| RenderError::UnknownField {
                    object: i,
                    field: field.to_string(),
                })?;
            let document = self.cache.render_document(&renderable)?;
            documents.push(
                RenderedDocument::new(document, renderable.owner.clone())
                    .with_key(renderable.key.clone()),
            );
        }
        debug!(documents = documents.len(), field, "batch rendered");

        let context = seed.build(
            documents
                .iter()
                .map(|d| (d.document.id(), d.owner.as_ref())),
        );
        self.redaction.redact(&mut documents, &context)?;
        Ok(documents)
    }
}
