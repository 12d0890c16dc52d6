//! Markup Engine - Single Entry Point
//!
//! CRITICAL: nothing leaves the engine unredacted except through
//! `render_field` and `render_text`, which return viewer-independent HTML
//! meant for storage, not for display.

use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStore, FileStore, MemoryStore, RenderCache, Renderable, RenderableField};
use crate::config::EngineConfig;
use crate::context::{Owner, RenderContext, RenderContextSeed};
use crate::document::Document;
use crate::pipeline::{standard_builder, PipelineIdentifier, PipelineRegistry};
use crate::redaction::{RedactionEngine, RedactionResult};
use crate::renderer::{BatchRenderer, RenderError, RenderedDocument};
use crate::transform::{MarkupTransform, StageTransform};
use crate::visibility::{AccessPolicy, VisibilityRegistry};

pub struct MarkupEngine {
    cache: RenderCache,
    redaction: RedactionEngine,
    local_cache_version: u16,
    skip_project_check: bool,
}

impl MarkupEngine {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        transform: Arc<dyn MarkupTransform>,
        store: Arc<dyn CacheStore>,
        visibility: Arc<VisibilityRegistry>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            cache: RenderCache::new(registry, transform, store),
            redaction: RedactionEngine::new(visibility, policy),
            local_cache_version: 0,
            skip_project_check: false,
        }
    }

    /// Built-in pipelines, stages and adapters over the given store and policy.
    pub fn standard(store: Arc<dyn CacheStore>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self::new(
            Arc::new(PipelineRegistry::standard()),
            Arc::new(StageTransform::standard()),
            store,
            Arc::new(VisibilityRegistry::standard()),
            policy,
        )
    }

    pub fn from_config(
        config: &EngineConfig,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self, RenderError> {
        let mut builder = standard_builder();
        if let Some(dir) = &config.pipelines_dir {
            builder = builder.load_from_dir(dir)?;
        }
        let registry = builder.build()?;

        let store: Arc<dyn CacheStore> = match &config.cache_dir {
            Some(dir) => {
                let store = FileStore::open(dir)?;
                store.set_read_only(config.read_only);
                Arc::new(store)
            }
            None => {
                let store = MemoryStore::new();
                store.set_read_only(config.read_only);
                Arc::new(store)
            }
        };
        info!(
            pipelines = registry.list().len(),
            file_cache = config.cache_dir.is_some(),
            read_only = config.read_only,
            "markup engine configured"
        );

        let mut engine = Self::new(
            Arc::new(registry),
            Arc::new(StageTransform::standard()),
            store,
            Arc::new(VisibilityRegistry::standard()),
            policy,
        );
        engine.cache = engine
            .cache
            .with_base_path(config.base_path.clone())
            .with_local_version(config.local_cache_version);
        engine.local_cache_version = config.local_cache_version;
        engine.skip_project_check = config.skip_project_check;
        Ok(engine)
    }

    pub fn registry(&self) -> &PipelineRegistry {
        self.cache.registry()
    }

    pub fn local_cache_version(&self) -> u16 {
        self.local_cache_version
    }

    /// Unredacted HTML for one field, from the cache when fresh.
    pub fn render_field(&self, field: &RenderableField) -> Result<String, RenderError> {
        self.cache.render_field(field)
    }

    /// Render `field` across `objects` and redact the batch for the seed's viewer.
    pub fn render<T: Renderable>(
        &self,
        objects: &[T],
        field: &str,
        seed: &RenderContextSeed,
    ) -> Result<Vec<RenderedDocument>, RenderError> {
        BatchRenderer::new(&self.cache, &self.redaction).render(objects, field, &self.seed(seed))
    }

    /// Unredacted HTML for free-standing text.
    pub fn render_text(
        &self,
        text: &str,
        pipeline: &PipelineIdentifier,
        owner: Option<&Owner>,
        cache_key: Option<&str>,
    ) -> Result<String, RenderError> {
        Ok(self
            .cache
            .render_text(text, pipeline, owner, cache_key)?
            .to_html())
    }

    /// Redact already-rendered HTML for one viewer.
    pub fn post_process(
        &self,
        html: &str,
        owner: Option<Owner>,
        seed: &RenderContextSeed,
    ) -> Result<RenderedDocument, RenderError> {
        self.redact_one(RenderedDocument::new(Document::parse(html), owner), seed)
    }

    /// Render free-standing text and redact it for the seed's viewer.
    pub fn render_and_redact(
        &self,
        text: &str,
        pipeline: &PipelineIdentifier,
        owner: Option<Owner>,
        seed: &RenderContextSeed,
        cache_key: Option<&str>,
    ) -> Result<RenderedDocument, RenderError> {
        let document = self
            .cache
            .render_text(text, pipeline, owner.as_ref(), cache_key)?;
        self.redact_one(RenderedDocument::new(document, owner), seed)
    }

    /// Redact documents the caller rendered, under a context the caller built.
    /// The configured `skip_project_check` applies on top of the context's.
    pub fn redact(
        &self,
        documents: &mut [RenderedDocument],
        context: &RenderContext,
    ) -> Result<Vec<RedactionResult>, RenderError> {
        if self.skip_project_check && !context.skip_project_check() {
            let context = context.clone().with_skip_project_check(true);
            return Ok(self.redaction.redact(documents, &context)?);
        }
        Ok(self.redaction.redact(documents, context)?)
    }

    fn redact_one(
        &self,
        rendered: RenderedDocument,
        seed: &RenderContextSeed,
    ) -> Result<RenderedDocument, RenderError> {
        let mut documents = [rendered];
        let context = self
            .seed(seed)
            .build(documents.iter().map(|d| (d.document.id(), d.owner.as_ref())));
        self.redaction.redact(&mut documents, &context)?;
        let [rendered] = documents;
        Ok(rendered)
    }

    fn seed(&self, seed: &RenderContextSeed) -> RenderContextSeed {
        let mut seed = seed.clone();
        seed.skip_project_check |= self.skip_project_check;
        seed
    }
}
