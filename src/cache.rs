//! Render Cache - per-field HTML caching with staleness detection
//!
//! CRITICAL: a stored entry is trusted only when its version equals the
//! expected version AND it was rendered from the current text. Anything else
//! is stale, and stale only means "render again"; it is never an error.
//!
//! Persisting is optional work. A read-only backend, or a backend that
//! fails to write, still gets freshly rendered HTML back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Owner;
use crate::document::Document;
use crate::filters::FilterContext;
use crate::hashing::{key_digest, source_digest};
use crate::pipeline::{PipelineIdentifier, PipelineRegistry, PipelineSpec, StageId, CUSTOM_PIPELINE};
use crate::renderer::RenderError;
use crate::transform::MarkupTransform;

/// Version of the rendered output format. Bump whenever a change to the
/// stages alters the HTML they produce.
pub const MARKUP_ENGINE_VERSION: u16 = 1;

/// Expected version of a cache entry: `(engine << 16) | local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(u32);

impl CacheVersion {
    pub fn compose(local: u16) -> Self {
        Self((u32::from(MARKUP_ENGINE_VERSION) << 16) | u32::from(local))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Identifies one cacheable (object, field) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub object: String,
    pub field: String,
}

impl FieldKey {
    pub fn new(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHtml {
    pub html: String,
    pub version: CacheVersion,
    pub source_digest: String,
    pub rendered_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable storage for rendered HTML.
pub trait CacheStore: Send + Sync {
    fn fetch(&self, key: &FieldKey) -> Result<Option<CachedHtml>, StoreError>;

    /// Replace the entry for `key`. Readers never observe a half-written entry.
    fn persist(&self, key: &FieldKey, entry: &CachedHtml) -> Result<(), StoreError>;

    /// While true, callers skip [`CacheStore::persist`].
    fn read_only(&self) -> bool;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<FieldKey, CachedHtml>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn fetch(&self, key: &FieldKey) -> Result<Option<CachedHtml>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Backend("cache lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn persist(&self, key: &FieldKey, entry: &CachedHtml) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Backend("cache lock poisoned".into()))?;
        entries.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

/// One JSON file per field, named by key digest. Writes go to a temporary
/// file that is renamed into place.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    read_only: AtomicBool,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            read_only: AtomicBool::new(false),
        })
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn path_for(&self, key: &FieldKey) -> PathBuf {
        self.dir
            .join(format!("{}.json", key_digest("field", &key.to_string())))
    }
}

impl CacheStore for FileStore {
    fn fetch(&self, key: &FieldKey) -> Result<Option<CachedHtml>, StoreError> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn persist(&self, key: &FieldKey, entry: &CachedHtml) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

/// Everything needed to render one field of one object.
#[derive(Debug, Clone)]
pub struct RenderableField {
    pub key: FieldKey,
    pub raw: String,
    pub pipeline: PipelineIdentifier,
    /// False for fields that are cheap to recompute or not stable enough to
    /// store; those never touch storage.
    pub cacheable: bool,
    pub local_version: u16,
    /// The object's owning container, used for links and as the natural
    /// owner during redaction.
    pub owner: Option<Owner>,
    /// An entry the caller already loaded with the object, if any. When
    /// absent the store is asked.
    pub stored: Option<CachedHtml>,
}

impl RenderableField {
    pub fn new(key: FieldKey, raw: impl Into<String>) -> Self {
        Self {
            key,
            raw: raw.into(),
            pipeline: PipelineIdentifier::Default,
            cacheable: true,
            local_version: 0,
            owner: None,
            stored: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineIdentifier) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_local_version(mut self, version: u16) -> Self {
        self.local_version = version;
        self
    }

    pub fn cacheless(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn expected_version(&self) -> CacheVersion {
        CacheVersion::compose(self.local_version)
    }

    /// True when `stored` can be served for this field as-is.
    pub fn is_fresh(&self, stored: &CachedHtml) -> bool {
        stored.version == self.expected_version() && stored.source_digest == source_digest(&self.raw)
    }
}

/// Objects that expose markup fields.
pub trait Renderable {
    /// `None` when the object has no field by that name.
    fn renderable_field(&self, field: &str) -> Option<RenderableField>;
}

/// Decides, per field, between stored HTML and a fresh render.
#[derive(Clone)]
pub struct RenderCache {
    registry: Arc<PipelineRegistry>,
    transform: Arc<dyn MarkupTransform>,
    store: Arc<dyn CacheStore>,
    base_path: String,
    /// Applied to free-standing text renders; fields carry their own.
    local_version: u16,
}

impl RenderCache {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        transform: Arc<dyn MarkupTransform>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            registry,
            transform,
            store,
            base_path: String::new(),
            local_version: 0,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_local_version(mut self, version: u16) -> Self {
        self.local_version = version;
        self
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Rendered HTML for a field.
    pub fn render_field(&self, field: &RenderableField) -> Result<String, RenderError> {
        self.lookup(field).map(|r| r.into_html())
    }

    /// Rendered tree for a field.
    pub fn render_document(&self, field: &RenderableField) -> Result<Document, RenderError> {
        self.lookup(field).map(|r| r.into_document())
    }

    /// Render free-standing text. With a cache key the result is stored like
    /// a field, once per pipeline; without one the render is cacheless.
    pub fn render_text(
        &self,
        text: &str,
        pipeline: &PipelineIdentifier,
        owner: Option<&Owner>,
        cache_key: Option<&str>,
    ) -> Result<Document, RenderError> {
        let mut field = match cache_key {
            Some(cache_key) => {
                let spec = self.registry.resolve(pipeline)?;
                RenderableField::new(text_key(cache_key, &spec), text)
            }
            None => RenderableField::new(FieldKey::new("text:", "text"), text).cacheless(),
        }
        .with_pipeline(pipeline.clone())
        .with_local_version(self.local_version);
        field.owner = owner.cloned();
        self.render_document(&field)
    }

    fn lookup(&self, field: &RenderableField) -> Result<Lookup, RenderError> {
        if !field.cacheable {
            debug!(key = %field.key, "cacheless render");
            return self.transform_field(field).map(Lookup::Rendered);
        }

        let stored = match &field.stored {
            Some(entry) => Some(entry.clone()),
            None => self.fetch(&field.key),
        };
        if let Some(entry) = stored {
            if field.is_fresh(&entry) {
                debug!(key = %field.key, "cache hit");
                return Ok(Lookup::Stored(entry.html));
            }
            debug!(
                key = %field.key,
                stored = entry.version.value(),
                expected = field.expected_version().value(),
                "cache entry stale"
            );
        } else {
            debug!(key = %field.key, "cache miss");
        }

        let doc = self.transform_field(field)?;
        self.store_rendered(field, &doc);
        Ok(Lookup::Rendered(doc))
    }

    fn fetch(&self, key: &FieldKey) -> Option<CachedHtml> {
        match self.store.fetch(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, rendering instead");
                None
            }
        }
    }

    fn transform_field(&self, field: &RenderableField) -> Result<Document, RenderError> {
        let pipeline = self.registry.resolve(&field.pipeline)?;
        let context = FilterContext {
            owner: field.owner.clone(),
            base_path: self.base_path.clone(),
        };
        Ok(self.transform.transform(&field.raw, &pipeline, &context)?)
    }

    fn store_rendered(&self, field: &RenderableField, doc: &Document) {
        if self.store.read_only() {
            info!(key = %field.key, "storage is read-only, skipping cache write");
            return;
        }
        let entry = CachedHtml {
            html: doc.to_html(),
            version: field.expected_version(),
            source_digest: source_digest(&field.raw),
            rendered_at: Utc::now(),
        };
        if let Err(e) = self.store.persist(&field.key, &entry) {
            warn!(key = %field.key, error = %e, "cache write failed");
        }
    }
}

/// `text:<cache key>` keyed by pipeline name. Stage lists have no name, so
/// they are keyed by a digest of their stages.
fn text_key(cache_key: &str, pipeline: &PipelineSpec) -> FieldKey {
    let field = match pipeline.name() {
        CUSTOM_PIPELINE => {
            let stages: Vec<&str> = pipeline.stages().iter().map(StageId::as_str).collect();
            key_digest("stages", &stages.join(","))
        }
        name => name.to_string(),
    };
    FieldKey::new(format!("text:{}", cache_key), field)
}

enum Lookup {
    Stored(String),
    Rendered(Document),
}

impl Lookup {
    fn into_html(self) -> String {
        match self {
            Lookup::Stored(html) => html,
            Lookup::Rendered(doc) => doc.to_html(),
        }
    }

    fn into_document(self) -> Document {
        match self {
            Lookup::Stored(html) => Document::parse(&html),
            Lookup::Rendered(doc) => doc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::StageTransform;

    fn cache_with(store: Arc<dyn CacheStore>) -> RenderCache {
        RenderCache::new(
            Arc::new(PipelineRegistry::standard()),
            Arc::new(StageTransform::standard()),
            store,
        )
    }

    fn field(raw: &str) -> RenderableField {
        RenderableField::new(FieldKey::new("issue/1", "description"), raw)
    }

    #[test]
    fn test_version_composition() {
        assert_eq!(CacheVersion::compose(3).value(), (1 << 16) | 3);
        assert_ne!(CacheVersion::compose(3), CacheVersion::compose(4));
    }

    #[test]
    fn test_miss_persists_then_hits() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let html = cache.render_field(&field("**hi**")).unwrap();
        assert!(html.contains("<strong>hi</strong>"));

        let entry = store.fetch(&field("").key).unwrap().unwrap();
        assert_eq!(entry.html, html);
        assert_eq!(entry.version, CacheVersion::compose(0));
    }

    #[test]
    fn test_edited_text_is_stale() {
        let f = field("old");
        let entry = CachedHtml {
            html: "<p>old</p>".into(),
            version: f.expected_version(),
            source_digest: source_digest("old"),
            rendered_at: Utc::now(),
        };
        assert!(f.is_fresh(&entry));
        assert!(!field("new").is_fresh(&entry));
    }

    #[test]
    fn test_read_only_store_still_renders() {
        let store = Arc::new(MemoryStore::new());
        store.set_read_only(true);
        let cache = cache_with(store.clone());
        let html = cache.render_field(&field("text")).unwrap();
        assert_eq!(html.trim(), "<p>text</p>");
        assert!(store.is_empty());
    }

    #[test]
    fn test_cacheless_field_never_touches_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        cache.render_field(&field("title").cacheless()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_preloaded_entry_is_served() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let mut f = field("anything");
        f.stored = Some(CachedHtml {
            html: "<p>from columns</p>".into(),
            version: f.expected_version(),
            source_digest: source_digest("anything"),
            rendered_at: Utc::now(),
        });
        assert_eq!(cache.render_field(&f).unwrap(), "<p>from columns</p>");
    }

    #[test]
    fn test_text_render_with_and_without_key() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        cache
            .render_text("x", &PipelineIdentifier::Default, None, None)
            .unwrap();
        assert!(store.is_empty());
        cache
            .render_text("x", &PipelineIdentifier::Default, None, Some("banner"))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_text_key_separates_pipelines() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let plain = cache
            .render_text("*x*", &PipelineIdentifier::name("plain_text"), None, Some("k"))
            .unwrap()
            .to_html();
        let full = cache
            .render_text("*x*", &PipelineIdentifier::Default, None, Some("k"))
            .unwrap()
            .to_html();
        assert!(!plain.contains("<em>"));
        assert!(full.contains("<em>x</em>"));

        let stages = PipelineIdentifier::Stages(vec![StageId::new("markdown")]);
        cache.render_text("*x*", &stages, None, Some("k")).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_text_render_uses_local_version() {
        let store = Arc::new(MemoryStore::new());
        cache_with(store.clone())
            .render_text("hello", &PipelineIdentifier::Default, None, Some("k"))
            .unwrap();

        let bumped = cache_with(store.clone()).with_local_version(5);
        bumped
            .render_text("hello", &PipelineIdentifier::Default, None, Some("k"))
            .unwrap();
        let spec = bumped.registry().resolve(&PipelineIdentifier::Default).unwrap();
        let entry = store.fetch(&text_key("k", &spec)).unwrap().unwrap();
        assert_eq!(entry.version, CacheVersion::compose(5));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = FieldKey::new("note/9", "note");
        assert!(store.fetch(&key).unwrap().is_none());

        let entry = CachedHtml {
            html: "<p>x</p>".into(),
            version: CacheVersion::compose(2),
            source_digest: source_digest("x"),
            rendered_at: Utc::now(),
        };
        store.persist(&key, &entry).unwrap();
        assert_eq!(store.fetch(&key).unwrap(), Some(entry));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
