//! Markgate Core - cached markup rendering with per-viewer reference redaction
//!
//! # The Rules (Non-Negotiable)
//! 1. Stored HTML is trusted only at the expected version and source digest
//! 2. Staleness and read-only storage are never errors
//! 3. One authorization call per reference kind per batch
//! 4. Authorization failure fails closed
//! 5. Pipeline names resolve or raise; there is no silent default

pub mod cache;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod extractor;
pub mod filters;
pub mod hashing;
pub mod pipeline;
pub mod policy;
pub mod redaction;
pub mod reference;
pub mod renderer;
pub mod scanner;
pub mod transform;
pub mod visibility;

pub use cache::{
    CacheStore, CacheVersion, CachedHtml, FieldKey, FileStore, MemoryStore, RenderCache,
    Renderable, RenderableField, StoreError, MARKUP_ENGINE_VERSION,
};
pub use config::{ConfigError, EngineConfig};
pub use context::{Owner, RenderContext, RenderContextSeed, Viewer};
pub use document::{Document, DocumentId, NodeId};
pub use engine::MarkupEngine;
pub use extractor::{EntityLoader, LoadError, ObjectExtractor};
pub use pipeline::{PipelineError, PipelineIdentifier, PipelineRegistry, PipelineSpec, StageId};
pub use policy::StaticPolicy;
pub use redaction::{RedactionEngine, RedactionError, RedactionResult};
pub use reference::{NodeRef, ReferenceKind, ReferenceNode, Target};
pub use renderer::{BatchRenderer, RenderError, RenderedDocument};
pub use scanner::ReferenceScanner;
pub use transform::{MarkupTransform, StageTransform, TransformError};
pub use visibility::{AccessError, AccessPolicy, AccessQuery, VisibilityAdapter, VisibilityRegistry};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
