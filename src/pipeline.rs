//! Pipeline Registry - identifier to stage-list resolution
//!
//! CRITICAL: resolution is total. Every identifier maps to exactly one
//! [`PipelineSpec`] or a named error. There is no silent fallback to the
//! default pipeline for names that are merely misspelled.
//!
//! The name table is built once at startup and is read-only afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Invalid pipeline identifier: {0}")]
    InvalidPipelineIdentifier(String),

    #[error("Pipeline name already registered: {0}")]
    DuplicateName(String),

    #[error("Alias {alias} points at unknown pipeline {target}")]
    DanglingAlias { alias: String, target: String },

    #[error("Failed to read pipeline definitions: {0}")]
    Load(#[from] std::io::Error),

    #[error("Invalid pipeline definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Name of one transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Stage names understood by the standard transform.
pub mod stages {
    pub const MARKDOWN: &str = "markdown";
    pub const SANITIZE: &str = "sanitize";
    pub const PLAIN_TEXT: &str = "plain_text";
    pub const SINGLE_LINE: &str = "single_line";
    pub const LINK_REFERENCE: &str = "link_reference";
    pub const ISSUE_REFERENCE: &str = "issue_reference";
    pub const MERGE_REQUEST_REFERENCE: &str = "merge_request_reference";
    pub const SNIPPET_REFERENCE: &str = "snippet_reference";
    pub const COMMIT_REFERENCE: &str = "commit_reference";
    pub const USER_REFERENCE: &str = "user_reference";
}

pub const DEFAULT_PIPELINE: &str = "full";
pub const CUSTOM_PIPELINE: &str = "custom";

/// An ordered, immutable list of stages plus a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    name: String,
    stages: Vec<StageId>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, stages: Vec<StageId>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Wrap a caller-supplied stage list as-is.
    pub fn custom(stages: Vec<StageId>) -> Self {
        Self::new(CUSTOM_PIPELINE, stages)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }
}

/// The accepted shapes of a pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineIdentifier {
    /// No identifier: the default pipeline.
    #[default]
    Default,
    /// A registered short name or alias.
    Name(String),
    /// A caller-supplied stage list, assumed valid.
    Stages(Vec<StageId>),
}

impl PipelineIdentifier {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

impl From<Option<&str>> for PipelineIdentifier {
    fn from(name: Option<&str>) -> Self {
        match name {
            Some(n) => Self::name(n),
            None => Self::Default,
        }
    }
}

/// Identifiers arriving from configuration or the CLI: `null`, a string, or
/// an array of strings. Anything else is the wrong kind of argument.
impl TryFrom<&Value> for PipelineIdentifier {
    type Error = PipelineError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Self::Default),
            Value::String(name) => Ok(Self::name(name.as_str())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(StageId::new(s.as_str())),
                    other => Err(PipelineError::InvalidPipelineIdentifier(format!(
                        "stage list entry {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Stages),
            other => Err(PipelineError::InvalidPipelineIdentifier(other.to_string())),
        }
    }
}

/// On-disk pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageId>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Pipeline registry - resolves identifiers to specs
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineSpec>,
    aliases: HashMap<String, String>,
}

impl PipelineRegistry {
    pub fn builder() -> PipelineRegistryBuilder {
        PipelineRegistryBuilder::default()
    }

    /// The built-in name table.
    pub fn standard() -> Self {
        let builder = standard_builder();
        Self {
            pipelines: builder.pipelines,
            aliases: builder.aliases,
        }
    }

    /// Process-wide standard registry, built on first use.
    pub fn global() -> &'static PipelineRegistry {
        static GLOBAL: OnceLock<PipelineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PipelineRegistry::standard)
    }

    /// Resolve an identifier to its stage list.
    pub fn resolve(&self, identifier: &PipelineIdentifier) -> Result<PipelineSpec, PipelineError> {
        match identifier {
            PipelineIdentifier::Default => self.lookup(DEFAULT_PIPELINE),
            PipelineIdentifier::Name(name) => self.lookup(name),
            PipelineIdentifier::Stages(stages) => Ok(PipelineSpec::custom(stages.clone())),
        }
    }

    /// Resolve an identifier given as loosely typed configuration.
    pub fn resolve_value(&self, value: &Value) -> Result<PipelineSpec, PipelineError> {
        self.resolve(&PipelineIdentifier::try_from(value)?)
    }

    fn lookup(&self, name: &str) -> Result<PipelineSpec, PipelineError> {
        let canonical = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        let spec = self
            .pipelines
            .get(canonical)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPipeline(name.to_string()))?;
        debug!(requested = name, pipeline = spec.name(), "resolved pipeline");
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Option<&PipelineSpec> {
        let canonical = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.pipelines.get(canonical)
    }

    /// All registered pipelines, by name.
    pub fn list(&self) -> Vec<&PipelineSpec> {
        self.pipelines.values().collect()
    }

    /// Aliases pointing at `name`.
    pub fn aliases_of(&self, name: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == name)
            .map(|(alias, _)| alias.as_str())
            .collect();
        out.sort_unstable();
        out
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Collects names before the table is frozen.
#[derive(Debug, Default)]
pub struct PipelineRegistryBuilder {
    pipelines: BTreeMap<String, PipelineSpec>,
    aliases: HashMap<String, String>,
}

impl PipelineRegistryBuilder {
    pub fn register(
        mut self,
        name: &str,
        stages: impl IntoIterator<Item = impl Into<StageId>>,
    ) -> Result<Self, PipelineError> {
        if self.pipelines.contains_key(name) || self.aliases.contains_key(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        let spec = PipelineSpec::new(name, stages.into_iter().map(Into::into).collect());
        self.pipelines.insert(name.to_string(), spec);
        Ok(self)
    }

    pub fn alias(mut self, alias: &str, target: &str) -> Result<Self, PipelineError> {
        if self.pipelines.contains_key(alias) || self.aliases.contains_key(alias) {
            return Err(PipelineError::DuplicateName(alias.to_string()));
        }
        self.aliases.insert(alias.to_string(), target.to_string());
        Ok(self)
    }

    pub fn define(self, definition: PipelineDefinition) -> Result<Self, PipelineError> {
        let mut builder = self.register(&definition.name, definition.stages)?;
        for alias in &definition.aliases {
            builder = builder.alias(alias, &definition.name)?;
        }
        Ok(builder)
    }

    /// Register every `*.json` pipeline definition in `dir`, in file name
    /// order. A missing directory registers nothing.
    pub fn load_from_dir(mut self, dir: &Path) -> Result<Self, PipelineError> {
        if !dir.exists() {
            return Ok(self);
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|e| e == "json"))
            .collect();
        paths.sort();
        for path in paths {
            let content = fs::read_to_string(&path)?;
            let definition: PipelineDefinition =
                serde_json::from_str(&content).map_err(|source| PipelineError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            debug!(name = %definition.name, path = %path.display(), "loaded pipeline definition");
            self = self.define(definition)?;
        }
        Ok(self)
    }

    pub fn build(self) -> Result<PipelineRegistry, PipelineError> {
        for (alias, target) in &self.aliases {
            if !self.pipelines.contains_key(target) {
                return Err(PipelineError::DanglingAlias {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(PipelineRegistry {
            pipelines: self.pipelines,
            aliases: self.aliases,
        })
    }
}

const REFERENCE_STAGES: &[&str] = &[
    stages::LINK_REFERENCE,
    stages::ISSUE_REFERENCE,
    stages::MERGE_REQUEST_REFERENCE,
    stages::SNIPPET_REFERENCE,
    stages::COMMIT_REFERENCE,
    stages::USER_REFERENCE,
];

/// Builder preloaded with the built-in pipelines, for callers that want to
/// add their own names on top.
pub fn standard_builder() -> PipelineRegistryBuilder {
    let full: Vec<&str> = [stages::MARKDOWN, stages::SANITIZE]
        .into_iter()
        .chain(REFERENCE_STAGES.iter().copied())
        .collect();
    let single_line: Vec<&str> = [stages::MARKDOWN, stages::SANITIZE, stages::SINGLE_LINE]
        .into_iter()
        .chain(REFERENCE_STAGES.iter().copied())
        .collect();
    let commit_description = [
        stages::PLAIN_TEXT,
        stages::ISSUE_REFERENCE,
        stages::MERGE_REQUEST_REFERENCE,
        stages::COMMIT_REFERENCE,
    ];

    let table: [(&str, Vec<&str>); 6] = [
        (DEFAULT_PIPELINE, full),
        ("plain_markdown", vec![stages::MARKDOWN, stages::SANITIZE]),
        ("single_line", single_line),
        ("commit_description", commit_description.to_vec()),
        ("broadcast_message", vec![stages::MARKDOWN, stages::SANITIZE]),
        ("plain_text", vec![stages::PLAIN_TEXT]),
    ];

    let mut builder = PipelineRegistryBuilder::default();
    for (name, stage_list) in table {
        let spec = PipelineSpec::new(name, stage_list.into_iter().map(StageId::from).collect());
        builder.pipelines.insert(name.to_string(), spec);
    }
    for alias in ["gfm", "description", "note"] {
        builder
            .aliases
            .insert(alias.to_string(), DEFAULT_PIPELINE.to_string());
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_default_is_full() {
        let registry = PipelineRegistry::standard();
        let spec = registry.resolve(&PipelineIdentifier::Default).unwrap();
        assert_eq!(spec.name(), DEFAULT_PIPELINE);
        assert_eq!(spec.stages()[0].as_str(), stages::MARKDOWN);
    }

    #[test]
    fn test_alias_resolves_to_target() {
        let registry = PipelineRegistry::standard();
        let spec = registry.resolve(&PipelineIdentifier::name("note")).unwrap();
        assert_eq!(spec.name(), DEFAULT_PIPELINE);
    }

    #[test]
    fn test_unknown_name_is_named_error() {
        let registry = PipelineRegistry::standard();
        let err = registry.resolve(&PipelineIdentifier::name("fulll")).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPipeline(ref n) if n == "fulll"));
    }

    #[test]
    fn test_stage_list_wrapped_as_is() {
        let registry = PipelineRegistry::standard();
        let spec = registry
            .resolve_value(&json!(["plain_text", "issue_reference"]))
            .unwrap();
        assert_eq!(spec.name(), CUSTOM_PIPELINE);
        assert_eq!(spec.stages().len(), 2);
    }

    #[test]
    fn test_wrong_shape_is_invalid_identifier() {
        let registry = PipelineRegistry::standard();
        for value in [json!(42), json!({"name": "full"}), json!(["markdown", 3])] {
            let err = registry.resolve_value(&value).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidPipelineIdentifier(_)), "{value}");
        }
        assert_eq!(
            registry.resolve_value(&Value::Null).unwrap().name(),
            DEFAULT_PIPELINE
        );
    }

    #[test]
    fn test_duplicate_and_dangling_names_rejected() {
        let dup = standard_builder().register("full", ["markdown"]);
        assert!(matches!(dup, Err(PipelineError::DuplicateName(_))));

        let dangling = PipelineRegistry::builder()
            .alias("x", "missing")
            .unwrap()
            .build();
        assert!(matches!(dangling, Err(PipelineError::DanglingAlias { .. })));
    }

    #[test]
    fn test_load_from_dir_registers_definitions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("wiki.json"),
            r#"{"name": "wiki", "stages": ["markdown", "sanitize"], "aliases": ["wiki_page"]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = standard_builder()
            .load_from_dir(dir.path())
            .unwrap()
            .build()
            .unwrap();
        let spec = registry.resolve(&PipelineIdentifier::name("wiki_page")).unwrap();
        assert_eq!(spec.name(), "wiki");
        assert_eq!(registry.aliases_of("wiki"), vec!["wiki_page"]);
    }

    #[test]
    fn test_malformed_definition_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        let err = standard_builder().load_from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
