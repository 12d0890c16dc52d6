//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use markgate_core::{
    filters::FilterContext,
    pipeline::{DEFAULT_PIPELINE, stages},
    AccessError, AccessPolicy, AccessQuery, CacheStore, CachedHtml, Document, FieldKey,
    MarkupEngine, MarkupTransform, MemoryStore, Owner, PipelineError, PipelineIdentifier,
    PipelineRegistry, PipelineSpec, RedactionError, ReferenceScanner, RenderContext,
    RenderContextSeed, RenderError, Renderable, RenderableField, RenderedDocument,
    StageTransform, StaticPolicy, StoreError, Target, TransformError, Viewer,
    VisibilityRegistry,
};

// --- Test doubles ---

#[derive(Default)]
struct CountingTransform {
    inner: StageTransform,
    calls: AtomicUsize,
}

impl MarkupTransform for CountingTransform {
    fn transform(
        &self,
        raw: &str,
        pipeline: &PipelineSpec,
        context: &FilterContext,
    ) -> Result<Document, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.transform(raw, pipeline, context)
    }
}

#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    fetches: AtomicUsize,
    persists: AtomicUsize,
}

impl CacheStore for CountingStore {
    fn fetch(&self, key: &FieldKey) -> Result<Option<CachedHtml>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(key)
    }

    fn persist(&self, key: &FieldKey, entry: &CachedHtml) -> Result<(), StoreError> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(key, entry)
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }
}

/// Delegates to a grant table and records the ability of every call.
struct CountingPolicy {
    inner: StaticPolicy,
    calls: Mutex<Vec<String>>,
}

impl CountingPolicy {
    fn new(inner: StaticPolicy) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls_for(&self, ability: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|a| *a == ability).count()
    }
}

impl AccessPolicy for CountingPolicy {
    fn permitted(
        &self,
        viewer: Option<&Viewer>,
        query: &AccessQuery,
    ) -> Result<HashSet<Target>, AccessError> {
        self.calls.lock().unwrap().push(query.ability.clone());
        self.inner.permitted(viewer, query)
    }
}

/// Fails every query for one ability.
struct FailingPolicy {
    ability: &'static str,
}

impl AccessPolicy for FailingPolicy {
    fn permitted(
        &self,
        _viewer: Option<&Viewer>,
        query: &AccessQuery,
    ) -> Result<HashSet<Target>, AccessError> {
        if query.ability == self.ability {
            return Err(AccessError::new(&query.ability, "authorization backend unavailable"));
        }
        Ok(query.targets.iter().cloned().collect())
    }
}

struct Issue {
    id: u64,
    description: &'static str,
    project: Owner,
    local_version: u16,
}

impl Issue {
    fn new(id: u64, description: &'static str, project: &str) -> Self {
        Self {
            id,
            description,
            project: Owner::new(id, project),
            local_version: 0,
        }
    }
}

impl Renderable for Issue {
    fn renderable_field(&self, field: &str) -> Option<RenderableField> {
        match field {
            "description" => Some(
                RenderableField::new(
                    FieldKey::new(format!("issue/{}", self.id), field),
                    self.description,
                )
                .with_owner(self.project.clone())
                .with_local_version(self.local_version),
            ),
            "title" => Some(
                RenderableField::new(FieldKey::new(format!("issue/{}", self.id), field), "title")
                    .with_pipeline(PipelineIdentifier::name("single_line"))
                    .cacheless(),
            ),
            _ => None,
        }
    }
}

struct Harness {
    transform: Arc<CountingTransform>,
    store: Arc<CountingStore>,
    policy: Arc<CountingPolicy>,
    engine: MarkupEngine,
}

fn harness(grants: StaticPolicy) -> Harness {
    let transform = Arc::new(CountingTransform::default());
    let store = Arc::new(CountingStore::default());
    let policy = Arc::new(CountingPolicy::new(grants));
    let engine = MarkupEngine::new(
        Arc::new(PipelineRegistry::standard()),
        transform.clone(),
        store.clone(),
        Arc::new(VisibilityRegistry::standard()),
        policy.clone(),
    );
    Harness {
        transform,
        store,
        policy,
        engine,
    }
}

fn viewer_seed(name: &str) -> RenderContextSeed {
    RenderContextSeed::for_viewer(Some(Viewer::new(1, name)))
}

// --- Render cache ---

#[test]
fn invariant_fresh_entry_never_transforms() {
    let h = harness(StaticPolicy::new());
    let field = Issue::new(1, "**bold** #3", "g/p")
        .renderable_field("description")
        .unwrap();

    let first = h.engine.render_field(&field).unwrap();
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        assert_eq!(h.engine.render_field(&field).unwrap(), first);
    }
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn invariant_version_bump_forces_exactly_one_transform() {
    let h = harness(StaticPolicy::new());
    let mut issue = Issue::new(1, "text", "g/p");
    h.engine
        .render_field(&issue.renderable_field("description").unwrap())
        .unwrap();

    issue.local_version = 1;
    let bumped = issue.renderable_field("description").unwrap();
    h.engine.render_field(&bumped).unwrap();
    h.engine.render_field(&bumped).unwrap();
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invariant_edited_text_is_rerendered() {
    let h = harness(StaticPolicy::new());
    let key = FieldKey::new("issue/1", "description");
    let before = h
        .engine
        .render_field(&RenderableField::new(key.clone(), "before"))
        .unwrap();
    let after = h
        .engine
        .render_field(&RenderableField::new(key, "after"))
        .unwrap();
    assert_ne!(before, after);
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invariant_read_only_storage_is_not_an_error() {
    let h = harness(StaticPolicy::new());
    h.store.inner.set_read_only(true);
    let field = RenderableField::new(FieldKey::new("note/1", "note"), "hello");

    assert!(h.engine.render_field(&field).unwrap().contains("hello"));
    assert!(h.engine.render_field(&field).unwrap().contains("hello"));
    assert_eq!(h.store.persists.load(Ordering::SeqCst), 0);
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invariant_cacheless_field_never_touches_storage() {
    let h = harness(StaticPolicy::new());
    let field = Issue::new(1, "", "g/p").renderable_field("title").unwrap();
    assert_eq!(h.engine.render_field(&field).unwrap().trim(), "title");
    assert_eq!(h.store.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.persists.load(Ordering::SeqCst), 0);
}

// --- Pipeline resolution ---

#[test]
fn invariant_pipeline_resolution_is_total() {
    let registry = PipelineRegistry::standard();
    assert_eq!(
        registry.resolve(&PipelineIdentifier::Default).unwrap().name(),
        DEFAULT_PIPELINE
    );
    assert!(matches!(
        registry.resolve(&PipelineIdentifier::name("no_such_pipeline")),
        Err(PipelineError::UnknownPipeline(_))
    ));

    let h = harness(StaticPolicy::new());
    let field = RenderableField::new(FieldKey::new("x/1", "body"), "x")
        .with_pipeline(PipelineIdentifier::name("no_such_pipeline"));
    assert!(matches!(
        h.engine.render_field(&field),
        Err(RenderError::Pipeline(PipelineError::UnknownPipeline(_)))
    ));
    assert_eq!(h.transform.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn invariant_stage_list_runs_as_given() {
    let h = harness(StaticPolicy::new());
    let field = RenderableField::new(FieldKey::new("x/1", "body"), "a < b")
        .with_pipeline(PipelineIdentifier::Stages(vec![stages::PLAIN_TEXT.into()]));
    assert_eq!(h.engine.render_field(&field).unwrap(), "<p>a &lt; b</p>");
}

// --- Redaction ---

#[test]
fn invariant_visible_markup_is_byte_identical() {
    let h = harness(StaticPolicy::new().grant("ann", "read_issue", Target::scoped("g/p", "1")));
    let html = r#"<p>Related: <a href="/g/p/-/issues/1" class="gfm gfm-issue" data-reference="true" data-reference-type="issue" data-issue="1" title="A &amp; B">#1</a>, <a href="/g/p/-/issues/2" data-reference="true" data-reference-type="issue" data-issue="2"><strong>#2</strong></a></p>"#;
    let doc = Document::parse(html);
    let found = ReferenceScanner::scan(&[RenderedDocument::new(doc.clone(), None)]);
    let visible_id = found.values().flatten().next().unwrap().handle().node;
    let before = doc.outer_html(visible_id);

    let rendered = h
        .engine
        .post_process(html, Some(Owner::new(1, "g/p")), &viewer_seed("ann"))
        .unwrap();
    // Reparsing assigns fresh ids in the same order.
    let after_found = ReferenceScanner::scan(std::slice::from_ref(&rendered));
    let after_id = after_found.values().flatten().next().unwrap().handle().node;
    assert_eq!(after_id, visible_id);
    assert_eq!(rendered.document.outer_html(after_id), before);

    let out = rendered.html();
    assert!(out.contains(&before));
    assert!(out.ends_with(", <strong>#2</strong></p>"));
    assert!(!out.contains(r#"data-issue="2""#));
    assert_eq!(rendered.visible_reference_count(), 1);
}

#[test]
fn invariant_one_authorization_call_per_kind_per_batch() {
    let h = harness(StaticPolicy::new());
    let issues: Vec<Issue> = (1..=5)
        .map(|i| Issue::new(i, "See #1, #2, !3 and $4. Also !9.", "g/p"))
        .collect();

    let docs = h.engine.render(&issues, "description", &viewer_seed("ann")).unwrap();
    assert_eq!(docs.len(), 5);
    assert_eq!(h.policy.calls_for("read_issue"), 1);
    assert_eq!(h.policy.calls_for("read_merge_request"), 1);
    assert_eq!(h.policy.calls_for("read_snippet"), 1);
    assert_eq!(h.policy.calls.lock().unwrap().len(), 3);
}

#[test]
fn invariant_authorization_failure_fails_closed() {
    let engine = MarkupEngine::standard(
        Arc::new(MemoryStore::new()),
        Arc::new(FailingPolicy {
            ability: "read_merge_request",
        }),
    );
    let issues = vec![
        Issue::new(1, "#1 and !2", "g/p"),
        Issue::new(2, "!3", "g/p"),
    ];
    let err = engine
        .render(&issues, "description", &viewer_seed("ann"))
        .unwrap_err();
    assert!(matches!(
        err,
        RenderError::Redaction(RedactionError::Authorization { ref kind, .. }) if kind == "merge_request"
    ));

    // The caller-driven path leaves the documents inspectable.
    let mut docs: Vec<RenderedDocument> = issues
        .iter()
        .map(|i| {
            let html = engine
                .render_field(&i.renderable_field("description").unwrap())
                .unwrap();
            RenderedDocument::new(Document::parse(&html), Some(i.project.clone()))
        })
        .collect();
    let context = RenderContext::new(Some(Viewer::new(1, "ann")), Some(Owner::new(1, "g/p")));
    assert!(engine.redact(&mut docs, &context).is_err());
    for doc in &docs {
        assert!(!doc.html().contains("data-reference"));
        assert_eq!(doc.visible_reference_count(), 0);
    }
}

#[test]
fn invariant_visible_count_matches_unredacted_nodes() {
    let grants = StaticPolicy::new()
        .grant("ann", "read_issue", Target::scoped("g/p", "1"))
        .grant("ann", "read_issue", Target::scoped("g/p", "2"))
        .grant("ann", "read_user", Target::global("bob"));
    let h = harness(grants);
    let issues = vec![
        Issue::new(1, "#1 #2 #3 @bob @carol", "g/p"),
        Issue::new(2, "nothing to see", "g/p"),
        Issue::new(3, "#3", "g/p"),
    ];
    let docs = h.engine.render(&issues, "description", &viewer_seed("ann")).unwrap();

    for doc in &docs {
        let remaining = ReferenceScanner::count(&ReferenceScanner::scan(std::slice::from_ref(doc)));
        assert_eq!(doc.visible_reference_count(), remaining);
    }
    assert_eq!(docs[0].visible_reference_count(), 3);
    assert_eq!(docs[1].visible_reference_count(), 0);
    assert_eq!(docs[2].visible_reference_count(), 0);
}

#[test]
fn invariant_shared_reference_resolves_per_document_owner() {
    // A and B both mention #7; only A's project is readable.
    let h = harness(StaticPolicy::new().grant("ann", "read_issue", Target::scoped("a/p", "7")));
    let objects = vec![
        Issue::new(1, "Fixes #7", "a/p"),
        Issue::new(2, "Fixes #7", "b/p"),
    ];
    let docs = h.engine.render(&objects, "description", &viewer_seed("ann")).unwrap();

    assert!(docs[0].html().contains(r#"data-reference-type="issue""#));
    assert!(docs[0].html().contains(r#"data-issue="7""#));
    assert_eq!(docs[0].visible_reference_count(), 1);
    assert_eq!(docs[1].html(), "<p>Fixes #7</p>\n");
    assert_eq!(docs[1].visible_reference_count(), 0);
    assert_eq!(h.policy.calls_for("read_issue"), 1);
}

#[test]
fn invariant_owner_override_applies_to_whole_batch() {
    let h = harness(StaticPolicy::new().grant("ann", "read_issue", Target::scoped("forced/p", "7")));
    let objects = vec![
        Issue::new(1, "Fixes #7", "a/p"),
        Issue::new(2, "Fixes #7", "b/p"),
    ];
    let seed = RenderContextSeed {
        owner_override: Some(Owner::new(9, "forced/p")),
        ..viewer_seed("ann")
    };
    let docs = h.engine.render(&objects, "description", &seed).unwrap();
    assert!(docs.iter().all(|d| d.visible_reference_count() == 1));
}
