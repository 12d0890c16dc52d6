//! Markgate CLI - render and redact markup from the shell
//!
//! Commands: pipelines, render, redact, render-and-redact
//! Outputs JSON to stdout, logs to stderr (RUST_LOG)
//! Returns non-zero when rendering or redaction fails

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use markgate_core::{
    EngineConfig, FieldKey, MarkupEngine, Owner, PipelineIdentifier, RenderContextSeed,
    RenderableField, StaticPolicy, Viewer,
};

#[derive(Parser)]
#[command(name = "markgate-cli")]
#[command(about = "Markgate CLI - cached markup rendering with reference redaction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File-backed cache directory (overrides config)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Never write to the cache
    #[arg(long)]
    read_only: bool,

    /// Directory of extra pipeline definitions (overrides config)
    #[arg(long)]
    pipelines_dir: Option<PathBuf>,

    /// Skip the container readability check for qualified references
    #[arg(long)]
    skip_project_check: bool,

    /// Prefix for generated reference links (overrides config)
    #[arg(long)]
    base_path: Option<String>,

    /// Access policy file (StaticPolicy JSON). Without one nothing is granted.
    #[arg(short, long)]
    policy: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered pipelines
    Pipelines,

    /// Render one field through the cache (no redaction)
    Render {
        /// Object identifier, e.g. issue/42
        #[arg(long)]
        object: String,

        /// Field name
        #[arg(long, default_value = "description")]
        field: String,

        #[command(flatten)]
        input: TextInput,

        #[command(flatten)]
        owner: OwnerArgs,

        /// Render without touching the cache
        #[arg(long)]
        cacheless: bool,
    },

    /// Redact rendered HTML for a viewer
    Redact {
        /// Rendered HTML
        #[arg(long)]
        html: String,

        #[command(flatten)]
        owner: OwnerArgs,

        #[command(flatten)]
        view: ViewArgs,
    },

    /// Render text and redact it for a viewer
    RenderAndRedact {
        #[command(flatten)]
        input: TextInput,

        #[command(flatten)]
        owner: OwnerArgs,

        /// Cache the render under this key
        #[arg(long)]
        cache_key: Option<String>,

        #[command(flatten)]
        view: ViewArgs,
    },
}

#[derive(Args)]
struct TextInput {
    /// Raw markup text
    #[arg(long)]
    text: String,

    /// Pipeline name, or a JSON array of stage ids
    #[arg(long)]
    pipeline: Option<String>,
}

#[derive(Args)]
struct OwnerArgs {
    /// Owning container path, e.g. group/project
    #[arg(long)]
    owner: Option<String>,

    /// Owning container id
    #[arg(long, default_value_t = 0)]
    owner_id: u64,
}

#[derive(Args)]
struct ViewArgs {
    /// Viewer username; anonymous when absent
    #[arg(long)]
    viewer: Option<String>,

    #[arg(long, default_value_t = 0)]
    viewer_id: u64,

    #[arg(long)]
    admin: bool,
}

impl OwnerArgs {
    fn owner(&self) -> Option<Owner> {
        self.owner.as_ref().map(|p| Owner::new(self.owner_id, p.as_str()))
    }
}

impl TextInput {
    fn pipeline(&self) -> Result<PipelineIdentifier, String> {
        match self.pipeline.as_deref() {
            Some(raw) if raw.trim_start().starts_with('[') => {
                let value: Value = serde_json::from_str(raw)
                    .map_err(|e| format!("Invalid stage list: {}", e))?;
                PipelineIdentifier::try_from(&value).map_err(|e| e.to_string())
            }
            other => Ok(PipelineIdentifier::from(other)),
        }
    }
}

impl ViewArgs {
    fn seed(&self) -> RenderContextSeed {
        let viewer = self.viewer.as_ref().map(|name| {
            let mut viewer = Viewer::new(self.viewer_id, name.as_str());
            viewer.admin = self.admin;
            viewer
        });
        RenderContextSeed::for_viewer(viewer)
    }
}

fn fail(error: impl std::fmt::Display) -> ExitCode {
    let output = json!({ "success": false, "error": error.to_string() });
    println!("{}", output);
    ExitCode::FAILURE
}

fn print_json(value: &Value) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(s) => {
            println!("{}", s);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if cli.cache_dir.is_some() {
        config.cache_dir = cli.cache_dir.clone();
    }
    if cli.pipelines_dir.is_some() {
        config.pipelines_dir = cli.pipelines_dir.clone();
    }
    if let Some(base) = &cli.base_path {
        config.base_path = base.clone();
    }
    config.read_only |= cli.read_only;
    config.skip_project_check |= cli.skip_project_check;
    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let policy = match &cli.policy {
        Some(path) => match StaticPolicy::from_file(path) {
            Ok(p) => p,
            Err(e) => return fail(e),
        },
        None => StaticPolicy::new(),
    };
    let engine = match MarkupEngine::from_config(&config, Arc::new(policy)) {
        Ok(e) => e,
        Err(e) => return fail(format!("Failed to configure engine: {}", e)),
    };

    match cli.command {
        Commands::Pipelines => {
            let registry = engine.registry();
            let pipelines: Vec<_> = registry
                .list()
                .iter()
                .map(|p| {
                    json!({
                        "name": p.name(),
                        "stages": p.stages(),
                        "aliases": registry.aliases_of(p.name()),
                    })
                })
                .collect();
            print_json(&Value::Array(pipelines))
        }

        Commands::Render {
            object,
            field,
            input,
            owner,
            cacheless,
        } => {
            let pipeline = match input.pipeline() {
                Ok(p) => p,
                Err(e) => return fail(e),
            };
            let mut renderable =
                RenderableField::new(FieldKey::new(object, field), input.text.as_str())
                    .with_pipeline(pipeline)
                    .with_local_version(engine.local_cache_version());
            if let Some(owner) = owner.owner() {
                renderable = renderable.with_owner(owner);
            }
            if cacheless {
                renderable = renderable.cacheless();
            }

            match engine.render_field(&renderable) {
                Ok(html) => print_json(&json!({
                    "success": true,
                    "key": &renderable.key,
                    "version": renderable.expected_version(),
                    "html": html,
                })),
                Err(e) => fail(e),
            }
        }

        Commands::Redact { html, owner, view } => {
            match engine.post_process(&html, owner.owner(), &view.seed()) {
                Ok(rendered) => print_json(&json!({
                    "success": true,
                    "html": rendered.html(),
                    "visible_reference_count": rendered.visible_reference_count(),
                })),
                Err(e) => fail(e),
            }
        }

        Commands::RenderAndRedact {
            input,
            owner,
            cache_key,
            view,
        } => {
            let pipeline = match input.pipeline() {
                Ok(p) => p,
                Err(e) => return fail(e),
            };
            let seed = view.seed();
            let result = engine.render_and_redact(
                &input.text,
                &pipeline,
                owner.owner(),
                &seed,
                cache_key.as_deref(),
            );
            match result {
                Ok(rendered) => print_json(&json!({
                    "success": true,
                    "html": rendered.html(),
                    "visible_reference_count": rendered.visible_reference_count(),
                })),
                Err(e) => fail(e),
            }
        }
    }
}
