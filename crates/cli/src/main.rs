//! Collective CLI - plan orchestration over LLM backends.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use collective_backend::HttpCompletionClient;
use collective_core::BackendRegistry;
use collective_execution::{Budget, Context, EngineConfig, ExecutionEngine, PlanSource};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "collective")]
#[command(about = "Execute multi-step plans across LLM backends", long_about = None)]
struct Cli {
    /// Backend registry JSON (defaults to the builtin backends)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Maximum steps in flight at once
    #[arg(long, global = true)]
    max_concurrent: Option<NonZeroUsize>,

    /// Whole-run deadline in seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Backend used by the fallback plan
    #[arg(long, global = true)]
    default_backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file
    Run {
        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,
        /// Plan domain
        #[arg(long)]
        domain: String,
        /// Context values as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Ask the reasoning backend for a plan and execute it
    Plan {
        /// Task type, e.g. generate_proposal
        #[arg(long)]
        task_type: String,
        /// Plan domain
        #[arg(long)]
        domain: String,
        /// Context values as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Validate a plan file and print its waves without dispatching
    Resolve {
        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,
        /// Plan domain
        #[arg(long)]
        domain: String,
    },
    /// List registered backends
    Backends,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let registry = match &cli.registry {
        Some(path) => BackendRegistry::load(path)
            .with_context(|| format!("loading registry {}", path.display()))?,
        None => BackendRegistry::builtin(),
    };

    let mut budget = Budget::default();
    if let Some(max) = cli.max_concurrent {
        budget = budget.with_max_concurrent(max);
    }
    let mut config = EngineConfig::default().with_budget(budget);
    if let Some(secs) = cli.deadline_secs {
        config = config.with_run_deadline(Duration::from_secs(secs));
    }
    if let Some(backend) = cli.default_backend {
        anyhow::ensure!(registry.contains(&backend), "unknown default backend: {}", backend);
        config = config.with_default_backend(backend);
    }

    let client = HttpCompletionClient::new().context("creating HTTP client")?;
    let engine = ExecutionEngine::new(Arc::new(registry), Arc::new(client)).with_config(config);

    match cli.command {
        Commands::Run { plan, domain, context } => {
            let body = read_plan(&plan)?;
            let context = parse_context(context.as_deref())?;

            let result = engine.execute(PlanSource::raw(domain, body), &context).await?;
            info!(failed = result.failed_steps().count(), "Run finished");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Plan { task_type, domain, context } => {
            let context = parse_context(context.as_deref())?;

            let result = engine.plan_and_execute(&task_type, &domain, &context).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Resolve { plan, domain } => {
            let body = read_plan(&plan)?;
            let (plan, waves, fallback) = engine.prepare(PlanSource::raw(domain, body));

            if let Some(reason) = fallback {
                println!("Fallback plan in use: {:?}", reason);
            }
            println!("Plan {} ({} steps)", plan.task_id(), plan.steps().len());
            for (i, wave) in waves.iter().enumerate() {
                let keys: Vec<String> = wave.iter().map(ToString::to_string).collect();
                println!("  wave {}: {}", i + 1, keys.join(", "));
            }
        }
        Commands::Backends => {
            println!("Backends ({})", engine.registry().len());
            for backend in engine.registry().iter() {
                println!(
                    "  {} | {} | {} - {}",
                    backend.name, backend.model, backend.address, backend.specialization
                );
            }
        }
    }

    Ok(())
}

fn read_plan(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading plan {}", path.display()))
}

fn parse_context(raw: Option<&str>) -> Result<Context> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("context must be a JSON object"),
        None => Ok(Context::new()),
    }
}
