use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dispatch::{
    render_guidance, GraphClient, GraphIntelClient, LearningStore, ReviewQueue, WorkKind,
    WorkRecordStore,
};
use drover::{BdBridge, GitCommitBridge, Orchestrator, OrchestratorConfig, SubprocessWorker};

#[derive(Parser)]
#[command(name = "drover", about = "Autonomous work orchestrator", version)]
struct Cli {
    /// Optional TOML config layered over DROVER_* env defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration loop until the backlog drains.
    Run,
    /// Print queue counts and the pending manual-review records.
    Status,
    /// Print the top learned failure patterns.
    Learnings {
        /// How many records to show.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Requeue any items left in-progress by an interrupted run.
    Requeue,
    /// Print the dependency tree the tracker reports for an item.
    Deps { id: String },
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    match &cli.config {
        Some(path) => OrchestratorConfig::from_toml(path),
        None => Ok(OrchestratorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Status => status(&config),
        Command::Learnings { top } => learnings(&config, top),
        Command::Requeue => requeue(&config),
        Command::Deps { id } => deps(&config, &id),
    }
}

async fn run(config: OrchestratorConfig) -> Result<()> {
    let mut graph = GraphClient::new(Arc::new(BdBridge::new(config.tracker_bin.clone())));
    if let Some(url) = &config.intel_url {
        let intel = GraphIntelClient::new(url.clone());
        if intel.is_reachable().await {
            let insights = intel.insights().await;
            let tracks = intel.execution_plan().await;
            info!(
                url = %url,
                bottlenecks = insights.bottlenecks.len(),
                keystones = insights.keystones.len(),
                cycles = insights.cycles.len(),
                tracks = tracks.len(),
                "Graph intelligence overlay connected"
            );
        } else {
            warn!(url = %url, "Graph intelligence overlay unreachable — reduced ranking");
        }
        graph = graph.with_intel(intel);
    }

    let worker = Arc::new(SubprocessWorker::new(
        config.worker_argv()?,
        &config.repo_root,
        config.briefs_dir(),
        config.worker_timeout(),
    ));
    let vcs = Arc::new(
        GitCommitBridge::new(&config.repo_root)
            .context("Repository root must be a git repository")?,
    );

    let orchestrator = Orchestrator::new(config, graph, worker, vcs)?;

    // Ctrl-C requeues in-flight work through the ordinary recovery path.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received — shutting down after this tick");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run().await?;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        escalated = summary.escalated,
        "Run summary"
    );
    Ok(())
}

fn status(config: &OrchestratorConfig) -> Result<()> {
    let store = WorkRecordStore::open(config.records_path())?;
    let counts = store.counts()?;
    println!(
        "ready={} in_progress={} blocked={} completed={} failed={}",
        counts.ready, counts.in_progress, counts.blocked, counts.completed, counts.failed
    );

    let reviews = ReviewQueue::new(config.review_dir());
    for record in reviews.pending()? {
        println!(
            "review pending: {} ({}) since {}",
            record.item_id, record.reason, record.created_at
        );
    }
    Ok(())
}

fn learnings(config: &OrchestratorConfig, top: usize) -> Result<()> {
    let store = LearningStore::open(config.improvements_path())?;
    let records = store.top_relevant(WorkKind::Unknown, top);
    if records.is_empty() {
        println!("no failure patterns learned yet");
    } else {
        print!("{}", render_guidance(&records));
    }
    Ok(())
}

fn requeue(config: &OrchestratorConfig) -> Result<()> {
    let store = WorkRecordStore::open(config.records_path())?;
    let ids = store.requeue_all_in_flight("requeued by operator")?;
    println!("requeued {} item(s)", ids.len());
    Ok(())
}

fn deps(config: &OrchestratorConfig, id: &str) -> Result<()> {
    let graph = GraphClient::new(Arc::new(BdBridge::new(config.tracker_bin.clone())));
    let edges = graph.dependency_tree(id);
    if edges.is_empty() {
        println!("no dependency edges for {id}");
    }
    for edge in edges {
        println!("{} -> {}", edge.from, edge.to);
    }
    Ok(())
}
