use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use fleet_lite::config::EngineConfig;
use fleet_lite::engine::Engine;
use fleet_lite::model::{
    AgentId, AgentStatusReport, Capacity, FinishReason, Job, JobDescriptor, JobId, TaskId,
    TaskState,
};
use fleet_lite::placement::{LeastLoadedPlacement, RecordingRuntime};
use fleet_lite::shutdown::install_shutdown_handler;
use fleet_lite::store::InMemoryStore;
use fleet_lite::stream::{EventKind, JobEvent};

#[derive(Parser, Debug)]
#[command(name = "fleet-lite")]
#[command(version)]
#[command(about = "Task lifecycle engine for a cluster job manager")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run jobs against simulated agents and print their event streams
    Simulate(SimulateArgs),

    /// Print the effective engine configuration as JSON
    Config {
        /// Engine configuration file (JSON, camelCase keys)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Engine configuration file (JSON, camelCase keys)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Number of simulated agents
    #[arg(long, default_value = "3")]
    agents: usize,

    /// Submit a batch job with this many tasks
    #[arg(long)]
    batch: Option<u32>,

    /// Retries per batch index
    #[arg(long, default_value = "0")]
    retry_limit: u32,

    /// Submit a service job with this desired size
    #[arg(long)]
    service: Option<u32>,

    /// Kill the service job after this long
    #[arg(long, default_value = "2000")]
    kill_after_ms: u64,

    /// How long each simulated task runs
    #[arg(long, default_value = "200")]
    task_ms: u64,

    /// Probability that a simulated task fails instead of finishing normally
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSummaryOutput {
    job_id: String,
    job_type: String,
    state: String,
    tasks_created: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(path: &Option<PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(EngineConfig::from_json(&raw)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn describe_event(event: &JobEvent) -> (String, String, String) {
    match &event.kind {
        EventKind::Task(t) => {
            let from = t
                .from
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            let detail = match &t.message {
                Some(message) => format!("{} -> {} ({})", from, t.to, message),
                None => format!("{} -> {}", from, t.to),
            };
            ("task".to_string(), t.index.to_string(), detail)
        }
        EventKind::Job(j) => {
            let from = j
                .from
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            ("job".to_string(), "-".to_string(), format!("{} -> {}", from, j.to))
        }
    }
}

fn print_event(event: &JobEvent, output: &OutputFormat) -> Result<(), serde_json::Error> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Table => {
            let (kind, index, detail) = describe_event(event);
            let job = event.job_id.to_string();
            println!(
                "{:<10} {:<5} {:<6} {:<6} {}",
                &job[..8],
                event.seq,
                kind,
                index,
                detail
            );
        }
    }
    Ok(())
}

// =============================================================================
// Simulated Agents
// =============================================================================

/// Drives one task through the agent side of its lifecycle.
async fn run_simulated_task(engine: Engine, task_id: TaskId, task_ms: u64, fail_rate: f64) {
    // Wait for the placement result to land before reporting.
    loop {
        match engine.task(task_id).await {
            Ok(task) if task.state == TaskState::Accepted => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(task) if task.state == TaskState::Launched => break,
            _ => return,
        }
    }

    for state in [TaskState::StartInitiated, TaskState::Started] {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Err(e) = engine
            .report_status(AgentStatusReport::new(task_id, state))
            .await
        {
            tracing::debug!(task_id = %task_id, error = %e, "Report dropped");
            return;
        }
    }

    tokio::time::sleep(Duration::from_millis(task_ms)).await;
    let fails = rand::thread_rng().gen_bool(fail_rate.clamp(0.0, 1.0));
    let report = if fails {
        AgentStatusReport::new(task_id, TaskState::Finished(FinishReason::Failed))
            .with_message("simulated failure")
    } else {
        AgentStatusReport::new(task_id, TaskState::Finished(FinishReason::Normal))
    };
    let _ = engine.report_status(report).await;
}

/// Confirms every kill signal the engine sends.
async fn confirm_kills(engine: Engine, mut kills: mpsc::UnboundedReceiver<TaskId>) {
    while let Some(task_id) = kills.recv().await {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = AgentStatusReport::new(task_id, TaskState::Finished(FinishReason::Killed));
        let _ = engine.report_status(report).await;
    }
}

async fn heartbeat_agents(engine: Engine, agents: Vec<AgentId>) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    let shutdown = engine.shutdown_token();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for agent in &agents {
                    engine.agent_heartbeat(agent).await;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Print a job's events as they happen and start a simulated agent for each
/// task it creates. Returns once the job's stream completes.
async fn follow_job(
    engine: Engine,
    job_id: JobId,
    args: Arc<SimulateArgs>,
) -> Result<Job, Box<dyn std::error::Error + Send + Sync>> {
    let mut subscription = engine.subscribe(job_id).await?;
    while let Some(event) = subscription.recv().await {
        let event = event?;
        print_event(&event, &args.output)?;
        if let Some(t) = event.as_task() {
            if t.from.is_none() {
                tokio::spawn(run_simulated_task(
                    engine.clone(),
                    t.task_id,
                    args.task_ms,
                    args.fail_rate,
                ));
            }
        }
    }
    Ok(engine.job(job_id).await?)
}

// =============================================================================
// Commands
// =============================================================================

async fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    let shutdown = install_shutdown_handler()?;

    let agents: Vec<AgentId> = (1..=args.agents.max(1))
        .map(|i| AgentId::new(format!("agent-{}", i)))
        .collect();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();

    let engine = Engine::new(
        config,
        Arc::new(LeastLoadedPlacement::new(agents.clone())),
        Arc::new(RecordingRuntime::with_kill_listener(kill_tx)),
        Arc::new(InMemoryStore::new()),
        shutdown.clone(),
    );
    engine.start();
    tokio::spawn(confirm_kills(engine.clone(), kill_rx));
    tokio::spawn(heartbeat_agents(engine.clone(), agents));

    let mut descriptors = Vec::new();
    if let Some(size) = args.batch {
        descriptors.push(JobDescriptor::batch("simulated-batch", size).with_retry_limit(args.retry_limit));
    }
    if let Some(size) = args.service {
        descriptors.push(JobDescriptor::service(
            "simulated-service",
            Capacity::new(0, size, size.max(1) * 2),
        ));
    }
    if descriptors.is_empty() {
        descriptors.push(JobDescriptor::batch("simulated-batch", 3).with_retry_limit(args.retry_limit));
    }

    if matches!(args.output, OutputFormat::Table) {
        println!("{:<10} {:<5} {:<6} {:<6} TRANSITION", "JOB", "SEQ", "KIND", "INDEX");
        println!("{}", "-".repeat(70));
    }

    let args = Arc::new(args);
    let mut followers = Vec::new();
    for descriptor in descriptors {
        let is_service = descriptor.capacity().is_some();
        let job_id = engine.submit_job(descriptor).await?;
        followers.push(tokio::spawn(follow_job(engine.clone(), job_id, args.clone())));

        if is_service {
            let engine = engine.clone();
            let delay = Duration::from_millis(args.kill_after_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = engine.kill_job(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Kill failed");
                }
            });
        }
    }

    let mut summaries = Vec::new();
    for follower in followers {
        tokio::select! {
            result = follower => {
                let job = result?.map_err(|e| e.to_string())?;
                let tasks_created = engine.tasks(job.id).await?.len();
                summaries.push(JobSummaryOutput {
                    job_id: job.id.to_string(),
                    job_type: job.job_type().to_string(),
                    state: job.state.to_string(),
                    tasks_created,
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }

    match args.output {
        OutputFormat::Json => {
            for summary in &summaries {
                println!("{}", serde_json::to_string(summary)?);
            }
        }
        OutputFormat::Table => {
            println!();
            println!("{:<38} {:<8} {:<18} TASKS", "JOB ID", "TYPE", "STATE");
            println!("{}", "-".repeat(72));
            for summary in &summaries {
                println!(
                    "{:<38} {:<8} {:<18} {}",
                    summary.job_id, summary.job_type, summary.state, summary.tasks_created
                );
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn run_config(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Simulate(args) => run_simulate(args).await,
        Commands::Config { config } => run_config(config),
    }
}
