use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::graph::TaskGraph;
use weft_core::types::{ProcessKind, TaskKind};

use weft_engine::{ProcessEngine, RehearsalScript, RunLogger, RunOptions};

#[derive(Parser)]
#[command(name = "weft", version, about = "Task-graph workflow engine for agent crews")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph file without running it
    Validate {
        /// Graph file (.yaml, .yml, .json or .toml)
        graph: PathBuf,
    },
    /// Print the tasks of a graph and how they connect
    Plan {
        graph: PathBuf,
    },
    /// Rehearse a graph with scripted agents and print the result as JSON
    Run {
        graph: PathBuf,
        /// Rehearsal script with canned agent responses
        #[arg(long)]
        script: Option<PathBuf>,
        /// Initial input handed to the first task
        #[arg(long)]
        input: Option<String>,
        /// Placeholder value for task descriptions (key=value, repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Validate { graph } => {
            let graph = TaskGraph::load(&graph)?;
            println!(
                "ok: {} process, {} tasks",
                graph.process,
                graph.tasks.len()
            );
        }
        Commands::Plan { graph } => {
            let graph = TaskGraph::load(&graph)?;
            print_plan(&graph);
        }
        Commands::Run {
            graph,
            script,
            input,
            vars,
        } => {
            let code = run_graph(&config, &graph, script.as_deref(), input, vars).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_graph(
    config: &AppConfig,
    graph_path: &Path,
    script: Option<&Path>,
    input: Option<String>,
    vars: Vec<(String, String)>,
) -> anyhow::Result<i32> {
    let graph = TaskGraph::load(graph_path)?;
    let script = match script {
        Some(path) => RehearsalScript::load(path)?,
        None => {
            warn!("No rehearsal script given, agents will acknowledge every task");
            RehearsalScript::default()
        }
    };

    let event_bus = Arc::new(EventBus::default());
    let engine = ProcessEngine::builder(graph.process)
        .agents(script.agents_for(&graph))
        .graph(graph)
        .config(config.engine.clone())
        .observer(event_bus.clone())
        .build()?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut options = RunOptions::new().with_run_id(run_id.clone());
    if let Some(input) = input {
        options = options.with_input(input);
    }
    for (key, value) in vars {
        options = options.with_var(key, value);
    }

    // Subscribe before the run starts so no event is missed.
    let logger_cancel = CancellationToken::new();
    let logger = config.active_log().map(|log| {
        let logger = RunLogger::new(log.resolved_dir(), log.level);
        info!(path = %logger.log_path(&run_id).display(), "Run log enabled");
        let mut rx = event_bus.subscribe();
        let run_id = run_id.clone();
        let cancel = logger_cancel.clone();
        tokio::spawn(async move { logger.run_with(&mut rx, run_id, cancel).await })
    });

    // Ctrl-C cancels the run; finished tasks keep their results.
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = engine.run_with(options.with_cancel(cancel)).await;

    logger_cancel.cancel();
    if let Some(handle) = logger {
        handle.await.ok();
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.is_success() { 0 } else { 2 })
}

fn print_plan(graph: &TaskGraph) {
    println!("process: {}", graph.process);
    if let Some(manager) = &graph.manager {
        println!("manager: {manager}");
    }
    if let Some(default) = &graph.default_agent {
        println!("default agent: {default}");
    }

    let name_of = |id: &weft_core::types::TaskId| {
        graph
            .tasks
            .iter()
            .find(|t| &t.id == id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    };

    for (i, task) in graph.tasks.iter().enumerate() {
        let mut flags = vec![task.kind.label().to_string()];
        if task.is_start {
            flags.push("start".into());
        }
        if task.async_execution {
            flags.push("async".into());
        }
        let agent = task.agent_ref.as_deref().unwrap_or("-");
        println!("{:>3}. {} [{}] agent={}", i + 1, task.name, flags.join(", "), agent);

        if !task.dependencies.is_empty() {
            let deps: Vec<String> = task.dependencies.iter().map(name_of).collect();
            println!("       after: {}", deps.join(", "));
        }
        if graph.process == ProcessKind::Workflow && !task.next_tasks.is_empty() {
            let next: Vec<String> = task.next_tasks.iter().map(name_of).collect();
            println!("       then: {}", next.join(", "));
        }
        if let TaskKind::Decision(spec) = &task.kind {
            for (label, targets) in &spec.condition {
                let targets: Vec<String> = targets.iter().map(name_of).collect();
                let target = if targets.is_empty() {
                    "(end)".to_string()
                } else {
                    targets.join(", ")
                };
                println!("       on '{label}': {target}");
            }
        }
    }
}
