use anyhow::Result;
use clap::{Parser, Subcommand};
use ltp_runner::{
    load_batch, BatchOptions, BatchSummary, ClusterConfig, ClusterScheduler, JobLifecycle,
    Scoreboard,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ltp-cluster",
    version = "0.3.0",
    about = "Run LTP against many kernels in disposable VMs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of a batch file.
    Run {
        #[arg(short = 'f', long)]
        filename: PathBuf,
        /// Number of jobs run in parallel.
        #[arg(short = 'n', long)]
        nproc: Option<usize>,
        /// Continue: skip jobs that already succeeded.
        #[arg(short = 'c', long = "cont")]
        cont: bool,
        /// LTP repository to build.
        #[arg(short = 'r', long)]
        repo: Option<String>,
        #[arg(short = 'b', long)]
        branch: Option<String>,
        #[arg(short = 's', long, num_args = 1..)]
        suites: Option<Vec<String>>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        work_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize the scoreboard of a work directory.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        work_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

struct Overrides {
    nproc: Option<usize>,
    repo: Option<String>,
    branch: Option<String>,
    suites: Option<Vec<String>>,
    work_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            filename,
            nproc,
            cont,
            repo,
            branch,
            suites,
            config,
            work_dir,
            json,
        } => {
            let config = load_config(
                config.as_deref(),
                Overrides {
                    nproc,
                    repo,
                    branch,
                    suites,
                    work_dir,
                },
            )?;
            let specs = load_batch(&filename)?;
            info!(jobs = specs.len(), batch = %filename.display(), "batch loaded");
            let lifecycle = JobLifecycle::from_config(&config)?;
            let options = BatchOptions::from_config(&config, cont);
            let summary = ClusterScheduler::new(Arc::new(lifecycle)).run_batch(specs, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": batch_summary_to_json(&summary),
                })));
            }
            print_batch_summary(&summary);
        }
        Commands::Status {
            config,
            work_dir,
            json,
        } => {
            let config = load_config(
                config.as_deref(),
                Overrides {
                    nproc: None,
                    repo: None,
                    branch: None,
                    suites: None,
                    work_dir,
                },
            )?;
            let board = Scoreboard::open(&config.scoreboard_path())?;
            let summary = board.summary();
            if json {
                let jobs: Vec<Value> = board
                    .entries()
                    .into_iter()
                    .map(|(id, entry)| {
                        json!({
                            "bug_id": id.bug_id,
                            "tag": id.tag,
                            "status": entry.status,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "scoreboard": board.path().display().to_string(),
                    "summary": summary,
                    "jobs": jobs,
                })));
            }
            println!("scoreboard: {}", board.path().display());
            println!("jobs: {}", summary.jobs);
            println!("succeeded: {}", summary.succeeded);
            println!("failed: {}", summary.failed);
            for (id, entry) in board.entries() {
                println!("{} {}: {:?}", id.bug_id, id.tag, entry.status);
            }
        }
    }
    Ok(None)
}

fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::load(path)?;
    if let Some(n) = overrides.nproc {
        config.max_parallel = n;
    }
    if let Some(repo) = overrides.repo {
        config.ltp.repo = repo;
    }
    if let Some(branch) = overrides.branch {
        config.ltp.branch = branch;
    }
    if let Some(suites) = overrides.suites {
        config.suites = suites;
    }
    if let Some(dir) = overrides.work_dir {
        config.work_root = dir;
    }
    config.validate()?;
    Ok(config)
}

fn batch_summary_to_json(summary: &BatchSummary) -> Value {
    json!({
        "submitted": summary.submitted,
        "queued": summary.queued,
        "skipped": summary.skipped,
        "duplicates": summary.duplicates,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
        "unrecorded": summary.unrecorded,
        "scoreboard": summary.scoreboard.display().to_string(),
    })
}

fn print_batch_summary(summary: &BatchSummary) {
    println!("queued: {}", summary.queued);
    println!("skipped: {}", summary.skipped);
    if summary.duplicates > 0 {
        println!("duplicates: {}", summary.duplicates);
    }
    println!("succeeded: {}", summary.succeeded);
    println!("failed: {}", summary.failed);
    if summary.unrecorded > 0 {
        println!("unrecorded: {}", summary.unrecorded);
    }
    println!("scoreboard: {}", summary.scoreboard.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Status { json, .. } => *json,
    }
}
