use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gauntlet::config::Config;
use gauntlet::core::{Task, TaskKind, TaskSubmission};
use gauntlet::evaluation::Outline;
use gauntlet::orchestration::{detect, infer_capability, AgentRegistry, CommandWorker};
use gauntlet::persistence::{ApprovalChannel, AutoApprove, ConsoleApproval, Store};
use gauntlet::{Orchestrator, Result, RunEvent, RunOutcome};

/// Gauntlet - competitive multi-worker task orchestration
#[derive(Parser, Debug)]
#[command(name = "gauntlet")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    GAUNTLET_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.gauntlet/gauntlet.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.gauntlet/gauntlet.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a task through the workers and place the winning artifact
    Run {
        /// The task description in natural language
        description: String,

        /// design, elaboration or implementation
        #[arg(short, long, default_value = "design")]
        kind: String,

        /// Target language (detected from --project when absent)
        #[arg(short, long)]
        lang: Option<String>,

        /// Project directory used for language detection
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Storage key for the placed artifact
        #[arg(long)]
        key: Option<String>,

        /// Required outline: a file of section titles, or a parent document
        /// when combined with --section
        #[arg(long)]
        outline_file: Option<PathBuf>,

        /// Section of --outline-file whose subsections form the outline
        #[arg(long, requires = "outline_file")]
        section: Option<String>,

        /// Try this worker before any resolved one
        #[arg(short, long)]
        worker: Option<String>,

        /// Approve the selected candidate without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// List archived runs, newest first
    Archive {
        /// Only runs of this kind
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Show registered workers and storage usage
    Workers,

    /// Detect the primary language of a project
    Detect {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    gauntlet::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            description,
            kind,
            lang,
            project,
            key,
            outline_file,
            section,
            worker,
            yes,
        } => {
            let mut submission = TaskSubmission::new(description, kind.parse()?);
            submission.capability_hint = lang;
            submission.key = key;
            submission.worker_override = worker;
            if let Some(path) = outline_file {
                let text = std::fs::read_to_string(&path)?;
                submission.structural_constraint = Some(match section {
                    Some(section) => Outline::from_parent_section(&text, &section)?,
                    None => Outline::parse(&text)?,
                });
            }
            run_task(config, submission, project, yes)
        }
        Command::Archive { kind } => run_archive(config, kind),
        Command::Workers => run_workers(config),
        Command::Detect { path } => run_detect(path),
    }
}

fn run_task(config: Config, submission: TaskSubmission, project: PathBuf, yes: bool) -> Result<()> {
    let approval: Arc<dyn ApprovalChannel> = if yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(ConsoleApproval)
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let capability =
            infer_capability(submission.capability_hint.as_deref(), &project).await?;
        let task = Task::from_submission(submission, capability)?;

        let (tx, mut rx) = mpsc::channel(64);
        let orchestrator = Orchestrator::from_config(config, approval)?.with_events(tx);

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling run");
                on_signal.cancel();
            }
        });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        println!(
            "Running {} task {} ({})",
            task.kind,
            task.key,
            task.capability
                .map(|l| l.to_string())
                .unwrap_or_else(|| "no language".to_string())
        );
        println!();

        let mut outcome = orchestrator.run(task, cancel.clone()).await?;
        loop {
            match outcome {
                RunOutcome::Placed(placed) => {
                    println!();
                    println!("  Placed:      {}", placed.path.display());
                    println!("  Candidate:   {} from {}", placed.candidate, placed.worker);
                    println!("  Score:       {:.2}", placed.score);
                    println!("  Archived:    {}", placed.archived);
                    println!("  Batches:     {}", placed.attempts.len());
                    if let Some(e) = &placed.cleanup_error {
                        println!("  Warning:     cleanup failed, scratch kept ({e})");
                    }
                    return Ok(());
                }
                RunOutcome::PlacementFailed { pending, error } => {
                    println!();
                    println!("Placement failed: {error}");
                    if cancel.is_cancelled() || !confirm("Retry placement?")? {
                        return Err(gauntlet::Error::PlacementFailure(error));
                    }
                    outcome = orchestrator.retry_placement(*pending).await?;
                }
                RunOutcome::Failed(report) => {
                    println!();
                    print!("{}", report.summary());
                    return RunOutcome::Failed(report).into_result().map(|_| ());
                }
            }
        }
    })
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::State { from, to, .. } => debug!(from = %from, to = %to, "state"),
        RunEvent::BatchFinished {
            worker,
            batch,
            succeeded,
            fanout,
            ..
        } => println!("  batch {batch}: {worker} {succeeded}/{fanout} succeeded"),
        RunEvent::Escalated { from, to, .. } => println!("  escalating {from} -> {to}"),
        RunEvent::Selected {
            candidate,
            worker,
            total,
            ..
        } => println!("  selected {candidate} from {worker} ({total:.2})"),
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn run_archive(config: Config, kind: Option<String>) -> Result<()> {
    let kind = kind.map(|k| k.parse::<TaskKind>()).transpose()?;
    let store = Store::new(config.storage_root());
    let runs = store.history(kind)?;

    if runs.is_empty() {
        println!("No archived runs in {}", store.archive_dir().display());
        return Ok(());
    }

    println!("{:<26} {:<15} {:<30} {:>8}  PLACED", "RUN", "KIND", "KEY", "RECORDS");
    for run in runs {
        println!(
            "{:<26} {:<15} {:<30} {:>8}  {}",
            run.run,
            run.kind,
            run.key,
            run.record_count,
            run.placed
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn run_workers(config: Config) -> Result<()> {
    let registry = AgentRegistry::from_config(&config)?;
    let stats = registry.stats();

    println!("Workers: {} ({} generic)", stats.total, stats.generic);
    for worker in &config.workers {
        let command = CommandWorker::from_command_line(&worker.name, &worker.command)?;
        println!(
            "  {:<24} {:<10} {:<12} {}",
            worker.name,
            worker.role,
            worker.language.as_deref().unwrap_or("generic"),
            if command.is_available() { "ok" } else { "missing" }
        );
    }
    let host = CommandWorker::from_command_line("host", &config.host.command)?;
    println!(
        "  {:<24} {:<10} {:<12} {}",
        "host",
        "host",
        "-",
        if host.is_available() { "ok" } else { "missing" }
    );

    let usage = Store::new(config.storage_root()).storage_stats()?;
    println!();
    println!("Storage: {}", usage.root.display());
    println!("  artifacts:    {}", usage.artifacts);
    println!("  archive runs: {}", usage.archive_runs);
    println!(
        "  bytes:        {} (scratch {}, plan {}, archive {})",
        usage.total_bytes, usage.scratch_bytes, usage.plan_bytes, usage.archive_bytes
    );
    Ok(())
}

fn run_detect(path: PathBuf) -> Result<()> {
    let report = detect(&path);
    match report.language {
        Some(lang) => println!("{lang} (confidence {:.2})", report.confidence),
        None => match report.best_guess {
            Some(guess) => println!(
                "undetermined; best guess {guess} (confidence {:.2})",
                report.confidence
            ),
            None => println!("undetermined"),
        },
    }
    for e in &report.evidence {
        println!("  {:<10} {:.2}  {}", e.language, e.confidence, e.detail);
    }
    Ok(())
}
