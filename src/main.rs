use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use conductor::agent::AgentCommand;
use conductor::config::Config;
use conductor::core::{kinds, EnvelopeConfig, SessionId, TaskId, TaskStatus, TransparencyEvent};
use conductor::orchestration::{
    AgentPlanner, AgentSessionManager, ApprovalGate, ApprovalPolicy, ExecutionScheduler,
    PlanFile, PlanSource, ProcessLauncher, Recorder, RepoContext, RunReport, SchedulerConfig,
    SchedulerHandle, TaskDecomposer,
};
use conductor::store::CoordinationStore;
use conductor::workspace::WorkspaceManager;
use conductor::{util, Result};

const FEED_BUFFER: usize = 256;

/// Conductor - parallel coding agent orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a goal into tasks and run them with parallel agents
    Run {
        /// What to build, in natural language
        goal: String,

        /// Read the task plan from a JSON file instead of asking the planner
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Repository to work on (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Maximum number of agents running at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retries per task after a failed attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Require approval for tasks of this agent role (repeatable)
        #[arg(long = "approve-role")]
        approve_roles: Vec<String>,

        /// Require approval for tasks carrying this tag (repeatable)
        #[arg(long = "approve-tag")]
        approve_tags: Vec<String>,

        /// Skip the approval gate entirely
        #[arg(long)]
        auto_approve: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recent transparency events
    Events {
        /// Only events for this session
        #[arg(long)]
        session: Option<String>,

        /// Maximum number of events (capped by the configured page limit)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show task and queue health
    Status {
        /// Include one line per task
        #[arg(long)]
        detail: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write it to ~/.conductor/conductor.toml
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    if conductor::log::is_debug() {
        eprintln!(
            "Debug logging to {}",
            Config::conductor_dir()?.join("conductor.log").display()
        );
    }

    match cli.command {
        Command::Run {
            goal,
            plan,
            repo,
            jobs,
            timeout,
            max_retries,
            approve_roles,
            approve_tags,
            auto_approve,
            json,
        } => {
            let mut config = Config::load()?;
            if let Some(jobs) = jobs {
                config.max_parallel_agents = jobs;
            }
            if let Some(timeout) = timeout {
                config.task_timeout_secs = timeout;
            }
            if let Some(max_retries) = max_retries {
                config.max_retries = max_retries;
            }
            config.approval.roles.extend(approve_roles);
            config.approval.tags.extend(approve_tags);
            config.validate()?;
            config.ensure_dirs()?;

            let repo = match repo {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let report = run_goal(config, goal, plan, repo, auto_approve)?;
            print_report(&report, json)?;
            if !report.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Events { session, limit } => run_events(session, limit),
        Command::Status { detail } => run_status(detail),
        Command::Config { write } => run_config(write),
    }
}

fn open_store(config: &Config) -> Result<Arc<CoordinationStore>> {
    let store = CoordinationStore::open(&config.database_path()?)?
        .with_page_limit(config.event_page_limit);
    Ok(Arc::new(store))
}

fn run_goal(
    config: Config,
    goal: String,
    plan: Option<PathBuf>,
    repo: PathBuf,
    auto_approve: bool,
) -> Result<RunReport> {
    info!(goal = %goal, repo = %repo.display(), "run command");
    let store = open_store(&config)?;
    let (feed_tx, feed_rx) = mpsc::channel(FEED_BUFFER);
    let recorder = Recorder::new(Arc::clone(&store)).with_feed(feed_tx);

    let source: Arc<dyn PlanSource> = match plan {
        Some(path) => Arc::new(PlanFile::new(path)),
        None => Arc::new(
            AgentPlanner::new(AgentCommand::planner_from_config(&config)?)
                .with_timeout(config.task_timeout()),
        ),
    };
    let policy = if auto_approve {
        ApprovalPolicy::default()
    } else {
        ApprovalPolicy::from_config(&config.approval)?
    };

    let workspaces = Arc::new(
        WorkspaceManager::new(
            &repo,
            config.worktrees_dir()?,
            config.integration_branch.clone(),
        )?
        .preserve_failed(config.preserve_failed_workspaces),
    );
    let launcher = Arc::new(ProcessLauncher::new(AgentCommand::from_config(&config)?));
    let sessions = Arc::new(
        AgentSessionManager::new(launcher, workspaces, recorder.clone())
            .with_grace(config.termination_grace())
            .with_envelope_config(EnvelopeConfig {
                timeout_seconds: Some(config.task_timeout_secs),
                max_retries: Some(config.max_retries),
                ..EnvelopeConfig::default()
            }),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let existing = store.load_tasks()?;
        let context = RepoContext::detect(&repo).with_existing(existing);
        // Progress goes to stderr; stdout carries only the report.
        eprintln!("Planning: {}", goal);
        let tasks = TaskDecomposer::new(source).decompose(&goal, &context).await?;
        eprintln!("  {} tasks", tasks.len());
        for task in &tasks {
            eprintln!("  - {} [{}] {}", task.id, task.agent_role, task.description);
        }
        eprintln!();

        let gate = ApprovalGate::new(policy, recorder.clone());
        let scheduler_config = SchedulerConfig::from(&config);
        let scheduler = if context.existing.is_empty() {
            ExecutionScheduler::from_plan(tasks, sessions, gate, recorder, scheduler_config)?
        } else {
            // New tasks may depend on stored ones; run the combined graph.
            recorder.persist_graph(&tasks)?;
            ExecutionScheduler::resume(sessions, gate, recorder, scheduler_config).await?
        };

        let handle = scheduler.handle();
        tokio::spawn(watch_feed(feed_rx, Arc::clone(&store), handle.clone()));
        let interrupt = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling run...");
                interrupt.cancel();
            }
        });

        scheduler.run().await
    })
}

/// Print progress from the live feed and ask the operator about gated tasks.
/// Gaps in the feed are backfilled from the store so no approval request is
/// missed while a prompt is open.
async fn watch_feed(
    mut feed: mpsc::Receiver<TransparencyEvent>,
    store: Arc<CoordinationStore>,
    handle: SchedulerHandle,
) {
    let mut last_id = 0;
    while let Some(event) = feed.recv().await {
        let mut batch = Vec::new();
        if last_id > 0 && event.id > last_id + 1 {
            match store.events_after(last_id, store.page_limit()) {
                Ok(missed) => batch.extend(missed.into_iter().filter(|e| e.id < event.id)),
                Err(e) => warn!(error = %e, "could not backfill live feed"),
            }
        }
        batch.push(event);

        for event in batch {
            if event.id <= last_id {
                continue;
            }
            last_id = event.id;
            show_event(&event, &handle).await;
        }
    }
}

async fn show_event(event: &TransparencyEvent, handle: &SchedulerHandle) {
    if let Some(status) = event.recorded_task_status() {
        if let Some(task_id) = &event.task_id {
            print_status(task_id.as_str(), status, event.error.as_deref());
        }
        return;
    }
    if event.event_type != kinds::APPROVAL_REQUESTED {
        return;
    }
    let Some(task_id) = &event.task_id else {
        return;
    };
    eprintln!("\n{}", event.message);
    let approved = match prompt_yes_no(&format!("Approve task {}? [y/N] ", task_id)).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(error = %e, "could not read approval answer, rejecting");
            false
        }
    };
    if let Err(e) = handle.decide(task_id, approved).await {
        warn!(task_id = %task_id, error = %e, "approval decision not applied");
    }
}

async fn prompt_yes_no(question: &str) -> Result<bool> {
    let question = question.to_string();
    util::blocking(move || {
        eprint!("{}", question);
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    })
    .await
}

fn print_status(task_id: &str, status: TaskStatus, error: Option<&str>) {
    match (status, error) {
        (TaskStatus::Failed, Some(error)) | (TaskStatus::Pending, Some(error)) => {
            eprintln!("  {:<10} {} ({})", status.as_str(), task_id, error)
        }
        _ => eprintln!("  {:<10} {}", status.as_str(), task_id),
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!();
    println!(
        "Run {}",
        if report.cancelled { "cancelled" } else { "finished" }
    );
    println!("  Completed:   {}", list(&report.completed));
    println!("  Failed:      {}", list(&report.failed));
    println!("  Blocked:     {}", list(&report.blocked));
    if !report.unfinished.is_empty() {
        println!("  Unfinished:  {}", list(&report.unfinished));
    }
    println!("  Peak agents: {}", report.max_observed_running);
    Ok(())
}

fn list(ids: &[TaskId]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
    }
}

fn run_events(session: Option<String>, limit: Option<usize>) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config)?;
    let session = session.map(SessionId);
    let events = store.recent_events(session.as_ref(), limit.unwrap_or(store.page_limit()))?;
    if events.is_empty() {
        println!("No events");
        return Ok(());
    }
    for event in events {
        let mut line = format!(
            "#{:<6} {} {:<5} {:<15} {:<20}",
            event.id,
            event.event_time.format("%Y-%m-%d %H:%M:%S"),
            event.level.as_str(),
            event.source.as_str(),
            event.event_type,
        );
        if let Some(task_id) = &event.task_id {
            line.push_str(&format!(" task={}", task_id));
        }
        if let Some(session_id) = &event.session_id {
            line.push_str(&format!(" session={}", session_id.short()));
        }
        line.push_str(&format!(" {}", event.message));
        if let Some(error) = &event.error {
            line.push_str(&format!(" error={}", error));
        }
        println!("{}", line);
    }
    Ok(())
}

fn run_status(detail: bool) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config)?;
    let health = store.queue_health(detail)?;
    if health.total == 0 {
        println!("No tasks recorded yet. Start one with `conductor run <goal>`.");
        return Ok(());
    }

    println!("Tasks: {}", health.total);
    for status in TaskStatus::ALL {
        let count = health.count(status);
        if count > 0 {
            println!("  {:<10} {}", status.as_str(), count);
        }
    }
    println!("Active sessions: {}", health.active_sessions);

    if let Some(tasks) = health.tasks {
        println!();
        for task in tasks {
            let mut line = format!(
                "  {:<24} {:<10} {:<14} p{} attempts={}",
                task.id.as_str(),
                task.status.as_str(),
                task.agent_role.as_str(),
                task.priority,
                task.attempts
            );
            if let Some(error) = &task.error {
                line.push_str(&format!(" error={}", error));
            }
            println!("{}", line);
        }
    }
    Ok(())
}

fn run_config(write: bool) -> Result<()> {
    let config = Config::load()?;
    if write {
        config.save()?;
        println!("Wrote {}", Config::config_path()?.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
