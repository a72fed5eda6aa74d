use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Weekday};
use clap::{Args, Parser, Subcommand};
use tasks::config::TrackerConfig;
use tasks::core::{CopyOverrides, RecurrenceRule, TaskChanges, TaskDraft, TaskId};
use tasks::format::{format_agenda, format_outline};
use tasks::legacy::{self, LegacyTask};
use tasks::path::path_of;
use tasks::projectors::outline_projector;
use tasks::recurrence::{Clock, FixedClock, SystemClock};
use tasks::service::{ServiceError, TaskService};
use tasks::storage::{JsonFileTaskStore, RemoteTaskStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tasks", about = "Nested, recurring task tracker", version)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Config file (TOML). Defaults to the platform config directory.
    #[arg(long, global = true, env = "TASKS_CONFIG")]
    config: Option<PathBuf>,
    /// Data file holding the task records.
    #[arg(long, global = true, env = "TASKS_FILE")]
    file: Option<PathBuf>,
    /// Pretend today is this date (YYYY-MM-DD).
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show top-level tasks split into due and future, with their subtasks.
    List(ListArgs),

    /// Show every task in structural order with its path.
    Outline,

    /// Create a task, optionally nested under another.
    Add(AddArgs),

    /// Duplicate a task, optionally with its whole subtree.
    Copy(CopyArgs),

    /// Change a task's fields or move it.
    Edit(EditArgs),

    /// Delete a task and everything beneath it.
    Delete(TargetArgs),

    /// Flip a task's completion, cascading to its subtasks.
    Toggle(TargetArgs),

    /// Print the path of a task id.
    Path(PathArgs),

    /// Report structural problems in the data file.
    Check,

    /// Import records written in the older JSON layout.
    ImportLegacy(ImportArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

/// At most one rule may be given.
#[derive(Debug, Args, Default)]
#[group(multiple = false)]
struct RuleArgs {
    /// Due on this date (YYYY-MM-DD).
    #[arg(long)]
    on: Option<NaiveDate>,
    /// Due on the next of these weekdays, e.g. `mon,fri`.
    #[arg(long, value_delimiter = ',')]
    weekdays: Option<Vec<Weekday>>,
    /// Due this many days from today.
    #[arg(long)]
    after: Option<u32>,
    /// Due on this day of every month.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=31))]
    monthly: Option<u8>,
}

impl RuleArgs {
    fn rule(&self) -> Option<RecurrenceRule> {
        if let Some(date) = self.on {
            return Some(RecurrenceRule::SpecificDate { date });
        }
        if let Some(days) = &self.weekdays {
            return Some(RecurrenceRule::weekdays(days.iter().copied()));
        }
        if let Some(days) = self.after {
            return Some(RecurrenceRule::AfterDays { days });
        }
        self.monthly.map(|day| RecurrenceRule::MonthlyDay { day })
    }
}

#[derive(Debug, Args)]
struct AddArgs {
    name: String,
    #[command(flatten)]
    rule: RuleArgs,
    /// Path of the parent task, e.g. `0-2`.
    #[arg(long)]
    under: Option<String>,
    /// Mark the task as resettable.
    #[arg(long)]
    resettable: bool,
}

#[derive(Debug, Args)]
struct CopyArgs {
    /// Path of the task to copy.
    source: String,
    /// Name for the copy. Defaults to the source's name.
    #[arg(long)]
    name: Option<String>,
    #[command(flatten)]
    rule: RuleArgs,
    /// Path of the parent for the copy.
    #[arg(long)]
    under: Option<String>,
    #[arg(long)]
    resettable: Option<bool>,
    /// Copy every descendant too.
    #[arg(long)]
    with_subtasks: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    /// Path of the task to edit.
    path: String,
    #[arg(long)]
    name: Option<String>,
    #[command(flatten)]
    rule: RuleArgs,
    #[arg(long)]
    resettable: Option<bool>,
    /// New parent path; an empty string moves the task to the top level.
    #[arg(long)]
    move_to: Option<String>,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Path of the task, e.g. `0-1`.
    path: String,
}

#[derive(Debug, Args)]
struct PathArgs {
    id: TaskId,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// JSON array of records in the older layout.
    input: PathBuf,
}

/// The clock the CLI runs on: pinned by `--today` or read from the wall.
enum AppClock {
    Fixed(FixedClock),
    System(SystemClock),
}

impl Clock for AppClock {
    fn today(&self) -> NaiveDate {
        match self {
            AppClock::Fixed(clock) => clock.today(),
            AppClock::System(clock) => clock.today(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = TrackerConfig::discover(cli.config.as_deref()).context("loading configuration")?;
    let data_file = match cli.file {
        Some(path) => path,
        None => config.data_file()?,
    };
    let clock = match cli.today {
        Some(date) => AppClock::Fixed(FixedClock(date)),
        None => AppClock::System(SystemClock::new(config.utc_offset()?)),
    };
    let remote = JsonFileTaskStore::open(&data_file)
        .await
        .with_context(|| format!("opening {}", data_file.display()))?;

    match cli.command {
        Commands::ImportLegacy(args) => handle_import(&remote, &args).await,
        Commands::List(args) => handle_list(&open_service(remote, clock).await?, args),
        Commands::Outline => {
            let service = open_service(remote, clock).await?;
            print!("{}", format_outline(&outline_projector::outline(service.store())));
            Ok(())
        }
        Commands::Add(args) => handle_add(&mut open_service(remote, clock).await?, args).await,
        Commands::Copy(args) => handle_copy(&mut open_service(remote, clock).await?, args).await,
        Commands::Edit(args) => handle_edit(&mut open_service(remote, clock).await?, args).await,
        Commands::Delete(args) => handle_delete(&mut open_service(remote, clock).await?, args).await,
        Commands::Toggle(args) => handle_toggle(&mut open_service(remote, clock).await?, args).await,
        Commands::Path(args) => {
            let service = open_service(remote, clock).await?;
            match path_of(service.store(), args.id) {
                Some(path) => {
                    println!("{path}");
                    Ok(())
                }
                None => bail!("task {} is not reachable from the top level", args.id),
            }
        }
        Commands::Check => handle_check(&open_service(remote, clock).await?),
    }
}

async fn open_service(
    remote: JsonFileTaskStore,
    clock: AppClock,
) -> Result<TaskService<JsonFileTaskStore, AppClock>> {
    TaskService::load(remote, clock)
        .await
        .map_err(surface)
        .context("loading tasks")
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "tasks=debug,warn" } else { "tasks=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Turn a service error into a CLI error, noting when retrying may help.
fn surface(err: ServiceError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow::Error::new(err).context("nothing was changed locally; the command can be retried")
    } else {
        anyhow::Error::new(err)
    }
}

fn handle_list<R: RemoteTaskStore>(service: &TaskService<R, AppClock>, args: ListArgs) -> Result<()> {
    let view = service.agenda();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", format_agenda(&view));
    }
    Ok(())
}

async fn handle_add<R: RemoteTaskStore>(
    service: &mut TaskService<R, AppClock>,
    args: AddArgs,
) -> Result<()> {
    let rule = args.rule.rule().unwrap_or(RecurrenceRule::SpecificDate {
        date: service.today(),
    });
    let draft = TaskDraft::new(args.name, rule).resettable(args.resettable);
    let task = service
        .add(draft, args.under.as_deref())
        .await
        .map_err(surface)?;
    report_placed(service, task.id, &task.name, task.due_date);
    Ok(())
}

async fn handle_copy<R: RemoteTaskStore>(
    service: &mut TaskService<R, AppClock>,
    args: CopyArgs,
) -> Result<()> {
    let overrides = CopyOverrides {
        name: args.name,
        recurrence_rule: args.rule.rule(),
        resettable: args.resettable,
    };
    let task = service
        .copy(&args.source, overrides, args.under.as_deref(), args.with_subtasks)
        .await
        .map_err(surface)?;
    report_placed(service, task.id, &task.name, task.due_date);
    Ok(())
}

async fn handle_edit<R: RemoteTaskStore>(
    service: &mut TaskService<R, AppClock>,
    args: EditArgs,
) -> Result<()> {
    let id = service.resolve_id(&args.path).map_err(surface)?;
    let changes = TaskChanges {
        name: args.name,
        recurrence_rule: args.rule.rule(),
        resettable: args.resettable,
    };
    if changes.is_empty() && args.move_to.is_none() {
        bail!("nothing to change; pass --name, a rule, --resettable or --move-to");
    }
    let edited = service
        .edit(id, changes, args.move_to.as_deref())
        .await
        .map_err(surface)?;
    for rejection in &edited.rejected {
        eprintln!("warning: {rejection}");
    }
    report_placed(service, edited.task.id, &edited.task.name, edited.task.due_date);
    Ok(())
}

async fn handle_delete<R: RemoteTaskStore>(
    service: &mut TaskService<R, AppClock>,
    args: TargetArgs,
) -> Result<()> {
    let id = service.resolve_id(&args.path).map_err(surface)?;
    let removed = service.delete(id).await.map_err(surface)?;
    println!("Deleted {} task(s)", removed.len());
    Ok(())
}

async fn handle_toggle<R: RemoteTaskStore>(
    service: &mut TaskService<R, AppClock>,
    args: TargetArgs,
) -> Result<()> {
    let id = service.resolve_id(&args.path).map_err(surface)?;
    let done = service.toggle(id).await.map_err(surface)?;
    println!("{} is now {}", args.path, if done { "done" } else { "not done" });
    Ok(())
}

fn handle_check<R: RemoteTaskStore>(service: &TaskService<R, AppClock>) -> Result<()> {
    let violations = service.store().check_invariants();
    if violations.is_empty() {
        println!("OK: {} task(s)", service.store().len());
        return Ok(());
    }
    for violation in &violations {
        println!("{violation}");
    }
    bail!("{} structural problem(s) found", violations.len())
}

fn report_placed<R: RemoteTaskStore>(
    service: &TaskService<R, AppClock>,
    id: TaskId,
    name: &str,
    due: NaiveDate,
) {
    match path_of(service.store(), id) {
        Some(path) => println!("{path}  {name} (due {due})"),
        None => println!("{name} (due {due})"),
    }
}

async fn handle_import(remote: &JsonFileTaskStore, args: &ImportArgs) -> Result<()> {
    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let records = parse_legacy(&text)
        .with_context(|| format!("decoding {}", args.input.display()))?;
    let count = remote
        .import(records)
        .await
        .with_context(|| format!("writing {}", remote.path().display()))?;
    println!("Imported {count} task(s) into {}", remote.path().display());
    Ok(())
}

fn parse_legacy(text: &str) -> Result<Vec<tasks::core::Task>> {
    let records: Vec<LegacyTask> = serde_json::from_str(text).context("not a JSON array of records")?;
    Ok(legacy::import(records)?)
}
