use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{ArgAction, Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use potsync_tasks::config::{AppConfig, CliConfig, FileConfig, DEFAULT_POOL_NAME};
use potsync_tasks::metrics;
use potsync_tasks::tasks::{background, TaskError, WorkerPool, DEFAULT_CAPACITY};
use potsync_tasks::{SqliteStore, SyncHistoryStore, UserStore};

/// Exit status used after an interrupt, 128 + SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[command(name = "potsync-tasks", version, about = "Background sync tasks and schema tool")]
struct CliArgs {
    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[clap(long = "db", value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Number of background worker threads.
    #[clap(long = "workers", default_value_t = DEFAULT_CAPACITY)]
    pub task_workers: usize,

    /// Name of the worker pool, used in thread names and metric labels.
    #[clap(long, default_value = DEFAULT_POOL_NAME)]
    pub pool_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upgrades the database to the latest version, or moves it to the
    /// given version.
    Migrate {
        #[clap(long)]
        to_version: Option<usize>,
    },

    /// Prints the database schema version.
    Version,

    /// Creates a user.
    AddUser { username: String, email: String },

    /// Activates or deactivates a user.
    SetActive {
        username: String,
        #[clap(action = ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        active: bool,
    },

    /// Reads one JSON document per line from stdin and records each one as
    /// a sync history entry from a background task.
    Record {
        #[clap(long, default_value = "completed")]
        status: String,

        /// Print the Prometheus metrics once every entry has been handled.
        #[clap(long)]
        metrics: bool,
    },

    /// Shows the most recent sync history entries.
    History {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },

    /// Deletes sync history older than the configured retention.
    Prune,

    /// Prints the metric registry of a fresh process, useful to check the
    /// exported names. Use `record --metrics` for the counters of a real run.
    Metrics,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            task_workers: self.task_workers,
            pool_name: self.pool_name.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    metrics::init_metrics();

    let pool = Arc::new(
        WorkerPool::new(config.pool_name.clone(), config.task_workers)
            .context("Failed to create worker pool")?,
    );

    let interrupted_pool = Arc::clone(&pool);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, draining background tasks");
        interrupted_pool.shutdown();
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .context("Failed to install Ctrl+C handler")?;

    let result = run_command(cli_args.command, &config, &pool);

    pool.shutdown();
    result
}

fn run_command(command: Command, config: &AppConfig, pool: &Arc<WorkerPool>) -> Result<()> {
    match command {
        Command::Migrate { to_version } => {
            let store = SqliteStore::open_unmigrated(&config.db_path)?;
            let from = store.current_version()?;
            match to_version {
                Some(target) => store.migrate_to(target)?,
                None => {
                    drop(store);
                    SqliteStore::new(&config.db_path)?;
                }
            }
            let store = SqliteStore::open_unmigrated(&config.db_path)?;
            println!(
                "Database at version {} (was {})",
                store.current_version()?,
                from
            );
        }
        Command::Version => {
            let store = SqliteStore::open_unmigrated(&config.db_path)?;
            println!("{}", store.current_version()?);
        }
        Command::AddUser { username, email } => {
            let store = SqliteStore::new(&config.db_path)?;
            let id = store.add_user(&username, &email)?;
            println!("Created user {} with id {}", username, id);
        }
        Command::SetActive { username, active } => {
            let store = SqliteStore::new(&config.db_path)?;
            let user = store
                .get_user_by_username(&username)?
                .with_context(|| format!("User {} not found", username))?;
            store.set_user_active(user.id, active)?;
            println!("User {} active = {}", username, active);
        }
        Command::Record {
            status,
            metrics: print_metrics,
        } => {
            let store = Arc::new(SqliteStore::new(&config.db_path)?);
            let result = record_from_stdin(store, pool, status);
            if print_metrics {
                print!("{}", metrics::render_metrics()?);
            }
            result?;
        }
        Command::History { limit } => {
            let store = SqliteStore::new(&config.db_path)?;
            for entry in store.get_recent_syncs(limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Prune => {
            let store = SqliteStore::new(&config.db_path)?;
            let retention = i64::try_from(config.history_retention_days)
                .ok()
                .and_then(Duration::try_days)
                .context("history_retention_days is too large")?;
            let cutoff = Utc::now() - retention;
            let deleted = store.prune_syncs_older_than(cutoff)?;
            info!("Pruned {} sync history entries older than {}", deleted, cutoff);
            println!("Deleted {} entries", deleted);
        }
        Command::Metrics => {
            print!("{}", metrics::render_metrics()?);
        }
    }
    Ok(())
}

fn record_from_stdin(store: Arc<SqliteStore>, pool: &Arc<WorkerPool>, status: String) -> Result<()> {
    let record = background(Arc::clone(pool), move |(status, data): (String, serde_json::Value)| {
        store.record_sync(&status, Some(&data))
    });

    let mut handles = Vec::new();
    let mut skipped = 0usize;
    for (line_number, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let data: serde_json::Value = match serde_json::from_str(&line) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping line {}: {}", line_number + 1, e);
                skipped += 1;
                continue;
            }
        };
        handles.push(record((status.clone(), data))?);
    }

    // Everything is queued, wait for the backlog to drain
    pool.shutdown();

    let mut recorded = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        let task_id = handle.id();
        match handle.wait() {
            Ok(Ok(_)) => recorded += 1,
            Ok(Err(e)) => {
                warn!("Task {} could not record sync: {:#}", task_id, e);
                failed += 1;
            }
            Err(TaskError::Panicked(msg)) => {
                warn!("Task {} panicked: {}", task_id, msg);
                failed += 1;
            }
            Err(TaskError::Abandoned) => failed += 1,
        }
    }

    println!(
        "Recorded {} entries, {} failed, {} skipped",
        recorded, failed, skipped
    );
    if failed > 0 {
        bail!("{} entries could not be recorded", failed);
    }
    Ok(())
}
