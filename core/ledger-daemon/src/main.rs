//! Logon Ledger entrypoint.
//!
//! A single-writer poller: every interval it asks each configured host for
//! its logon sessions, reconciles the answers against SQLite, and adds the
//! minutes of finished sessions to per-user totals.
//!
//! ## Subcommands
//!
//! - `run`: poll until SIGINT/SIGTERM
//! - `once`: a single poll/reconcile cycle
//! - `totals`, `active`, `quarantine`: read-only reports

mod logging;
mod report;

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info, warn};

use ledger_core::{
    install_signal_handlers, load_config, CommandSessionSource, Scheduler, Shutdown, Store,
    TrackerConfig,
};
use report::OutputFormat;

#[derive(Parser)]
#[command(name = "logon-ledger")]
#[command(about = "Tracks per-user logon minutes across a fleet of hosts")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.logon-ledger/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database to read for report commands (defaults to the configured path)
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll all hosts every interval until interrupted
    Run,

    /// Run a single poll/reconcile cycle and exit
    Once,

    /// Print accumulated minutes per user
    Totals {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Print sessions currently recorded as open
    Active {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Print sessions set aside because their stored logon time was unreadable
    Quarantine {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run => with_tracker(cli.config, run_daemon),
        Commands::Once => with_tracker(cli.config, run_once),
        Commands::Totals { format } => with_report_store(cli.config, cli.database, |store| {
            let totals = store.list_user_totals().map_err(String::from)?;
            report::render_totals(&totals, format)
        }),
        Commands::Active { format } => with_report_store(cli.config, cli.database, |store| {
            let records = store.list_active_sessions().map_err(String::from)?;
            report::render_active(&records, format)
        }),
        Commands::Quarantine { format } => with_report_store(cli.config, cli.database, |store| {
            let entries = store.list_quarantined().map_err(String::from)?;
            report::render_quarantined(&entries, format)
        }),
    };

    std::process::exit(code);
}

/// Loads configuration and storage for the polling commands, then runs `op`.
fn with_tracker(
    config_path: Option<PathBuf>,
    op: impl FnOnce(&TrackerConfig, &Store) -> Result<(), String>,
) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            let _guard = logging::init(None, 0);
            error!(error = %err, "Failed to load configuration");
            return 1;
        }
    };

    let log_dir = match config.resolved_log_directory() {
        Ok(dir) => dir,
        Err(err) => {
            let _guard = logging::init(None, 0);
            error!(error = %err, "Failed to resolve log directory");
            return 1;
        }
    };
    let _guard = logging::init(log_dir.as_deref(), config.logging.max_files);

    let db_path = match config.resolved_database_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve database path");
            return 1;
        }
    };

    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize database");
            return 1;
        }
    };
    info!(path = %db_path.display(), hosts = config.hosts.len(), "Ledger database ready");

    match op(&config, &store) {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "Logon ledger failed");
            1
        }
    }
}

fn run_daemon(config: &TrackerConfig, store: &Store) -> Result<(), String> {
    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown).map_err(String::from)?;

    let source = CommandSessionSource::new(config);
    Scheduler::new(config, source, store).run(&shutdown);

    info!("Logon ledger stopped");
    Ok(())
}

fn run_once(config: &TrackerConfig, store: &Store) -> Result<(), String> {
    let source = CommandSessionSource::new(config);
    let summary = Scheduler::new(config, source, store).run_cycle();

    if !summary.failed_hosts.is_empty() {
        warn!(hosts = ?summary.failed_hosts, "Some hosts were not polled this cycle");
    }

    match summary.report {
        Some(report) => {
            info!(
                opened = report.opened.len(),
                closed = report.closed.len(),
                quarantined = report.quarantined.len(),
                minutes_added = report.minutes_added(),
                "Cycle complete"
            );
            Ok(())
        }
        None => Err("reconciliation did not commit".to_string()),
    }
}

/// Opens the store read-side for report commands and prints `render`'s output.
fn with_report_store(
    config_path: Option<PathBuf>,
    database: Option<PathBuf>,
    render: impl FnOnce(&Store) -> Result<String, String>,
) -> i32 {
    let _guard = logging::init(None, 0);

    let db_path = match database {
        Some(path) => path,
        None => match load_config(config_path).and_then(|config| config.resolved_database_path())
        {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "Failed to resolve database path; pass --database");
                return 1;
            }
        },
    };

    if !db_path.exists() {
        error!(path = %db_path.display(), "Database does not exist");
        return 1;
    }

    let output = Store::open(&db_path)
        .map_err(String::from)
        .and_then(|store| render(&store));

    match output {
        Ok(text) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush()) {
                error!(error = %err, "Failed to write report");
                return 1;
            }
            0
        }
        Err(err) => {
            error!(error = %err, "Failed to read ledger");
            1
        }
    }
}
