use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ucm_core::DEFAULT_BATCH_SIZE;
use ucm_engine::migrate::{MigrationConfig, MigrationEngine};
use ucm_engine::report::{self, ReportFormat};
use ucm_engine::rollback::{RollbackConfig, RollbackEngine};
use ucm_engine::{validator, RunStats};
use ucm_store::{LedgerStore, TargetSelector};

#[derive(Parser)]
#[command(name = "ucm")]
#[command(about = "Unified credit migration operator console", long_about = None)]
struct Cli {
    /// Ledger database path
    #[arg(long, global = true, default_value = "ucm.db")]
    db: PathBuf,
    /// Minimum level written to console and audit log
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Directory for the JSON-lines audit log
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert legacy mana balances into unified credits
    Migrate {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Target exactly one account
        #[arg(long)]
        user_id: Option<String>,
        /// Target accounts migrated on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
        /// Repair integrity issues before migrating
        #[arg(long)]
        auto_fix: bool,
        /// Run the validator and exit without migrating
        #[arg(long)]
        validate_only: bool,
    },
    /// Reverse migrations for eligible accounts
    Rollback {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long)]
        user_id: Option<String>,
        /// Target every currently migrated account
        #[arg(long)]
        all: bool,
        #[arg(long)]
        since: Option<String>,
        /// Bypass the spend-eligibility check and skip throttling
        #[arg(long)]
        emergency: bool,
        /// Keep the original migration record untouched
        #[arg(long)]
        preserve_logs: bool,
    },
    /// Scan accounts for integrity issues
    Validate {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        auto_fix: bool,
    },
    /// Export an aggregate report snapshot
    Report {
        #[arg(long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Poll the ledger and report deltas between snapshots
    Monitor {
        /// Refresh interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut store = LedgerStore::open(&cli.db)
        .with_context(|| format!("failed to open ledger database at {:?}", cli.db))?;
    tracing::info!(event = "cli_start", db = %cli.db.display());

    match cli.command {
        Commands::Migrate {
            dry_run,
            batch_size,
            user_id,
            since,
            auto_fix,
            validate_only,
        } => {
            if validate_only {
                return run_validate(&mut store, user_id.as_deref(), auto_fix);
            }
            run_migrate(&mut store, dry_run, batch_size, user_id, since, auto_fix)
        }
        Commands::Rollback {
            dry_run,
            batch_size,
            user_id,
            all,
            since,
            emergency,
            preserve_logs,
        } => run_rollback(
            &mut store,
            dry_run,
            batch_size,
            user_id,
            all,
            since,
            emergency,
            preserve_logs,
        ),
        Commands::Validate { user_id, auto_fix } => {
            run_validate(&mut store, user_id.as_deref(), auto_fix)
        }
        Commands::Report { format, output } => run_report(&store, &format, output),
        Commands::Monitor { interval } => run_monitor(&store, interval),
    }
}

fn run_migrate(
    store: &mut LedgerStore,
    dry_run: bool,
    batch_size: usize,
    user_id: Option<String>,
    since: Option<String>,
    auto_fix: bool,
) -> Result<()> {
    let target = match (user_id, since) {
        (Some(id), _) => TargetSelector::Ids(vec![id]),
        (None, Some(date)) => TargetSelector::MigratedSince(parse_since(&date)?),
        (None, None) => TargetSelector::NotMigrated,
    };

    let engine = MigrationEngine::new(MigrationConfig {
        dry_run,
        batch_size,
        target,
        auto_fix,
        ..MigrationConfig::default()
    });

    let mut stats = RunStats::default();
    let result = engine.run(store, &mut stats);
    print_run_summary("Migration", &stats, dry_run);
    result.map_err(Into::into)
}

#[allow(clippy::too_many_arguments)]
fn run_rollback(
    store: &mut LedgerStore,
    dry_run: bool,
    batch_size: usize,
    user_id: Option<String>,
    all: bool,
    since: Option<String>,
    emergency: bool,
    preserve_logs: bool,
) -> Result<()> {
    let target = match (user_id, all, since) {
        (Some(id), _, _) => TargetSelector::Ids(vec![id]),
        (None, true, _) => TargetSelector::Migrated,
        (None, false, Some(date)) => TargetSelector::MigratedSince(parse_since(&date)?),
        (None, false, None) => {
            bail!("rollback requires --user-id, --all, or --since to select its targets")
        }
    };

    let engine = RollbackEngine::new(RollbackConfig {
        dry_run,
        batch_size,
        target,
        emergency,
        preserve_logs,
        ..RollbackConfig::default()
    });

    let mut stats = RunStats::default();
    let result = engine.run(store, &mut stats);
    print_run_summary("Rollback", &stats, dry_run);

    let validation = result?;
    println!(
        "Post-rollback: {} still migrated, {} orphaned balances, {} rollback records written",
        validation.still_migrated,
        validation.orphaned_balances,
        validation.rollback_records_written,
    );
    Ok(())
}

fn run_validate(store: &mut LedgerStore, user_id: Option<&str>, auto_fix: bool) -> Result<()> {
    let report = validator::validate(store, user_id)?;
    println!(
        "Scanned {} accounts: {} errors, {} warnings",
        report.accounts_scanned,
        report.error_count(),
        report.warning_count(),
    );
    for entry in &report.issues {
        println!("  [{}] {}: {}", entry.kind, entry.account_id, entry.detail);
    }

    if report.is_valid() {
        return Ok(());
    }
    if !auto_fix {
        bail!(
            "validation found {} integrity errors (re-run with --auto-fix to repair)",
            report.error_count()
        );
    }

    let summary = validator::auto_fix(store, &report)?;
    println!(
        "Repaired {} issues across {} accounts",
        summary.issues_fixed, summary.accounts_fixed,
    );

    let recheck = validator::validate(store, user_id)?;
    if !recheck.is_valid() {
        bail!(
            "{} integrity errors remain after auto-fix",
            recheck.error_count()
        );
    }
    println!("Re-validation passed");
    Ok(())
}

fn run_report(store: &LedgerStore, format: &str, output: Option<PathBuf>) -> Result<()> {
    let format: ReportFormat = format
        .parse()
        .map_err(|message: String| anyhow::anyhow!(message))?;
    let snapshot = report::snapshot(store)?;
    let rendered = report::render(&snapshot, format)?;

    match output {
        Some(path) => {
            fs::write(&path, rendered)
                .with_context(|| format!("failed to write report to {path:?}"))?;
            println!("Report written to {path:?}");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn run_monitor(store: &LedgerStore, interval: u64) -> Result<()> {
    let interval = Duration::from_secs(interval.max(1));
    let mut previous = report::snapshot(store)?;
    println!(
        "Monitoring ledger: {} migrated / {} pending, {} unified credits (refresh {}s)",
        previous.totals.migrated_accounts,
        previous.totals.pending_accounts,
        previous.totals.unified_total,
        interval.as_secs(),
    );

    loop {
        thread::sleep(interval);
        let next = report::snapshot(store)?;
        let delta = report::delta(&previous, &next);
        if delta.is_quiet() {
            continue;
        }
        println!(
            "[{}] migrated {:+}, pending {:+}, unified {:+}, records {:+} migration / {:+} rollback",
            next.generated_at.format("%H:%M:%S"),
            delta.migrated_accounts,
            delta.pending_accounts,
            delta.unified_total,
            delta.new_migration_records,
            delta.new_rollback_records,
        );
        previous = next;
    }
}

fn print_run_summary(label: &str, stats: &RunStats, dry_run: bool) {
    let mode = if dry_run { " (dry run)" } else { "" };
    println!("{label} summary{mode}:");
    println!("  targeted:        {}", stats.total_accounts);
    println!("  successful:      {}", stats.successful);
    println!("  skipped:         {}", stats.skipped);
    println!("  failed:          {}", stats.failed);
    println!("  rolled back:     {}", stats.rolled_back);
    println!("  total converted: {}", stats.total_converted);
    for error in &stats.errors {
        println!("  error: {}: {}", error.account_id, error.message);
    }
}

fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid --since date: {value} (expected YYYY-MM-DD)"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid midnight timestamp")?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn init_logging(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("UCM_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = tracing_subscriber::fmt::layer().with_target(false);

    match open_audit_file(&cli.log_dir) {
        Some(file) => {
            let audit = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || AuditWriter { file: file.clone() });
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(audit)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
        }
    }
}

struct AuditWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for AuditWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_audit_file(log_dir: &Path) -> Option<Arc<Mutex<std::fs::File>>> {
    if fs::create_dir_all(log_dir).is_err() {
        eprintln!("audit log disabled: cannot create {log_dir:?}");
        return None;
    }
    let path = log_dir.join(format!("ucm-audit-{}.jsonl", Utc::now().format("%Y-%m-%d")));
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(err) => {
            eprintln!("audit log disabled: cannot open {path:?}: {err}");
            None
        }
    }
}
