//! devgraph - driver binary
//!
//! Thin glue over the library: load the environment, open a storage session,
//! apply a change request to staging, print the plan or commit it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use devgraph::backend::SystemBackend;
use devgraph::changes::ChangeSet;
use devgraph::cli::{Cli, Commands};
use devgraph::engine::{ActionPlan, CancelFlag, CommitCallbacks, CommitError};
use devgraph::environment::Environment;
use devgraph::error::DevgraphError;
use devgraph::prober::SnapshotProber;
use devgraph::process_guard::{self, ProcessGuard};
use devgraph::sanity;
use devgraph::storage::Storage;

/// Initialize tracing; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Prints numbered progress lines while committing.
struct ProgressCallbacks {
    total: usize,
    current: std::cell::Cell<usize>,
}

impl CommitCallbacks for ProgressCallbacks {
    fn message(&self, message: &str) {
        let n = self.current.get() + 1;
        self.current.set(n);
        info!("{}", message);
        println!("[{}/{}] {}", n, self.total, message);
    }

    fn error(&self, message: &str, what: &str) {
        error!(action = what, "{}", message);
        eprintln!("✗ {}: {}", what, message);
    }
}

fn load_environment(path: Option<&Path>, dry_run: bool) -> Result<Environment> {
    let mut env = match path {
        Some(path) => Environment::load_from_file(path)?,
        None => Environment::default(),
    };
    if dry_run {
        env.read_only = true;
    }
    env.validate()?;
    Ok(env)
}

fn open_storage(env: Environment, snapshot: Option<&Path>) -> Result<Storage> {
    let storage = match snapshot {
        Some(path) => Storage::with_parts(
            env,
            Box::new(SnapshotProber::new(path)),
            Box::new(SystemBackend::new()),
        )?,
        None => Storage::new(env)?,
    };
    Ok(storage)
}

/// Probe, then apply `changes` to staging.
fn stage(storage: &mut Storage, changes: &Path) -> Result<()> {
    let changes = ChangeSet::load_from_file(changes)?;
    storage.probe()?;
    let staging = storage.get_staging()?;
    changes.apply(staging)?;
    debug!(ops = changes.ops.len(), "changes staged");
    Ok(())
}

fn print_plan(plan: &ActionPlan) {
    println!("{}", plan.summary());
    for (i, action) in plan.iter().enumerate() {
        println!("  {:>2}. {}", i + 1, action);
    }
}

fn report_commit_error(err: &CommitError) {
    for action in err.succeeded() {
        println!("  ✓ {}", action);
    }
    if let Some(action) = err.failed() {
        println!("  ✗ {}", action);
    }
    for action in err.not_attempted() {
        println!("  - {} (not attempted)", action);
    }
}

fn run_probe(env: Environment, snapshot: Option<PathBuf>, save: Option<PathBuf>) -> Result<()> {
    let mut storage = open_storage(env, snapshot.as_deref())?;
    let probed = storage.probe()?;
    print!("{}", probed);
    if let Some(path) = save {
        let json = serde_json::to_string_pretty(probed).context("Failed to serialize graph")?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("probed graph saved to {:?}", path);
    }
    Ok(())
}

fn run_plan(env: Environment, changes: &Path, snapshot: Option<PathBuf>) -> Result<()> {
    let mut storage = open_storage(env, snapshot.as_deref())?;
    stage(&mut storage, changes)?;
    print_plan(&storage.calculate_plan()?);
    Ok(())
}

fn run_commit(env: Environment, changes: &Path, snapshot: Option<PathBuf>) -> Result<()> {
    if snapshot.is_some() && !env.read_only {
        anyhow::bail!("--snapshot describes no real storage; commit it only with --dry-run");
    }
    if !env.read_only && !sanity::is_running_as_root() {
        anyhow::bail!("committing changes requires root privileges (or use --dry-run)");
    }

    let mut storage = open_storage(env, snapshot.as_deref())?;
    stage(&mut storage, changes)?;
    let plan = storage.calculate_plan()?;
    print_plan(&plan);

    let cancel = CancelFlag::new();
    if let Err(e) = process_guard::register_cancel_signals(&cancel) {
        warn!("Failed to install signal handlers: {}", e);
    }
    let callbacks = ProgressCallbacks {
        total: plan.len(),
        current: std::cell::Cell::new(0),
    };

    let mode = if storage.environment().read_only {
        " (dry run)"
    } else {
        ""
    };
    match storage.commit_with(&callbacks, &cancel) {
        Ok(outcome) => {
            println!("✓ {} action(s) succeeded{}", outcome.records.len(), mode);
            info!(devices = outcome.probed.len(), "re-probed after commit");
            Ok(())
        }
        Err(DevgraphError::Commit(err)) => {
            report_commit_error(&err);
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_validate(config: &Path, changes: Option<PathBuf>) -> Result<()> {
    let env = Environment::load_from_file(config)?;
    env.validate()?;
    println!("✓ Environment file is valid: {:?}", config);
    if let Some(path) = changes {
        let changes = ChangeSet::load_from_file(&path)?;
        println!("✓ Change request is valid: {} operation(s)", changes.ops.len());
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        dry_run,
        env,
        command,
    } = cli;
    let env_path = env.as_deref();
    match command {
        Commands::Probe { snapshot, save } => {
            run_probe(load_environment(env_path, dry_run)?, snapshot, save)
        }
        Commands::Plan { changes, snapshot } => {
            run_plan(load_environment(env_path, dry_run)?, &changes, snapshot)
        }
        Commands::Commit { changes, snapshot } => {
            run_commit(load_environment(env_path, dry_run)?, &changes, snapshot)
        }
        Commands::Validate { config, changes } => run_validate(&config, changes),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!(?cli, "CLI arguments parsed");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
