//! Child-process driver for the cross-process integration tests.
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use ward_lock::{LockOptions, ProcessLock};
use ward_runs::{RunRegistration, RunRegistry, RunRegistryConfig};
use ward_store::{JsonStore, Mutation};

#[derive(Debug, Parser)]
#[command(name = "ward-probe", about = "Exercise ward locks and stores from a separate process")]
struct Cli {
    #[arg(
        long = "lock-timeout-ms",
        env = "WARD_LOCK_TIMEOUT_MS",
        default_value_t = 10_000,
        help = "Maximum time to wait for a lock"
    )]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: ProbeCommand,
}

#[derive(Debug, Subcommand)]
enum ProbeCommand {
    /// Increment a shared JSON counter under its lock.
    Increment {
        #[arg(long)]
        counter: PathBuf,
        #[arg(long, default_value_t = 1)]
        times: u32,
        #[arg(long, default_value = "probe")]
        writer: String,
    },
    /// Take a lock, print `acquired`, and keep it for a while.
    Hold {
        #[arg(long)]
        resource: PathBuf,
        #[arg(long = "hold-ms", default_value_t = 30_000)]
        hold_ms: u64,
    },
    /// Register a run and exit without completing it.
    AbandonRun {
        #[arg(long)]
        registry: PathBuf,
        #[arg(long = "run-id")]
        run_id: String,
    },
    /// Take the registry lock, load the registry, and print one run's status.
    ShowRun {
        #[arg(long)]
        registry: PathBuf,
        #[arg(long = "run-id")]
        run_id: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    count: u64,
    #[serde(default)]
    writers: Vec<String>,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let lock_options = LockOptions {
        timeout: Duration::from_millis(cli.lock_timeout_ms),
        ..LockOptions::default()
    };

    match cli.command {
        ProbeCommand::Increment {
            counter,
            times,
            writer,
        } => {
            let store = JsonStore::<Counter>::new(counter, lock_options);
            for _ in 0..times {
                let updated = store
                    .update(|document| {
                        document.count += 1;
                        document.writers.push(writer.clone());
                        Mutation::Write(document.count)
                    })
                    .context("counter update failed")?;
                if let Some(warning) = updated.commit.warning() {
                    bail!("counter commit deferred: {warning}");
                }
            }
        }
        ProbeCommand::Hold { resource, hold_ms } => {
            let guard = ProcessLock::with_options(&resource, lock_options)
                .acquire()
                .context("hold lock")?;
            let mut stdout = std::io::stdout();
            writeln!(stdout, "acquired")?;
            stdout.flush()?;
            std::thread::sleep(Duration::from_millis(hold_ms));
            drop(guard);
        }
        ProbeCommand::AbandonRun { registry, run_id } => {
            let mut config = RunRegistryConfig::from_env(registry);
            config.lock = lock_options;
            let registry = RunRegistry::open(config);
            let report = registry
                .register(RunRegistration::new(run_id, "abandoned by probe"))
                .context("register run")?;
            if let Some(warning) = report.warning() {
                bail!("registration deferred: {warning}");
            }
        }
        ProbeCommand::ShowRun { registry, run_id } => {
            let guard = ProcessLock::with_options(&registry, lock_options)
                .acquire()
                .context("registry lock")?;
            let mut config = RunRegistryConfig::from_env(registry);
            config.lock = lock_options;
            let registry = RunRegistry::open(config);
            let status = registry
                .get(&run_id)
                .map(|record| record.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            drop(guard);
            println!("{run_id} {status}");
        }
    }
    Ok(())
}
