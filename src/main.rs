//! BackyDB - command-line driver.

use backydb::config::{Secrets, Settings};
use backydb::pipeline::{backup, restore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backup and restore engine for relational databases", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "backydb.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the database and persist a backup
    Backup,
    /// Rebuild a database from a stored backup
    Restore,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let secrets = Secrets::from_env();

    if let Err(e) = init_logging(args.log_level.as_deref(), &secrets) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let code = match run(&args, &secrets).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args, secrets: &Secrets) -> backydb::Result<()> {
    let settings = Settings::from_file(&args.config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match args.command {
        Command::Backup => {
            let outcome = backup::run_backup(&settings, secrets, &cancel).await?;
            tracing::info!(
                backup_id = %outcome.backup_id,
                prefix = %outcome.prefix,
                artifacts = outcome.artifacts,
                outputs = outcome.outputs,
                "backup finished"
            );
        }
        Command::Restore => {
            let outcome = restore::run_restore(&settings, secrets, &cancel).await?;
            tracing::info!(
                backup_id = %outcome.backup_id,
                artifacts = outcome.artifacts_applied,
                statements = outcome.statements_executed,
                skipped = outcome.statements_skipped,
                "restore finished"
            );
        }
    }
    Ok(())
}

fn init_logging(level: Option<&str>, secrets: &Secrets) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &secrets.logging_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            tracing::warn!("failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, cancelling"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling"),
    }

    cancel.cancel();
}
