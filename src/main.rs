use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use treesync::config::Config;
use treesync::daemon::{Session, SessionOptions};
use treesync::model::SyncMode;
use treesync::workspace;

#[derive(Parser, Debug)]
#[command(name = "treesync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and exit
    Sync {
        /// Sync mode for files changed on both sides (push or pull)
        #[arg(long)]
        mode: Option<SyncMode>,
    },
    /// Keep the project in sync until interrupted
    Watch {
        #[arg(long)]
        mode: Option<SyncMode>,
        /// Seconds between remote polls
        #[arg(long = "interval", default_value_t = 30)]
        interval_secs: u64,
    },
    /// Show pending local and remote changes
    Status,
    /// Show project details from the backend
    Info,
    /// Ask the backend to compile the project
    Compile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    let res = run(cfg, cli.command).await;
    if let Err(err) = &res {
        if workspace::is_locked(err) {
            eprintln!("{err:#}");
            std::process::exit(3);
        }
    }
    res
}

async fn run(cfg: Config, command: Commands) -> Result<()> {
    match command {
        Commands::Sync { mode } => {
            let session = Session::open(
                cfg,
                SessionOptions {
                    mode,
                    log_to_stdout: false,
                    ..SessionOptions::default()
                },
            )?;
            let result = session.sync_once().await?;
            println!("{}", serde_json::to_string(&result)?);
            if result.conflict {
                eprintln!("unresolved conflicts, rerun with --mode push or --mode pull");
                std::process::exit(2);
            }
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Watch {
            mode,
            interval_secs,
        } => {
            let session = Session::open(
                cfg,
                SessionOptions {
                    mode,
                    log_to_stdout: true,
                    sync_interval: Duration::from_secs(interval_secs.max(1)),
                },
            )?;
            let shutdown = Arc::new(tokio::sync::Notify::new());
            let signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                signal.notify_one();
            });
            session.run_watch(shutdown).await?;
        }
        Commands::Status => {
            let session = Session::open(cfg, quiet())?;
            session.scan_local()?;
            let pending = session.pending_changes();
            if pending.is_empty() {
                println!("up to date");
            }
            for rec in pending {
                println!(
                    "{:<8} local={:?} remote={:?} {}",
                    format!("{:?}", rec.change_location).to_lowercase(),
                    rec.local_change,
                    rec.remote_change,
                    rec.relative_path
                );
            }
        }
        Commands::Info => {
            let session = Session::open(cfg, quiet())?;
            session.backend().validate_token().await?;
            let info = session.backend().load_project_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Compile => {
            let session = Session::open(cfg, quiet())?;
            let outcome = session.backend().compile_project().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn quiet() -> SessionOptions {
    SessionOptions {
        log_to_stdout: false,
        ..SessionOptions::default()
    }
}
