use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use frans::{
    Config, ContentStore, Database, LifecycleScheduler, LifecycleSweeper, Result, SweepKind,
};

#[derive(Parser, Debug)]
#[command(name = "frans")]
#[command(about = "File sharing core: content store maintenance and lifecycle sweeps")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "frans.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all lifecycle sweeps periodically until interrupted
    Cron,
    /// Run a single task once
    Task {
        /// lifecycle-session, lifecycle-ticket, lifecycle-grant, lifecycle-file
        /// or refresh-aggregates
        name: String,
    },
    /// Apply pending database migrations
    Migrate,
    /// Compare blob rows with the files on disk
    Verify,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = frans::logging::with_startup_logging(|| load_config(&cli.config));

    if matches!(cli.command, Command::Cron) {
        if let Err(e) = frans::logging::init(&config.logging) {
            eprintln!("Failed to initialize logging: {e}");
            frans::logging::init_console_only(&config.logging.level);
        }
    } else {
        frans::logging::init_console_only(&config.logging.level);
    }

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "frans failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    config.validate()?;
    let db = Database::open(&config.database.path).await?;

    match command {
        Command::Migrate => {
            // Opening the database applies migrations
            info!(version = db.schema_version().await?, "database is up to date");
        }
        Command::Verify => {
            let store = ContentStore::new(&config.files.dir, config.files.max_size)?;
            let report = store.verify(db.pool()).await?;
            print_json(&report);
            if !report.is_consistent() {
                warn!(
                    missing = report.missing_files.len(),
                    orphaned = report.orphaned_files.len(),
                    "content store is inconsistent"
                );
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Task { name } => {
            let sweeper = sweeper(db.clone(), &config)?;
            let report = if name == "refresh-aggregates" {
                sweeper.refresh_aggregates().await?
            } else {
                sweeper.run(name.parse::<SweepKind>()?).await?
            };
            print_json(&report);
        }
        Command::Cron => {
            info!("frans lifecycle cron starting");
            let sweeper = Arc::new(sweeper(db.clone(), &config)?);
            let scheduler = LifecycleScheduler::start(sweeper, config.lifecycle.interval());

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            scheduler.shutdown().await;
        }
    }

    db.close().await;
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> Config {
    match Config::load_with_env(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not load configuration, using defaults");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    }
}

fn sweeper(db: Database, config: &Config) -> Result<LifecycleSweeper> {
    let store = ContentStore::new(&config.files.dir, config.files.max_size)?;
    Ok(LifecycleSweeper::new(db, store, config.clone()))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "could not serialize report"),
    }
}
