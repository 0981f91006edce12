use clap::{Parser, Subcommand};
use eyre::{Context, Result, eyre};
use std::path::PathBuf;
use std::process::ExitCode;
use synapse_room_logger::config::{self, DatabaseConfig, LoggerConfig};
use synapse_room_logger::scheduler::{self, Shutdown};
use synapse_room_logger::{
    CheckpointStore, EventStore, Exporter, FileAppender, RecordMapper, SqliteEventStore,
};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Export Matrix room history from a Synapse database to daily log files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase verbosity.
    #[arg(long, global = true)]
    debug: bool,

    /// Path to the configuration file (YAML or TOML).
    /// Defaults to ./config.yaml, then $XDG_CONFIG_HOME/synapse-room-logger/.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run once, then exit.
    Cron,
    /// Run every `daemon_interval` seconds until interrupted.
    Daemon,
}

/// The run failed in a way the next run may recover from.
const EXIT_RUN_FAILED: u8 = 2;

fn init_logging(debug: bool, configured: LevelFilter) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured.to_string().to_lowercase()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(database: &DatabaseConfig) -> Result<Box<dyn EventStore>> {
    match database {
        DatabaseConfig::Sqlite { path } => Ok(Box::new(SqliteEventStore::new(path))),
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres {
            host,
            port,
            name,
            user,
            password,
            connect_timeout,
        } => Ok(Box::new(synapse_room_logger::PostgresEventStore::new(
            host,
            *port,
            name,
            user,
            password,
            *connect_timeout,
        ))),
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => {
            Err(eyre!("this build was compiled without PostgreSQL support"))
        }
    }
}

fn build_exporter(config: &LoggerConfig) -> Result<Exporter<Box<dyn EventStore>, FileAppender>> {
    let store = open_store(&config.database)?;
    let mapper = RecordMapper::new(
        config.rooms.clone(),
        &config.output_directory,
        config.file_layout,
    );
    Ok(Exporter::new(
        store,
        CheckpointStore::in_directory(&config.output_directory),
        mapper,
        FileAppender::new(),
    ))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 1. Load config (CLI path > ./config.yaml > user config dir)
    let config_path = config::resolve_config_path(cli.config.as_deref())?;
    let config = config::load_config(&config_path)?;

    // 2. Logging (--debug > RUST_LOG > config)
    init_logging(cli.debug, config.log_level);
    debug!(?cli, config = %config_path.display(), "Arguments");
    info!("Starting Matrix room logger.");
    for name in config.shared_room_names() {
        warn!(room = name, "Several rooms share this name; their messages share files.");
    }

    // 3. Run
    let mut exporter = build_exporter(&config)?;
    match cli.command {
        Command::Cron => {
            let report = scheduler::run_cron(|| exporter.run_once())
                .wrap_err("Export stopped on an unrecoverable error")?;
            if report.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_RUN_FAILED))
            }
        }
        Command::Daemon => {
            let (handle, shutdown) = Shutdown::channel();
            scheduler::install_signal_handler(handle)
                .map_err(|e| eyre!("Failed to install signal handler: {}", e))?;
            scheduler::run_daemon(|| exporter.run_once(), config.daemon_interval, &shutdown)
                .wrap_err("Daemon stopped on an unrecoverable error")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
