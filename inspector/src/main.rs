use clap::{Parser, Subcommand};
use inspector::{
    init_logging, CleanupScheduler, ImportMode, Inspector, InspectorConfig, InspectorError,
    LoggingConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Inspector - records HTTP traffic and applies interception rules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database connection URL
    #[arg(long, global = true, default_value = "sqlite://inspector.db")]
    database_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file (rotated daily)
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the REST API and the cleanup scheduler
    Serve {
        /// HTTP API port
        #[arg(long, default_value_t = 9090)]
        port: u16,

        /// Keep transactions for this many days
        #[arg(long, default_value_t = 7)]
        retention_days: u64,

        /// Seconds between cleanup runs
        #[arg(long, default_value_t = SECS_PER_DAY)]
        cleanup_interval_secs: u64,

        /// Disable periodic cleanup
        #[arg(long)]
        no_cleanup: bool,
    },
    /// Delete old transactions once and exit
    Cleanup {
        #[arg(long, default_value_t = 7)]
        retention_days: u64,
    },
    /// Write stored rules as JSON to a file, or stdout
    ExportRules {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Load rules from a JSON file
    ImportRules {
        path: PathBuf,

        /// Drop stored rules that are not in the file
        #[arg(long)]
        replace: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: cli.log_level.clone(),
        json_format: cli.log_json,
        log_file: cli.log_file.clone(),
        ..Default::default()
    };
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli, logging).await {
        error!("Inspector failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, logging: LoggingConfig) -> Result<(), InspectorError> {
    let mut config = InspectorConfig {
        database_url: cli.database_url,
        logging,
        ..Default::default()
    };

    match cli.command {
        Command::Serve {
            port,
            retention_days,
            cleanup_interval_secs,
            no_cleanup,
        } => {
            config.http_port = port;
            config.cleanup.enabled = !no_cleanup;
            config.cleanup.retention_secs = retention_days.saturating_mul(SECS_PER_DAY);
            config.cleanup.interval_secs = cleanup_interval_secs;

            let inspector = Inspector::start(config).await?;
            inspector.spawn_cleanup().await;

            println!("🚀 Inspector starting...");
            println!("🌐 HTTP API will be available at: http://127.0.0.1:{}", port);
            println!("💾 Database: {}", inspector.config().database_url);
            if no_cleanup {
                println!("🧹 Cleanup: disabled");
            } else {
                println!(
                    "🧹 Cleanup: every {}s, keeping {} days",
                    cleanup_interval_secs, retention_days
                );
            }
            println!();
            println!("💡 Tip: Use --help to see all available options");
            println!();

            let shutdown = inspector.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, shutting down");
                    shutdown.cancel();
                }
            });

            let served = inspector.serve().await;
            inspector.shutdown().await;
            served
        }
        Command::Cleanup { retention_days } => {
            let inspector = Inspector::start(config).await?;
            let scheduler = CleanupScheduler::new(
                inspector.repository().clone(),
                Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY)),
                Duration::from_secs(SECS_PER_DAY),
            );
            let deleted = scheduler.run_once().await?;
            println!("🧹 Removed {} transactions", deleted);
            inspector.shutdown().await;
            Ok(())
        }
        Command::ExportRules { output } => {
            let inspector = Inspector::start(config).await?;
            let json = inspector.rules().export_json().await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    println!("📤 Rules exported to {}", path.display());
                }
                None => println!("{}", json),
            }
            inspector.shutdown().await;
            Ok(())
        }
        Command::ImportRules { path, replace } => {
            let json = tokio::fs::read_to_string(&path).await?;
            let inspector = Inspector::start(config).await?;
            let mode = if replace {
                ImportMode::Replace
            } else {
                ImportMode::Merge
            };
            let summary = inspector.rules().import_json(&json, mode).await?;
            println!(
                "📥 Imported {} rules: {} added, {} updated, {} removed",
                summary.imported, summary.added, summary.updated, summary.removed
            );
            inspector.shutdown().await;
            Ok(())
        }
    }
}
