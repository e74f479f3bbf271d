//! dbfan CLI
//!
//! Runs queries against the targets declared in a settings file and prints
//! results as JSON on stdout. Logs go to stderr.

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    BatchCommand, ExecCommand, IdCommand, PingCommand, QueryCommand, TargetsCommand,
    TransactionCommand,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long, default_value = "dbfan.toml", env = "DBFAN_CONFIG", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DBFAN_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "DBFAN_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured targets
    Targets(TargetsCommand),
    /// Connect to targets and report which are reachable
    Ping(PingCommand),
    /// Fan one query out over one or more targets
    Query(QueryCommand),
    /// Dispatch a JSON file of query requests
    Batch(BatchCommand),
    /// Execute a statement and print the affected count
    Exec(ExecCommand),
    /// Execute statements in one transaction
    Tx(TransactionCommand),
    /// Generate an id using a target's generator
    Uuid(IdCommand),
}

fn log_filter(level: &str) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    // RUST_LOG takes over completely when set
    if std::env::var("RUST_LOG").is_ok() {
        return tracing_subscriber::EnvFilter::try_from_default_env()
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG environment variable: {}", e));
    }

    Ok(tracing_subscriber::EnvFilter::new(format!(
        "dbfan={level},\
         dbfan_query={level},\
         dbfan_query_postgres={level},\
         dbfan_query_sqlite={level},\
         dbfan_query_mongodb={level},\
         dbfan_query_elasticsearch={level},\
         dbfan_query_redis={level},\
         dbfan_config={level},\
         tokio_postgres=warn,\
         mongodb=warn,\
         redis=warn,\
         hyper=warn,\
         reqwest=warn,\
         rustls=warn",
        level = level
    )))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(&cli.log_level)?;
    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    match cli.command {
        Commands::Targets(cmd) => cmd.execute(&cli.config),
        Commands::Ping(cmd) => cmd.execute(&cli.config),
        Commands::Query(cmd) => cmd.execute(&cli.config),
        Commands::Batch(cmd) => cmd.execute(&cli.config),
        Commands::Exec(cmd) => cmd.execute(&cli.config),
        Commands::Tx(cmd) => cmd.execute(&cli.config),
        Commands::Uuid(cmd) => cmd.execute(&cli.config),
    }
}
