//! MemVault server entry point.

use clap::{Parser, Subcommand};
use memvault::config::{self, ConnectionDescriptor};
use memvault::server::McpServer;
use memvault::storage::{self, Storage};
use memvault::tools::ToolHandler;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "memvault", version, about = "Persistent long-term memory for AI agents over MCP")]
struct Cli {
    /// Storage connection string (overrides STORAGE_CONNECTION_STRING).
    #[arg(long, value_name = "URL")]
    connection_string: Option<String>,

    /// Log level: TRACE, DEBUG, INFO, WARNING, ERROR, CRITICAL.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP requests on stdio (the default).
    Serve,
    /// Print storage statistics and tag patterns as JSON, then exit.
    Stats,
    /// Remove unused tag dictionary entries and expired contexts.
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Stdout carries the protocol; all diagnostics go to stderr.
    // RUST_LOG wins over LOG_LEVEL when both are set.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config::log_filter_directive(
                    cli.log_level.as_deref(),
                ))
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> memvault::Result<()> {
    let connection_string = config::resolve_connection_string(cli.connection_string.as_deref());
    let descriptor = ConnectionDescriptor::parse(&connection_string)?;
    info!(provider = descriptor.provider(), "starting memvault");

    // Fail-fast: a backend that cannot initialize aborts startup here.
    let backend = storage::connect(&descriptor).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let server = McpServer::new(ToolHandler::new(backend));
            server.run().await
        }
        Command::Stats => {
            let stats = backend.get_storage_stats().await?;
            let patterns = backend.analyze_tag_patterns(20).await?;
            let report = serde_json::json!({
                "stats": stats,
                "tag_patterns": patterns,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            backend.close().await;
            Ok(())
        }
        Command::Cleanup => {
            let tags_removed = backend.cleanup_unused_tags().await?;
            let contexts_removed = backend.cleanup_expired().await?;
            let report = serde_json::json!({
                "unused_tags_removed": tags_removed,
                "expired_contexts_removed": contexts_removed,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            backend.close().await;
            Ok(())
        }
    }
}
