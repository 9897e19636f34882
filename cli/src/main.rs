// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # agentcoord CLI
//!
//! Operator surface over the coordination substrate: inspect agents, tasks,
//! locks, board threads and the audit stream, and act on approvals and
//! escalated tasks. Talks straight to the shared KV (or its file fallback),
//! the same way every other process in the fleet does.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use agentcoord_core::{CoordConfig, CoordinationClient};

mod commands;

use commands::{
    AgentCommand, ApprovalCommand, AuditCommand, BoardCommand, LockCommand, TaskCommand,
};

/// agentcoord - coordinate fleets of worker agents over a shared KV
#[derive(Parser)]
#[command(name = "agentcoord")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// KV connection string
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Directory for the file-backed fallback
    #[arg(long, global = true, env = "AGENTCOORD_FALLBACK_DIR", value_name = "DIR")]
    fallback_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AGENTCOORD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect registered agents
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Create, list and supervise tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Inspect file locks
    #[command(subcommand)]
    Lock(LockCommand),

    /// Browse board threads
    #[command(subcommand)]
    Board(BoardCommand),

    /// List, approve and reject approval requests
    #[command(subcommand)]
    Approval(ApprovalCommand),

    /// Read the audit stream
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut config = CoordConfig::from_env();
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }
    if let Some(dir) = cli.fallback_dir {
        config = config.with_fallback_dir(dir);
    }

    let client = CoordinationClient::connect(config).await?;

    match cli.command {
        Commands::Agent(cmd) => commands::agent::handle(cmd, &client).await,
        Commands::Task(cmd) => commands::task::handle(cmd, &client).await,
        Commands::Lock(cmd) => commands::lock::handle(cmd, &client).await,
        Commands::Board(cmd) => commands::board::handle(cmd, &client).await,
        Commands::Approval(cmd) => commands::approval::handle(cmd, &client).await,
        Commands::Audit(cmd) => commands::audit::handle(cmd, &client).await,
    }
}
