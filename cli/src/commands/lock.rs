// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::{AgentId, CoordinationClient};

#[derive(Subcommand)]
pub enum LockCommand {
    /// List live file locks
    List,
}

pub async fn handle(command: LockCommand, client: &CoordinationClient) -> Result<()> {
    match command {
        LockCommand::List => list(client).await,
    }
}

async fn list(client: &CoordinationClient) -> Result<()> {
    // Listing is holder-agnostic; the manager just needs an identity.
    let locks = client.locks_for(AgentId::new()).list_locks().await?;
    if locks.is_empty() {
        println!("{}", "No live locks.".dimmed());
        return Ok(());
    }
    println!(
        "{:<40} {:<38} {:<26} {}",
        "PATH".bold(),
        "HOLDER".bold(),
        "EXPIRES".bold(),
        "INTENT".bold()
    );
    for lock in locks {
        println!(
            "{:<40} {:<38} {:<26} {}",
            lock.path,
            lock.holder,
            lock.expires_at.to_rfc3339(),
            lock.intent
        );
    }
    Ok(())
}
