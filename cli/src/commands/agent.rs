// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::{AgentStatus, CoordinationClient};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List registered agents with their computed liveness
    List,
}

pub async fn handle(command: AgentCommand, client: &CoordinationClient) -> Result<()> {
    match command {
        AgentCommand::List => list(client).await,
    }
}

async fn list(client: &CoordinationClient) -> Result<()> {
    let agents = client.registry().list_agents().await?;
    if agents.is_empty() {
        println!("{}", "No agents registered.".dimmed());
        return Ok(());
    }

    println!(
        "{:<38} {:<14} {:<16} {:<10} {}",
        "ID".bold(),
        "ROLE".bold(),
        "NAME".bold(),
        "STATUS".bold(),
        "WORKING ON".bold()
    );
    for agent in agents {
        let status = match agent.status {
            AgentStatus::Active => "active".green(),
            AgentStatus::Idle => "idle".yellow(),
            AgentStatus::Hung => "hung".red(),
            AgentStatus::Terminated => "terminated".dimmed(),
        };
        println!(
            "{:<38} {:<14} {:<16} {:<10} {}",
            agent.id,
            agent.role,
            agent.name,
            status,
            agent.working_on
        );
    }
    Ok(())
}
