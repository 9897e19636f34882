// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::{AgentId, ApprovalId, ApprovalStatus, CoordinationClient};

#[derive(Subcommand)]
pub enum ApprovalCommand {
    /// List open approval requests
    List,

    /// Approve a request
    Approve {
        #[arg(value_name = "APPROVAL_ID")]
        approval_id: String,

        /// Agent id to vote as
        #[arg(long = "as", value_name = "AGENT_ID")]
        approver: String,
    },

    /// Reject a request
    Reject {
        #[arg(value_name = "APPROVAL_ID")]
        approval_id: String,

        /// Agent id to vote as
        #[arg(long = "as", value_name = "AGENT_ID")]
        approver: String,
    },
}

pub async fn handle(command: ApprovalCommand, client: &CoordinationClient) -> Result<()> {
    let approvals = client.approvals();
    match command {
        ApprovalCommand::List => {
            let pending = approvals.list_pending().await?;
            if pending.is_empty() {
                println!("{}", "No pending approvals.".dimmed());
                return Ok(());
            }
            println!(
                "{:<38} {:<22} {:<10} {}",
                "ID".bold(),
                "ACTION".bold(),
                "VOTES".bold(),
                "DESCRIPTION".bold()
            );
            for request in pending {
                println!(
                    "{:<38} {:<22} {:<10} {}",
                    request.id,
                    request.action_type,
                    format!("{}/{}", request.approvals.len(), request.min_approvals),
                    request.description
                );
            }
        }
        ApprovalCommand::Approve {
            approval_id,
            approver,
        } => {
            let status = approvals
                .approve(parse_approval(&approval_id)?, parse_agent(&approver)?)
                .await?;
            print_outcome(status);
        }
        ApprovalCommand::Reject {
            approval_id,
            approver,
        } => {
            let status = approvals
                .reject(parse_approval(&approval_id)?, parse_agent(&approver)?)
                .await?;
            print_outcome(status);
        }
    }
    Ok(())
}

fn parse_approval(raw: &str) -> Result<ApprovalId> {
    ApprovalId::parse(raw).with_context(|| format!("invalid approval id '{}'", raw))
}

fn parse_agent(raw: &str) -> Result<AgentId> {
    AgentId::parse(raw).with_context(|| format!("invalid agent id '{}'", raw))
}

fn print_outcome(status: ApprovalStatus) {
    match status {
        ApprovalStatus::Pending => println!("{}", "Vote recorded; still pending.".yellow()),
        ApprovalStatus::Approved => println!("{}", "Approved.".green()),
        ApprovalStatus::Rejected => println!("{}", "Rejected.".red()),
        ApprovalStatus::Expired => println!("{}", "Request already expired.".dimmed()),
    }
}
