// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::CoordinationClient;

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Read audit entries after a cursor
    Read {
        /// Resume after this entry id (empty = from the beginning)
        #[arg(long, default_value = "")]
        cursor: String,

        #[arg(long, default_value_t = 100)]
        count: usize,
    },
}

pub async fn handle(command: AuditCommand, client: &CoordinationClient) -> Result<()> {
    match command {
        AuditCommand::Read { cursor, count } => {
            let entries = client.audit().read_from(&cursor, count).await?;
            if entries.is_empty() {
                println!("{}", "No entries past cursor.".dimmed());
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "{} {} {} {} {}",
                    entry.seq.dimmed(),
                    entry.timestamp.dimmed(),
                    entry.kind.cyan(),
                    entry.agent_id,
                    if entry.reason.is_empty() {
                        entry.context.clone()
                    } else {
                        format!("{}: {}", entry.context, entry.reason)
                    }
                );
            }
            if let Some(last) = entries.last() {
                println!("{}", format!("cursor: {}", last.seq).dimmed());
            }
        }
    }
    Ok(())
}
