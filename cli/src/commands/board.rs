// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::{CoordinationClient, ThreadId};

#[derive(Subcommand)]
pub enum BoardCommand {
    /// List board threads
    List {
        /// Restrict to one channel
        #[arg(long)]
        channel: Option<String>,
    },

    /// Show one thread with all posts
    Show {
        #[arg(value_name = "THREAD_ID")]
        thread_id: String,
    },
}

pub async fn handle(command: BoardCommand, client: &CoordinationClient) -> Result<()> {
    let board = client.board();
    match command {
        BoardCommand::List { channel } => {
            let threads = board.list_threads(channel.as_deref()).await?;
            if threads.is_empty() {
                println!("{}", "No threads.".dimmed());
                return Ok(());
            }
            for thread in threads {
                let pin = if thread.pinned { "📌 " } else { "" };
                println!(
                    "{}{} {} {} ({} posts)",
                    pin,
                    thread.id.to_string().dimmed(),
                    format!("#{}", thread.channel).cyan(),
                    thread.title.bold(),
                    thread.posts.len()
                );
            }
        }
        BoardCommand::Show { thread_id } => {
            let id = ThreadId::parse(&thread_id)
                .with_context(|| format!("invalid thread id '{}'", thread_id))?;
            let thread = board.get_thread(id).await?;
            println!(
                "{} {}",
                format!("#{}", thread.channel).cyan(),
                thread.title.bold()
            );
            for post in &thread.posts {
                println!(
                    "  {} {}",
                    format!("[{} {}]", post.timestamp.to_rfc3339(), post.author).dimmed(),
                    post.body
                );
            }
        }
    }
    Ok(())
}
