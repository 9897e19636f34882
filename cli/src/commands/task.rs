// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use agentcoord_core::{
    CoordinationClient, TaskFilter, TaskId, TaskSpec, TaskStatus,
};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// List tasks, optionally filtered
    List {
        /// Filter by status (pending, claimed, in_progress, completed, failed, escalated)
        #[arg(long)]
        status: Option<String>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,

        /// Only tasks at or above this priority
        #[arg(long)]
        min_priority: Option<i64>,
    },

    /// Show one task in full
    Show {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Create a task
    Create {
        #[arg(value_name = "TITLE")]
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        #[arg(short, long, default_value_t = 0)]
        priority: i64,

        /// Repeatable; tasks require agents whose capabilities cover all tags
        #[arg(short, long)]
        tag: Vec<String>,

        /// Repeatable; task ids this task depends on
        #[arg(long)]
        depends_on: Vec<String>,
    },

    /// Manually escalate a task
    Escalate {
        #[arg(value_name = "TASK_ID")]
        task_id: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Re-enqueue an escalated task as a fresh record
    Retry {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Move an escalated task to the dead-letter queue
    Archive {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Print the dependency graph
    Graph,
}

pub async fn handle(command: TaskCommand, client: &CoordinationClient) -> Result<()> {
    let queue = client.queue();
    match command {
        TaskCommand::List {
            status,
            tag,
            min_priority,
        } => {
            let mut filter = TaskFilter::default();
            if let Some(status) = status {
                filter = filter.status(
                    TaskStatus::parse(&status)
                        .with_context(|| format!("unknown status '{}'", status))?,
                );
            }
            if let Some(tag) = tag {
                filter = filter.tag(tag);
            }
            if let Some(min) = min_priority {
                filter = filter.min_priority(min);
            }
            let tasks = queue.list_tasks(&filter).await?;
            if tasks.is_empty() {
                println!("{}", "No matching tasks.".dimmed());
                return Ok(());
            }
            println!(
                "{:<38} {:<4} {:<12} {:<24} {}",
                "ID".bold(),
                "PRI".bold(),
                "STATUS".bold(),
                "TAGS".bold(),
                "TITLE".bold()
            );
            for task in tasks {
                let status = paint_status(task.status);
                let tags: Vec<&str> = task.tags.iter().map(String::as_str).collect();
                println!(
                    "{:<38} {:<4} {:<12} {:<24} {}",
                    task.id,
                    task.priority,
                    status,
                    tags.join(","),
                    task.title
                );
            }
        }
        TaskCommand::Show { task_id } => {
            let task = queue.get_task(parse_id(&task_id)?).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommand::Create {
            title,
            description,
            priority,
            tag,
            depends_on,
        } => {
            let mut spec = TaskSpec::new(title)
                .description(description)
                .priority(priority)
                .tags(tag);
            for dep in depends_on {
                spec = spec.depends_on(parse_id(&dep)?);
            }
            let task = queue.create_task(spec).await?;
            println!("{} {}", "Created".green(), task.id);
        }
        TaskCommand::Escalate { task_id, reason } => {
            let task = queue.escalate_task(parse_id(&task_id)?, &reason).await?;
            println!("{} {}", "Escalated".red(), task.id);
        }
        TaskCommand::Retry { task_id } => {
            let child = queue.retry_task(parse_id(&task_id)?).await?;
            println!("{} {} (new record {})", "Re-enqueued".green(), task_id, child.id);
        }
        TaskCommand::Archive { task_id } => {
            queue.archive_task(parse_id(&task_id)?).await?;
            println!("{} {}", "Archived".dimmed(), task_id);
        }
        TaskCommand::Graph => {
            let graph = queue.get_dependency_graph().await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<TaskId> {
    TaskId::parse(raw).with_context(|| format!("invalid task id '{}'", raw))
}

fn paint_status(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => "pending".cyan(),
        TaskStatus::Claimed => "claimed".yellow(),
        TaskStatus::InProgress => "in_progress".yellow(),
        TaskStatus::Completed => "completed".green(),
        TaskStatus::Failed => "failed".red(),
        TaskStatus::Escalated => "escalated".red().bold(),
    }
}
