//! `taskq-worker`: run the poll loop or inspect and feed the queue.

mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use taskq_core::{EnqueueOptions, Payload, TaskId, TaskStatus, TaskType};
use taskq_infra::QueueConfig;
use taskq_infra::queue::{
    HandlerRegistry, Pagination, PollLoop, PostgresTaskStore, TaskFilter, TaskStore,
};

/// Durable task queue worker.
#[derive(Parser, Debug)]
#[command(name = "taskq-worker", about = "Durable Postgres-backed task queue")]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the poll loop until Ctrl-C.
    Run {
        /// Register the bundled demo handlers. They do no real work and mark
        /// tasks completed with `"demo": true` results.
        #[arg(long)]
        demo_handlers: bool,
    },

    /// Create the tasks table if needed.
    Migrate,

    /// Enqueue a task.
    Enqueue {
        /// Task type (job_fetch, matching, csv_generation, email_delivery).
        task_type: TaskType,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = taskq_core::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
        /// Delay before the task becomes eligible.
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// Show one task.
    Get { id: TaskId },

    /// List tasks, newest first.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long = "type")]
        task_type: Option<TaskType>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },

    /// Task counts by status.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    taskq_observability::init();

    let cli = Cli::parse();
    let config = QueueConfig::from_env()?;

    let database_url = cli
        .database_url
        .context("DATABASE_URL must be set (env or --database-url)")?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresTaskStore::new(pool);

    match cli.command {
        Commands::Run { demo_handlers } => run(store, &config, demo_handlers).await,
        Commands::Migrate => {
            store.migrate().await?;
            tracing::info!("tasks table ready");
            Ok(())
        }
        Commands::Enqueue {
            task_type,
            payload,
            priority,
            max_attempts,
            delay_secs,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let now = Utc::now();
            let mut options = EnqueueOptions::default()
                .with_priority(priority)
                .with_max_attempts(max_attempts);
            if let Some(secs) = delay_secs {
                let delay = i64::try_from(secs).context("delay too large")?;
                options = options.scheduled_for(now + chrono::Duration::seconds(delay));
            }

            let task = store
                .enqueue(task_type, Payload::new(payload), options, now)
                .await?;
            print_json(&task)
        }
        Commands::Get { id } => match store.get(id).await? {
            Some(task) => print_json(&task),
            None => anyhow::bail!("task not found: {id}"),
        },
        Commands::List {
            status,
            task_type,
            limit,
            offset,
        } => {
            let filter = TaskFilter {
                status,
                task_type,
            };
            let tasks = store.list(&filter, Pagination::new(limit, offset)).await?;
            print_json(&tasks)
        }
        Commands::Stats => print_json(&store.stats().await?),
    }
}

/// Handlers for `run`. Without `--demo-handlers` nothing is registered and
/// every claimed task fails as an unknown type instead of completing unworked.
fn registry(demo_handlers: bool) -> Result<HandlerRegistry> {
    if demo_handlers {
        tracing::warn!("demo handlers registered: tasks complete without doing real work");
        Ok(handlers::demo_registry()?)
    } else {
        Ok(HandlerRegistry::new())
    }
}

async fn run(store: PostgresTaskStore, config: &QueueConfig, demo_handlers: bool) -> Result<()> {
    store.migrate().await?;

    let registry = registry(demo_handlers)?;
    let missing = registry.missing_types();
    if !missing.is_empty() {
        tracing::warn!(?missing, "task types without a handler will fail");
    }

    let worker_id = config.worker_id_or_random();
    tracing::info!(%worker_id, "starting worker");

    let handle = PollLoop::new(
        worker_id,
        store,
        Arc::new(registry),
        config.poll_loop_config(),
    )
    .start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, finishing current tick");

    let stats = handle.shutdown().await;
    tracing::info!(
        ticks = stats.ticks,
        succeeded = stats.succeeded,
        retried = stats.retried,
        failed = stats.failed,
        "worker stopped"
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_enqueue() {
        let cli = Cli::try_parse_from([
            "taskq-worker",
            "enqueue",
            "email_delivery",
            "--payload",
            r#"{"to":"a@b.c"}"#,
            "--priority",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue {
                task_type,
                priority,
                max_attempts,
                ..
            } => {
                assert_eq!(task_type, TaskType::EmailDelivery);
                assert_eq!(priority, 3);
                assert_eq!(max_attempts, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_registers_no_handlers_unless_asked() {
        let cli = Cli::try_parse_from(["taskq-worker", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { demo_handlers: false }));
        let plain = registry(false).unwrap();
        assert!(plain.is_empty());
        assert_eq!(plain.missing_types(), TaskType::ALL.to_vec());

        let cli = Cli::try_parse_from(["taskq-worker", "run", "--demo-handlers"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { demo_handlers: true }));
        assert!(registry(true).unwrap().missing_types().is_empty());
    }

    #[test]
    fn rejects_unknown_task_type() {
        assert!(Cli::try_parse_from(["taskq-worker", "enqueue", "fax"]).is_err());
    }

    #[test]
    fn parses_list_filters() {
        let cli = Cli::try_parse_from([
            "taskq-worker",
            "list",
            "--status",
            "failed",
            "--type",
            "matching",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(TaskStatus::Failed),
                task_type: Some(TaskType::Matching),
                ..
            }
        ));
    }
}
