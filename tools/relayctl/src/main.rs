//! relayctl - operator CLI for the event relay
//!
//! Inspects the outbox, inbox and dead-letter tables directly and lets an
//! operator return poisoned outbox rows to the dispatch queue.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use event_relay_rs::db::init_pool;
use event_relay_rs::models::{FailedEvent, OutboxEvent};
use event_relay_rs::repos::{
    DeadLetterStore, InboxStore, OutboxStore, PgDeadLetterStore, PgInboxStore, PgOutboxStore,
};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "Inspect and repair the event relay tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Count pending and poisoned outbox rows, unprocessed and dead-lettered inbox rows
    Backlog,
    /// List outbox rows that exhausted their retries
    Poisoned {
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Put a poisoned outbox row back in the dispatch queue with a fresh retry budget
    Requeue {
        /// Outbox row id
        id: Uuid,
    },
    /// Show the inbox row for a message id
    Inbox { message_id: String },
    /// List dead-letter records, newest first
    DeadLetters {
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let Some(database_url) = cli.database_url.as_deref() else {
        bail!("DATABASE_URL is not set (pass --database-url or export it)");
    };
    let pool = init_pool(database_url)
        .await
        .context("failed to connect to Postgres")?;
    tracing::debug!("Connected to relay database");

    match cli.command {
        Commands::Backlog => backlog(&pool, cli.format).await,
        Commands::Poisoned { limit } => poisoned(&pool, limit, cli.format).await,
        Commands::Requeue { id } => requeue(&pool, id).await,
        Commands::Inbox { message_id } => inbox(&pool, &message_id, cli.format).await,
        Commands::DeadLetters { limit } => dead_letters(&pool, limit, cli.format).await,
    }
}

async fn backlog(pool: &PgPool, format: Format) -> Result<()> {
    let outbox = PgOutboxStore::new(pool.clone()).backlog().await?;
    let inbox = PgInboxStore::new(pool.clone()).backlog().await?;
    let dead_letters = PgDeadLetterStore::new(pool.clone()).count().await?;

    match format {
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "outbox": outbox,
                "inbox": inbox,
                "dead_letters": dead_letters,
            }))?
        ),
        Format::Text => {
            println!("outbox   pending={} poisoned={}", outbox.pending, outbox.poisoned);
            println!(
                "inbox    unprocessed={} dead_lettered={}",
                inbox.unprocessed, inbox.dead_lettered
            );
            println!("failed   records={dead_letters}");
        }
    }
    Ok(())
}

async fn poisoned(pool: &PgPool, limit: i64, format: Format) -> Result<()> {
    let rows = PgOutboxStore::new(pool.clone()).list_poisoned(limit).await?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("No poisoned outbox rows");
            }
            for row in &rows {
                print_outbox_row(row);
            }
        }
    }
    Ok(())
}

fn print_outbox_row(row: &OutboxEvent) {
    println!(
        "{}  {}  org={}  retries={}  poisoned_at={}",
        row.id,
        row.event_type,
        row.organization_id,
        row.retry_count,
        row.poisoned_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    );
    if let Some(error) = &row.last_error {
        println!("    last_error: {error}");
    }
}

async fn requeue(pool: &PgPool, id: Uuid) -> Result<()> {
    let store = PgOutboxStore::new(pool.clone());
    if !store.requeue_poisoned(id).await? {
        match store.get(id).await? {
            None => bail!("outbox row {id} not found"),
            Some(row) if row.is_processed() => bail!("outbox row {id} was already published"),
            Some(_) => bail!("outbox row {id} is not poisoned"),
        }
    }

    tracing::info!(outbox_id = %id, "Requeued poisoned outbox row");
    println!("Requeued {id}");
    Ok(())
}

async fn inbox(pool: &PgPool, message_id: &str, format: Format) -> Result<()> {
    let Some(row) = PgInboxStore::new(pool.clone()).get(message_id).await? else {
        bail!("no inbox row for message {message_id}");
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&row)?),
        Format::Text => {
            let state = if row.processed_at.is_some() {
                "processed"
            } else if row.dead_lettered_at.is_some() {
                "dead-lettered"
            } else {
                "unprocessed"
            };
            println!(
                "{}  {}  org={}  attempts={}  state={}",
                row.message_id, row.event_type, row.organization_id, row.attempts, state
            );
            if let Some(error) = &row.last_error {
                println!("    last_error: {error}");
            }
        }
    }
    Ok(())
}

async fn dead_letters(pool: &PgPool, limit: i64, format: Format) -> Result<()> {
    let rows = PgDeadLetterStore::new(pool.clone()).list(limit).await?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("Dead-letter record is empty");
            }
            for row in &rows {
                print_failed_row(row);
            }
        }
    }
    Ok(())
}

fn print_failed_row(row: &FailedEvent) {
    println!(
        "{}  {}  message={}  attempts={}",
        row.failed_at.to_rfc3339(),
        row.subject,
        row.message_id.as_deref().unwrap_or("-"),
        row.attempts,
    );
    println!("    error: {}", row.error);
}
