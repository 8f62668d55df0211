//! Ops CLI for the platform: `migrate`, `status`, `dlq list|requeue`,
//! `process show`, `config-hash`. Operational tooling over the core, not a
//! domain feature — it carries no business logic of its own, matching the
//! teacher's `mqk-cli` shape (single-file clap derive, thin dispatch).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use platform_broker::memory::MemoryBroker;
use platform_execution::CommandBus;

#[derive(Parser)]
#[command(name = "platform-cli")]
#[command(about = "Operational tooling for the command bus / outbox / process platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Print connectivity and schema-presence status.
    Status,
    /// Compute a layered config hash and print canonical JSON.
    ConfigHash {
        /// Paths in merge order (base -> env -> override...)
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Dead-letter queue inspection and requeue.
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },
    /// Process instance inspection.
    Process {
        #[command(subcommand)]
        cmd: ProcessCmd,
    },
}

#[derive(Subcommand)]
enum DlqCmd {
    /// List the most recently parked rows.
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Resubmit a parked command as a brand-new command (new idempotency
    /// key) — the original dlq row is left untouched; dlq rows are
    /// immutable per spec §3.
    Requeue {
        id: i64,
    },
}

#[derive(Subcommand)]
enum ProcessCmd {
    /// Show a process instance's current snapshot and its log trail.
    Show {
        process_id: Uuid,
        #[arg(long, default_value_t = 1000)]
        log_limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Migrate => {
            let pool = connect().await?;
            platform_db::migrate(&pool).await?;
            println!("migrations_applied=true");
        }

        Commands::Status => {
            let pool = connect().await?;
            let s = platform_db::status(&pool).await?;
            println!("db_ok={} has_command_table={}", s.ok, s.has_command_table);
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let loaded = platform_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Dlq { cmd } => match cmd {
            DlqCmd::List { limit } => {
                let pool = connect().await?;
                let rows = platform_db::dlq::list(&pool, limit).await?;
                for r in rows {
                    println!(
                        "id={} command_id={} command_name={} failed_status={} error_class={} attempts={} parked_at={}",
                        r.id, r.command_id, r.command_name, r.failed_status, r.error_class, r.attempts, r.parked_at
                    );
                }
            }
            DlqCmd::Requeue { id } => {
                let pool = connect().await?;
                let Some(record) = platform_db::dlq::find_by_id(&pool, id).await? else {
                    anyhow::bail!("no dlq row with id {id}");
                };

                let broker = Arc::new(MemoryBroker::new());
                let bus = CommandBus::new(pool, broker);
                let idempotency_key = format!("requeue:{}:{}", record.command_id, Uuid::new_v4());
                let new_command_id = bus
                    .accept(
                        &record.command_name,
                        &idempotency_key,
                        record.business_key.as_deref(),
                        record.payload,
                        BTreeMap::new(),
                    )
                    .await?;
                println!("requeued dlq_id={id} as new command_id={new_command_id}");
            }
        },

        Commands::Process { cmd } => match cmd {
            ProcessCmd::Show { process_id, log_limit } => {
                let pool = connect().await?;
                let Some(instance) = platform_db::process::find_by_id(&pool, process_id).await? else {
                    anyhow::bail!("no process instance {process_id}");
                };
                println!("{}", serde_json::to_string_pretty(&instance)?);

                let log = platform_db::process::log(&pool, process_id, log_limit).await?;
                println!("--- log ({} entries) ---", log.len());
                for entry in log {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
        },
    }

    Ok(())
}

async fn connect() -> Result<sqlx::PgPool> {
    let loaded = match std::env::var("PLATFORM_CONFIG_FILES") {
        Ok(paths) if !paths.trim().is_empty() => {
            let paths: Vec<&str> = paths.split(':').collect();
            platform_config::load_layered_yaml(&paths)?
        }
        _ => platform_config::load_layered_yaml_from_strings(&["{}"])?,
    };
    let secrets = platform_config::secrets::resolve_secrets(&loaded.config_json)?;
    platform_db::connect(&secrets.database_url).await
}
