use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "mps")]
#[command(about = "Marketplace posting sync CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base first)
    #[arg(long = "config", global = true, default_value = "config/base.yaml")]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local overrides)
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail instead of warn when the merged config has unread keys
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Incremental / full sync
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },

    /// Webhook inbox maintenance
    Webhook {
        #[command(subcommand)]
        cmd: WebhookCmd,
    },

    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply embedded SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum SyncCmd {
    /// Run one sync in the foreground and print its report.
    Run {
        #[arg(long)]
        tenant: String,

        /// posting_fbs | posting_fbo
        #[arg(long)]
        entity: String,

        /// Ignore the stored cursor and re-pull the full window
        #[arg(long, default_value_t = false)]
        full: bool,
    },

    /// Print stored checkpoints
    Checkpoints {
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand)]
enum WebhookCmd {
    /// Re-run a stored webhook event
    Retry {
        #[arg(long)]
        id: String,
    },

    /// Re-run events stuck in `processing`
    RecoverStale {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Claim and deliver one batch of due events
    DispatchOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = mps_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = mps_db::status(&pool).await?;
                    println!("db_ok={} has_postings_table={}", s.ok, s.has_postings_table);
                }
                DbCmd::Migrate => {
                    mps_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths, strict } => {
            commands::config_hash(&paths, strict)?;
        }

        Commands::Sync { cmd } => match cmd {
            SyncCmd::Run {
                tenant,
                entity,
                full,
            } => {
                let entity_type = commands::parse_entity(&entity)?;
                commands::sync::run(&cli.config_paths, &tenant, entity_type, full).await?;
            }
            SyncCmd::Checkpoints { tenant } => {
                commands::sync::checkpoints(&cli.config_paths, tenant.as_deref()).await?;
            }
        },

        Commands::Webhook { cmd } => match cmd {
            WebhookCmd::Retry { id } => {
                let id = Uuid::parse_str(&id).context("invalid webhook id uuid")?;
                commands::webhook::retry(&cli.config_paths, id).await?;
            }
            WebhookCmd::RecoverStale { limit } => {
                commands::webhook::recover_stale(&cli.config_paths, limit).await?;
            }
        },

        Commands::Outbox { cmd } => match cmd {
            OutboxCmd::DispatchOnce => {
                commands::outbox::dispatch_once(&cli.config_paths).await?;
            }
        },
    }

    Ok(())
}

/// Logs go to stderr so stdout stays `key=value` parseable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
