//! mps-db
//!
//! Persistence for checkpoints, sync runs, the webhook inbox, the posting
//! aggregate and the transactional outbox.
//!
//! Callers program against the [`Store`] / [`StoreTx`] traits; [`PgStore`] is
//! the production implementation. An in-memory implementation for tests lives
//! in `mps-testkit`.

mod pg;
mod store;

pub use pg::{PgStore, PgTx};
pub use sqlx::PgPool;
pub use store::{OutboxFilter, RunFilter, Stats, Store, StoreTx, WebhookFilter};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

pub const ENV_DB_URL: &str = "MPS_DATABASE_URL";

/// Connect to Postgres.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using MPS_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'postings'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_postings_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_postings_table: bool,
}
