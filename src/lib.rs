//! Referral income engine for the coaching platform.
//!
//! Users recruit users into a tree. Each captured payment is split across the
//! payer's ancestors according to a layer-indexed commission table, and the
//! resulting income ledger feeds per-user dashboard rollups.

pub mod aggregate;
mod api;
pub mod commission;
pub mod config;
pub mod distribution;
pub mod error;
pub mod hierarchy;
pub mod ledger;
pub mod payments;
pub mod responses;
pub mod store;
pub mod types;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
pub use error::IncomeError;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

/// Initializes the database pool.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}
