use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use coaching_income::{AppState, config::Config, init_pool, init_router, store::PgStore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let pool = init_pool(&config).await?;
    let store = PgStore::new(pool, config.max_tree_depth);
    store.migrate().await?;

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;

    let app = init_router(AppState {
        store: Arc::new(store),
        config,
    });

    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
