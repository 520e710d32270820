use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use burrow_controller::config::Config;
use burrow_controller::keys::JwtKeys;
use burrow_controller::server;
use burrow_controller::state::AppState;
use burrow_controller::store::{pg, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&config.app.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let keys = JwtKeys::ensure(&config.app.auth_dir()).context("failed to provision keypair")?;

    let database = config
        .database
        .clone()
        .context("database configuration is required")?;
    let pool = pg::connect(&database)
        .await
        .context("failed to connect to database")?;
    let store = PgStore::new(pool);
    store.migrate().await.context("failed to run migrations")?;

    let state = AppState::new(config, Arc::new(store), keys).await;
    server::serve(state).await?;

    Ok(())
}
