use anyhow::Context;
use awsl_pic_pipeline::config::Config;
use awsl_pic_pipeline::db::create_pool;
use awsl_pic_pipeline::services::MigrationRunner;
use awsl_pic_pipeline::storage::StorageClient;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "awsl_pic_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting awsl-pic-pipeline migration...");
    tracing::info!("Connecting to database...");

    let pool = create_pool(&config.db_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection established");

    let storage = StorageClient::new(&config).context("Failed to create storage client")?;
    let runner = MigrationRunner::new(pool, storage, &config);
    runner.run().await.context("Migration failed")?;

    Ok(())
}
