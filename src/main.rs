use anyhow::Context;
use tracing::info;

use devicelife::bootstrap::{self, Daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = bootstrap::config_path(std::env::var("DEVICELIFE_CONFIG").ok(), std::env::args());
    let config = bootstrap::load_config(&path).await?;

    bootstrap::tracing::init_tracing_subscriber(config.log_dir.as_deref())
        .context("initialize tracing")?;
    info!(config = %path.display(), "starting device lifecycle daemon");

    let daemon = Daemon::build(&config).await?;
    daemon.run().await
}
