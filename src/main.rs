use anyhow::Result;
use tracing_subscriber::EnvFilter;

use docqa::{run_server, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let state = AppState::from_config(config).await?;

    run_server(state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
