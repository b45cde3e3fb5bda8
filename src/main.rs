use anyhow::Context;

use pario::config::Config;
use pario::server::{run, AppState};
use pario::util::init_tracing;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => {
            tracing::warn!("no config file given, using defaults (no providers configured)");
            Config::default()
        }
    };

    let state = AppState::from_config(config)
        .await
        .context("initializing stores")?;

    run(state).await.context("running proxy server")
}
