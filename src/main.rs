use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use nexus_webhook_agent::agent::ProcessAgent;
use nexus_webhook_agent::config::Config;
use nexus_webhook_agent::http_server::{self, AppState};
use nexus_webhook_agent::pipeline::Pipeline;
use nexus_webhook_agent::store::{RecordStore, SqliteStore};
use nexus_webhook_agent::templates::TemplateStore;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let config = Config::parse();

    let store = match SqliteStore::open(&config.database) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(path = %config.database.display(), "failed to open database: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %config.database.display(), "database ready");

    let templates = TemplateStore::new(config.prompts_dir.clone());
    tracing::info!(root = %templates.root().display(), "template root");
    if config.secret.is_empty() {
        tracing::warn!("no webhook secret configured, accepting unsigned deliveries");
    }

    let agent = Arc::new(ProcessAgent::new(config.agent_timeout()));
    let pipeline = Arc::new(Pipeline::new(
        config.pipeline(),
        store.clone(),
        templates,
        agent,
    ));

    if let Err(e) = http_server::serve(config.listen_addr(), AppState::new(pipeline)).await {
        tracing::error!(addr = %config.listen_addr(), "server failed: {e}");
        let _ = store.close().await;
        std::process::exit(1);
    }

    if let Err(e) = store.close().await {
        tracing::warn!("failed to close database cleanly: {e}");
    }
    tracing::info!("stopped");
}
