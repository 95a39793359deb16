mod cli;

use axum::Router;
use clap::Parser;
use server::config::Config;
use server::queue::{Broker, MemoryBroker};
use server::store::{ChatStore, LocalChatStore, PgChatStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    let cli = cli::Cli::parse();
    let config = Arc::new(Config::from_env()?);

    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(url) => {
            let store = PgChatStore::connect(url).await?;
            tracing::info!("using postgres storage");
            Arc::new(store)
        }
        None => {
            tracing::info!("no DATABASE_URL set, using in-memory storage");
            Arc::new(LocalChatStore::new())
        }
    };
    if config.broker_url != "memory:" {
        tracing::warn!(
            "broker url {} has no backing implementation, using the in-memory broker",
            config.broker_url
        );
    }
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

    for seed in &config.seed_worker_api_keys {
        let worker = store.create_worker(&seed.api_key, &seed.name).await?;
        if seed.trusted && !worker.trusted {
            store.set_worker_trusted(worker.id, true).await?;
        }
        tracing::info!(
            "seeded worker {} ({}, trusted={})",
            worker.id,
            seed.name,
            seed.trusted
        );
    }

    let state = server::AppState::new(store, broker, config);
    let router = server::init(Router::new(), state);

    let addr = format!("{}:{}", cli.host, cli.port);
    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
