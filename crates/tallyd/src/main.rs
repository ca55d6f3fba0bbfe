use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tally_core::Gallery;
use tally_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dedup;
mod http;
mod pipeline;
mod provider;
mod session;

use config::Config;
use dedup::Deduplicator;
use provider::{EmbeddingProvider, HttpEmbeddingProvider};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        provider = %config.provider_url,
        threshold = config.similarity_threshold,
        cooldown_secs = config.cooldown_secs,
        "tallyd starting"
    );

    let store = Store::open(&config.db_path).await?;

    let gallery = Arc::new(Gallery::new(config.embedding_dim));
    for identity in store.list_identities().await? {
        let id = identity.id.clone();
        if let Err(e) = gallery.upsert(identity) {
            tracing::warn!(user_id = %id, error = %e, "skipping stored identity");
        }
    }
    tracing::info!(identities = gallery.len(), "gallery loaded");

    let seed = store.last_accepted().await?;
    tracing::info!(keys = seed.len(), "cooldown cache seeded from attendance log");
    let dedup = Arc::new(Deduplicator::new(
        store.clone(),
        Duration::from_secs(config.cooldown_secs),
        seed,
    ));

    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
        config.provider_url.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    )?);

    let state = http::AppState {
        gallery,
        store,
        provider,
        dedup,
        threshold: config.similarity_threshold,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on http://{}", config.bind_addr);
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("tallyd shutting down");
        })
        .await?;

    Ok(())
}
