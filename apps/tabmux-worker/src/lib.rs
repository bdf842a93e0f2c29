#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tabmux::coordinator::{Backends, Coordinator};
use tabmux::crypto::LocalCryptoEngine;
use tabmux::storage::backend;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::WorkerConfig;
use crate::server::build_router;

pub mod config;
pub mod server;

pub async fn build_backends(data_dir: Option<&Path>) -> Result<Backends> {
    let Some(data_dir) = data_dir else {
        return Ok(Backends::memory());
    };
    let open = |name: &str| backend::file(data_dir.join(name));
    Ok(Backends {
        durable: open("durable.json")
            .await
            .context("failed to open durable store")?,
        session: backend::memory(),
        common: open("common.json")
            .await
            .context("failed to open common store")?,
        hls_cache: open("hls-cache.json")
            .await
            .context("failed to open hls cache")?,
    })
}

pub async fn build_coordinator(config: &WorkerConfig) -> Result<Arc<Coordinator>> {
    let backends = build_backends(config.data_dir.as_deref()).await?;
    let coordinator = Coordinator::new(
        config.coordinator.clone(),
        backends,
        LocalCryptoEngine::shared(),
    )?;
    coordinator.start().await?;
    Ok(coordinator)
}

pub async fn serve(config: WorkerConfig) -> Result<()> {
    let coordinator = build_coordinator(&config).await?;
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        bind_addr = %config.bind_addr,
        persistent = config.data_dir.is_some(),
        "tabmux worker listening"
    );

    let signal = coordinator.shutdown_signal();
    axum::serve(listener, build_router(Arc::clone(&coordinator)))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                () = wait_for_terminate(signal) => info!("terminate requested by a tab"),
            }
        })
        .await?;

    coordinator.shutdown();
    Ok(())
}

async fn wait_for_terminate(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabmux::storage::KeyValueStore;

    #[tokio::test]
    async fn data_dir_backends_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let backends = build_backends(Some(dir.path())).await?;
            backends.durable.set("a1/state/theme", json!("night")).await?;
            backends.session.set("draft", json!("hello")).await?;
        }

        let reopened = build_backends(Some(dir.path())).await?;
        assert_eq!(
            reopened.durable.get("a1/state/theme").await?,
            Some(json!("night"))
        );
        assert_eq!(reopened.session.get("draft").await?, None);
        Ok(())
    }
}
