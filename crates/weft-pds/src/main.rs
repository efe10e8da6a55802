use std::sync::Arc;

use miette::{miette, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;
use weft_pds::{xrpc, AllowAll, MemoryContentSource, Pds, PdsConfig, RelayPoller};
use weft_repo::FsStateStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PdsConfig::from_env().map_err(|e| miette!("{e}"))?;
    tracing::info!(
        origin = %config.origin,
        handle = %config.handle,
        listen = %config.listen,
        "starting weft pds"
    );

    let store = FsStateStore::open(&config.data_dir).await.into_diagnostic()?;

    // Embedders replace this with their application's content source; the
    // standalone binary runs with the in-memory one.
    let content = Arc::new(MemoryContentSource::new());

    let pds = Pds::open(config.clone(), store.clone(), content, Arc::new(AllowAll))
        .await
        .into_diagnostic()?;

    let poller = RelayPoller::new(
        store,
        pds.dispatcher.clone(),
        config.poll_interval,
        config.poll_workers,
        config.request_timeout,
    )
    .into_diagnostic()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    let app = xrpc::router(pds.clone());
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .into_diagnostic()?;
    tracing::info!(did = %pds.did, "serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .into_diagnostic()?;

    let _ = shutdown_tx.send(true);
    let _ = poller_task.await;
    Ok(())
}
