mod api;
mod broker;
mod config;
mod http;
mod manager;
mod marketplace;
mod media;
mod metrics;
mod models;
mod picture_cache;
mod publisher;
mod storage;

use config::AppConfig;
use eyre::WrapErr;
use manager::Manager;
use marketplace::VkClient;
use media::HttpPictureFetcher;
use metrics_exporter_prometheus::PrometheusBuilder;
use models::Platform;
use picture_cache::PictureCache;
use std::{sync::Arc, time::Duration};
use storage::Storage;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "relay.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let storage = Storage::open(&config.db_path)
        .await
        .wrap_err_with(|| format!("failed to open database at {}", config.db_path))?;

    let http = http::build_client(config.http_settings())
        .wrap_err("failed to build http client")?;
    let fetcher = Arc::new(HttpPictureFetcher::new(http.clone()));

    let cache = config
        .picture_cache_dir
        .as_ref()
        .map(|dir| PictureCache::new(dir.clone(), fetcher.clone()));
    let mut manager = Manager::new(storage.clone(), fetcher.clone(), config.worker_settings());
    if let Some(cache) = &cache {
        manager = manager.with_picture_cache(cache.clone());
    }
    match &config.vk {
        Some(vk) => {
            let client = VkClient::new(http.clone(), vk.token.clone(), vk.group_id, vk.api_version.clone());
            match client.account_name().await {
                Ok(name) => info!(target = "relay.vk", account = %name, group_id = client.group_id(), "vk authorized"),
                Err(err) => warn!(target = "relay.vk", error = %err, "vk account lookup failed"),
            }
            manager.register(Platform::Vk, Arc::new(client));
        }
        None => warn!(target = "relay.vk", "VK_TOKEN or VK_GROUP_ID not set; vk publishing disabled"),
    }
    let (broker, running) = manager.start();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let pinger = tokio::spawn(ping_loop(storage.clone(), config.db_ping_interval, stop_tx));

    let app = api::router(
        api::AppState {
            broker,
            storage: storage.clone(),
            cache,
            prometheus,
            metrics_key: config.metrics_key.clone(),
        },
        config.request_max_bytes,
    );

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(target = "relay.api", "listening on {addr}");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(stop_rx))
        .await?;

    // The router owned the last Broker clone, so the publisher queues are closed now.
    pinger.abort();
    if !running.shutdown(config.shutdown_grace).await {
        warn!(target = "relay.api", "exiting with unfinished publications");
    }
    storage.close().await;
    info!(target = "relay.api", "shutdown complete");
    Ok(())
}

async fn ping_loop(storage: Storage, interval: Duration, stop: watch::Sender<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = storage.ping().await {
            error!(target = "relay.storage", error = %err, "database ping failed; shutting down");
            let _ = stop.send(true);
            return;
        }
    }
}

async fn shutdown_signal(mut db_failed: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "relay.api", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "relay.api", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let storage_down = async {
        let signalled = db_failed.wait_for(|failed| *failed).await.is_ok();
        if !signalled {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!(target = "relay.api", "ctrl-c received"),
        _ = terminate => info!(target = "relay.api", "SIGTERM received"),
        _ = storage_down => warn!(target = "relay.api", "storage unavailable"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
