// ZipCase server binary
// Wires the stores, portal client, workers and HTTP API together

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zipcase::api::{build_router, AppState};
use zipcase::config::AppConfig;
use zipcase::providers::portal::PortalClient;
use zipcase::services::alerts::Alerter;
use zipcase::services::case_search::CaseSearchService;
use zipcase::services::case_store::CaseStore;
use zipcase::services::credential_store::CredentialStore;
use zipcase::services::database::Database;
use zipcase::services::export::ExportService;
use zipcase::services::name_search::NameSearchService;
use zipcase::services::name_search_store::NameSearchStore;
use zipcase::services::queue::JobQueue;
use zipcase::services::session::SessionManager;
use zipcase::services::status::StatusService;
use zipcase::services::workers::{spawn_workers, WorkerContext};
use zipcase::utils::crypto::SecretBox;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zipcase=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ZipCase server");

    let config = AppConfig::from_env()?;

    let database = Database::connect(
        &config.database_url,
        Duration::from_secs(config.server.store_timeout_seconds),
    )
    .await?;
    let pool = database.pool().clone();

    let secrets = SecretBox::from_base64_key(&config.encryption_key)
        .context("ENCRYPTION_KEY is not a valid AES-256 key")?;

    let cases = Arc::new(CaseStore::new(pool.clone()));
    let searches = Arc::new(NameSearchStore::new(pool.clone()));
    let credentials = Arc::new(CredentialStore::new(pool.clone(), secrets));
    let queue = Arc::new(JobQueue::new(
        pool.clone(),
        config.queues.visibility_timeout_seconds,
        config.queues.max_attempts,
    ));

    let portal = Arc::new(PortalClient::new(&config.portal)?);
    let sessions = Arc::new(SessionManager::new(credentials.clone(), portal.clone()));
    let alerter = Arc::new(Alerter::new(config.alert_topic_url.clone()));

    let status = Arc::new(StatusService::new(
        cases.clone(),
        queue.clone(),
        alerter.clone(),
        config.queues.search_queue.clone(),
    ));
    let case_search = Arc::new(CaseSearchService::new(
        cases.clone(),
        queue.clone(),
        status.clone(),
        config.queues.search_queue.clone(),
        config.server.refresh_window_seconds,
        config.processing_stale_seconds(),
    ));
    let name_search = Arc::new(NameSearchService::new(
        searches.clone(),
        sessions.clone(),
        queue.clone(),
        status.clone(),
        config.queues.search_queue.clone(),
    ));
    let export = Arc::new(ExportService::new(cases.clone()));

    // Opportunistic cleanup of expired name searches at startup.
    if let Err(e) = searches.purge_expired().await {
        warn!("Failed to purge expired name searches: {}", e);
    }

    // Spawn the queue consumers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_ctx = Arc::new(WorkerContext {
        cases: cases.clone(),
        searches: searches.clone(),
        queue: queue.clone(),
        sessions: sessions.clone(),
        portal: portal.clone(),
        alerter: alerter.clone(),
        case_search: case_search.clone(),
        search_queue: config.queues.search_queue.clone(),
        case_data_queue: config.queues.case_data_queue.clone(),
    });
    let worker_handles = spawn_workers(worker_ctx, &config.queues, shutdown_rx);
    info!(
        "Workers online ({} concurrent per queue)",
        config.queues.worker_concurrency
    );

    // Serve the API.
    let state = Arc::new(AppState {
        case_search,
        name_search,
        status,
        export,
        credentials,
        jwt_secret: config.jwt_secret.clone(),
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!("API listening on {}", config.server.bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    // Drain the workers.
    warn!("Shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(10), async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    })
    .await
    .is_err()
    {
        error!("Workers did not stop within the drain window");
    }

    info!("ZipCase server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Signal listener error: {}", e);
    }
}
