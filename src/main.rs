use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::anchor::{
    AnchorSink, AnchoringWorker, DatabaseLease, HttpAnchorSink, IntervalScheduler, LeaderLease, LocalLease,
};
use audit_ledger::api::{self, AppState, TokenService};
use audit_ledger::audit::{EventRecorder, VerificationService};
use audit_ledger::config::AppConfig;
use audit_ledger::database::{Database, LedgerStore};

const ANCHORING_LEASE: &str = "root-anchoring";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit ledger");

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let database = Database::with_max_connections(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    database.run_migrations().await.context("Failed to run migrations")?;
    info!("Database migrations completed");

    let store: Arc<dyn LedgerStore> = Arc::new(database.clone());

    let sink: Option<Arc<dyn AnchorSink>> = match (config.sink.enabled, &config.sink.url) {
        (true, Some(url)) => {
            info!("External anchor sink enabled at {}", url);
            Some(Arc::new(HttpAnchorSink::new(url.clone(), config.sink.timeout())?))
        }
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Root anchoring task
    let worker_handle = if config.anchoring.enabled {
        let lease: Arc<dyn LeaderLease> = if config.anchoring.use_database_lease {
            let holder = config
                .anchoring
                .instance_id
                .clone()
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
            let lease = DatabaseLease::new(database.clone(), ANCHORING_LEASE, holder, config.anchoring.lease_ttl());
            info!("Anchoring lease holder: {}", lease.holder());
            Arc::new(lease)
        } else {
            Arc::new(LocalLease)
        };

        let mut worker = AnchoringWorker::new(store.clone(), lease, config.worker_config());
        if let Some(sink) = &sink {
            worker = worker.with_sink(sink.clone());
        }

        let scheduler = IntervalScheduler::new(config.anchoring.interval());
        let shutdown = shutdown_rx.clone();
        info!("Root anchoring worker started (every {}s)", config.anchoring.interval_secs);
        Some(tokio::spawn(async move { worker.run(scheduler, shutdown).await }))
    } else {
        warn!("Root anchoring disabled");
        None
    };

    let state = AppState {
        store: store.clone(),
        recorder: EventRecorder::new(store.clone(), config.recorder.recorder_config()),
        verifier: VerificationService::new(store),
        tokens: Arc::new(TokenService::new(&config.auth.jwt_secret, config.auth.token_ttl_secs)),
        sink,
        verification_timeout: config.verification.timeout(),
    };
    let app = api::router(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            warn!("Anchoring worker ended abnormally: {}", e);
        }
    }
    database.close().await;

    Ok(())
}
