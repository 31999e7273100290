use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod core;
mod db;
mod error;
mod routes;
mod scheduler;
mod services;

use crate::core::orchestrator::{Orchestrator, RunHandles, TokioSleep};
use config::Config;
use scheduler::Scheduler;
use services::{calendar::CalendarService, devops::DevOpsService, init};

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub scheduler: Scheduler,
    pub run_handles: RunHandles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "time_reconciler=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Time Reconciler Service");
    if config.apply.dry_run {
        tracing::warn!("Dry-run mode is on: no external writes will be performed");
    }

    // Initialize database
    let pool = init::init_db(&config).await?;

    // External collaborators
    let calendar = Arc::new(CalendarService::new(&config.graph)?);
    let devops = Arc::new(DevOpsService::new(&config.devops)?);

    // Orchestrator and scheduler
    let run_handles = RunHandles::new();
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        pool.clone(),
        calendar,
        devops,
        Arc::new(TokioSleep),
        run_handles.clone(),
    )?);
    let scheduler = Scheduler::new(&config.scheduler, orchestrator)?;

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        scheduler: scheduler.clone(),
        run_handles,
    });

    // Create shutdown notifier for background workers
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(&scheduler, shutdown_tx.clone());

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/runs", routes::runs::router())
        .nest("/api/schedule", routes::runs::schedule_router())
        .nest("/api/entries", routes::entries::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(listener, app);

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to bind SIGTERM");
            tokio::select! {
                _ = ctrl_c => {},
                _ = term.recv() => {},
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("Failed to bind Ctrl+C");
        }

        tracing::info!("Shutdown signal received, notifying background workers");
        let _ = shutdown_tx_clone.send(());
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Give background workers some time to finish their work. An active run
    // is cancelled cooperatively between apply steps and can resume from its
    // checkpoint on the next start.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for handle in bg_handles {
            let _ = handle.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
