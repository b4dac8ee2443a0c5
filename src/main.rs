use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use backup_orchestrator::api::{self, AppState};
use backup_orchestrator::engine::BorgEngine;
use backup_orchestrator::events::{BroadcastEmitter, EventEmitter};
use backup_orchestrator::locks::LockRegistry;
use backup_orchestrator::runner::OperationRunner;
use backup_orchestrator::schedule::{self, ScheduleService, Scheduler};
use backup_orchestrator::state::RepositoryStateManager;
use backup_orchestrator::storage::{SqliteStore, Store};
use backup_orchestrator::utils::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let config = Config::load()?;
    info!("Starting backup orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(borg = %config.borg_binary, lock_wait = ?config.lock_wait, "Backup engine configured");

    // Storage
    let sqlite = SqliteStore::new(&config.database_url).await?;
    sqlite.run_migrations().await?;
    let store: Arc<dyn Store> = Arc::new(sqlite);

    // Core
    let events = BroadcastEmitter::new(config.event_channel_capacity);
    let emitter: Arc<dyn EventEmitter> = Arc::new(events.clone());
    let repo_state = Arc::new(RepositoryStateManager::new(config.history_capacity, emitter.clone()));
    let engine = Arc::new(BorgEngine::new(config.borg_binary.clone(), config.lock_wait));
    let runner = OperationRunner::new(
        repo_state,
        Arc::new(LockRegistry::new()),
        engine,
        store.clone(),
        emitter.clone(),
        config.progress_queue_capacity,
    );

    // Scheduling
    let (signal, changes) = schedule::channel();
    let scheduler = Scheduler::new(store.clone(), Arc::new(runner.clone()));
    let scheduler_task = scheduler.start(changes);
    let schedules = ScheduleService::new(store.clone(), signal, emitter);

    let app = api::app(AppState {
        runner: runner.clone(),
        schedules,
        scheduler: scheduler.clone(),
        store,
        events,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop arming new work first, then cancel what is running
    scheduler.shutdown();
    runner.shutdown();
    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
