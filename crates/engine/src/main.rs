//! Recommdo worker - import and analysis job runner
//!
//! Port: 8090 (health only)

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::Context;
use recommdo_core::{
    init_logging, load_dotenv, ConfigLoader, DatabaseConfig, DatabasePool, LogConfig,
    PipelineConfig, PostgresStore, RedisConfig, ServiceConfig, Store,
};
use recommdo_engine::{JobQueue, JobWorker, Pipeline, RedisJobQueue, WorkerConfig};
use tokio::sync::watch;
use tracing::{error, info};

/// Application state
struct AppState {
    db: DatabasePool,
    queue: Arc<RedisJobQueue>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let service = ServiceConfig::from_env().context("Failed to load service config")?;
    service.validate()?;
    init_logging(&LogConfig::from_env(&service.log_level))?;

    let db_config = DatabaseConfig::from_env().context("Failed to load database config")?;
    db_config.validate()?;
    let redis_config = RedisConfig::from_env().context("Failed to load Redis config")?;
    redis_config.validate()?;
    let pipeline_config = PipelineConfig::from_env().context("Failed to load pipeline config")?;
    pipeline_config.validate()?;

    info!(
        worker = %service.worker_name,
        port = service.port,
        "Starting recommdo worker"
    );

    let db = DatabasePool::new(&db_config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to apply migrations")?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(db.pool().clone()));
    let queue = Arc::new(
        RedisJobQueue::connect(&redis_config)
            .await
            .context("Failed to connect to Redis")?,
    );

    let pipeline = Arc::new(Pipeline::new(store, &pipeline_config));
    let worker = JobWorker::new(
        queue.clone(),
        pipeline,
        WorkerConfig::new(service.worker_name.clone(), &pipeline_config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let state = web::Data::new(AppState {
        db: db.clone(),
        queue,
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
    })
    .bind((service.host.as_str(), service.port))?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, finishing current job");

    // The worker may already be gone if its task panicked
    let _ = shutdown_tx.send(true);
    server_handle.stop(true).await;

    if let Err(e) = worker_task.await {
        error!(error = %e, "Worker task failed");
    }
    server_task.await??;

    db.close().await;
    info!("Recommdo worker stopped");
    Ok(())
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let db_healthy = state.db.is_healthy().await;
    let pool = state.db.stats();
    let queue = state.queue.stats().await;

    let body = serde_json::json!({
        "status": if db_healthy && queue.is_ok() { "healthy" } else { "degraded" },
        "service": "recommdo-worker",
        "version": env!("CARGO_PKG_VERSION"),
        "database": {
            "connected": db_healthy,
            "pool_size": pool.size,
            "idle": pool.idle,
        },
        "queue": match &queue {
            Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        },
    });

    if db_healthy && queue.is_ok() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}
