//! Task server HTTP binary.
//!
//! Connects the cache, broker and database, starts the event workers, the
//! retry relay and the eviction schedule, then serves the API until Ctrl+C
//! or SIGTERM.

use anyhow::Context;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::broker::Broker;
use steadfast_postgres::PostgresLedger;
use steadfast_redis::RedisCache;
use steadfast_redpanda::RedpandaBroker;
use steadfast_runtime::metrics::MetricsServer;
use steadfast_runtime::{
    CacheGateway, EventProducer, EventWorker, EvictionJob, IdempotencyGate, WorkerPool,
};
use steadfast_server::notifications::NotificationHandler;
use steadfast_server::tasks::{PostgresTaskRepository, TaskService, task_schema};
use steadfast_server::{AppState, Config, build_router};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
#[allow(clippy::too_many_lines)] // Composition root: linear wiring of every component
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "steadfast=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting task server");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        main_queue = %config.redpanda.main_queue,
        worker_concurrency = config.worker.concurrency,
        "Configuration loaded"
    );

    // Metrics recorder
    let metrics_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.metrics_port)
        .parse()
        .context("Invalid metrics address")?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;

    // Ledger and application tables
    info!("Connecting to PostgreSQL...");
    let ledger = Arc::new(
        PostgresLedger::connect(&config.postgres.url, config.postgres.max_connections).await?,
    );
    ledger.migrate().await?;
    steadfast_server::migrate(ledger.pool())
        .await
        .context("Application migrations failed")?;
    info!("Database ready");

    // Idempotency cache
    info!("Connecting to Redis...");
    let cache = RedisCache::connect(&config.redis.url)
        .await?
        .with_operation_timeout(Duration::from_millis(config.redis.operation_timeout_ms));
    let gate = IdempotencyGate::new(
        CacheGateway::new(Arc::new(cache)),
        config.idempotency.gate_config(),
    );
    info!("Redis connected");

    // Broker topology
    info!("Connecting to Redpanda...");
    let broker = Arc::new(
        RedpandaBroker::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .build()?,
    );
    let topology = config.redpanda.topology();
    broker.declare_topology(&topology).await?;
    let relay = broker.spawn_retry_relay()?;
    info!(
        main = %topology.main,
        retry = %topology.retry,
        dead_letter = %topology.dead_letter,
        "Queue topology declared"
    );

    // Producer and task service
    let schema = Arc::new(task_schema());
    let producer = EventProducer::new(
        broker.clone(),
        schema.clone(),
        topology.main.clone(),
        config.server.service_name.clone(),
    );
    let tasks = TaskService::new(
        Arc::new(PostgresTaskRepository::new(ledger.pool().clone())),
        producer,
    );

    // Background work
    let (shutdown_tx, _) = broadcast::channel(1);

    let worker = Arc::new(
        EventWorker::new(
            broker.clone(),
            ledger.clone(),
            topology,
            NotificationHandler::new(ledger.pool().clone()).registry(),
        )
        .with_schema(schema)
        .with_reconnect_delay(Duration::from_secs(config.worker.reconnect_delay_secs)),
    );
    let worker_handles = WorkerPool::new(worker, config.worker.concurrency).spawn(&shutdown_tx);
    info!(slots = worker_handles.len(), "Event workers started");

    let eviction = EvictionJob::new(ledger.clone(), config.eviction.job_config()?)
        .spawn(shutdown_tx.subscribe());

    match metrics.handle().cloned() {
        Some(handle) => {
            tokio::spawn(serve_metrics(metrics_addr, handle));
        }
        None => warn!("Metrics recorder not owned by this process; /metrics disabled"),
    }

    // HTTP server
    let app = build_router(AppState { gate, tasks }, &config.server);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop background work, then the broker
    info!("HTTP server stopped, draining workers");
    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(
        Duration::from_secs(config.server.shutdown_timeout_secs),
        async {
            for handle in worker_handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task failed");
                }
            }
            if let Err(e) = eviction.await {
                error!(error = %e, "Eviction task failed");
            }
        },
    )
    .await;
    if drained.is_err() {
        warn!("Workers did not stop within the shutdown timeout");
    }

    broker.close().await?;
    if let Err(e) = relay.await {
        error!(error = %e, "Retry relay failed");
    }

    info!("Server stopped");
    Ok(())
}

/// Serve Prometheus metrics on their own port.
async fn serve_metrics(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics endpoint");
            return;
        }
    };
    info!(%addr, "Metrics endpoint listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics endpoint failed");
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
