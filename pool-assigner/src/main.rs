//! Assign this replica an exclusive worker instance per pool type, backed by leases in Redis.
use std::sync::Arc;

use common_redis::RedisClient;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use pool_assigner::config::Config;
use pool_assigner::controller::AssignmentController;
use pool_assigner::handlers::{app, AppState};
use pool_assigner::health_check::HealthChecker;
use pool_assigner::lease::LeaseStore;
use pool_assigner::metrics::setup_metrics_recorder;
use pool_assigner::registry::InstanceRegistry;
use pool_assigner::status::PoolStatusReporter;

async fn shutdown(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer().with_target(true).with_level(true);

    let log_layer = if debug {
        base_layer.with_ansi(true).with_filter(filter).boxed()
    } else {
        base_layer.json().with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    init_tracing(*config.debug);

    let assigner = config.assigner_config()?;
    let recorder_handle = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    info!(
        holder_id = %assigner.holder_id,
        namespace = %assigner.namespace,
        "starting pool assigner"
    );

    let redis = RedisClient::with_config(
        config.redis_url.clone(),
        Some(config.redis_response_timeout_ms.0),
        Some(config.redis_connection_timeout_ms.0),
    )
    .await
    .wrap_err("failed to connect to redis")?;

    let registry = Arc::new(InstanceRegistry::new(assigner.instances.clone()));
    let leases = LeaseStore::new(Arc::new(redis), &assigner.namespace);

    let health_checker = HealthChecker::new(registry.clone(), assigner.health_check.clone())
        .wrap_err("failed to build health check client")?;
    // Give the first acquire real health data
    health_checker.check_all().await;

    let controller = Arc::new(AssignmentController::new(
        registry.clone(),
        leases.clone(),
        assigner.controller_config(),
    ));
    let reporter = Arc::new(PoolStatusReporter::new(
        registry,
        leases,
        controller.clone(),
    ));

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("could not bind {bind}"))?;
    info!(%bind, "listening");

    let term = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let interrupt =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
    let cancel = CancellationToken::new();

    let health_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { health_checker.run(cancel).await }
    });
    let controller_task = tokio::spawn(controller.clone().run(cancel.clone()));

    let router = app(
        AppState {
            controller,
            reporter,
        },
        Some(recorder_handle),
    );

    let server_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let shutdown_signal = cancel.clone();
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
                .await;
            // A server that stops on its own takes the rest of the process down with it
            cancel.cancel();
            served
        }
    });

    tokio::select! {
        _ = shutdown(term, interrupt) => {},
        _ = cancel.cancelled() => {},
    };
    cancel.cancel();

    controller_task
        .await
        .wrap_err("assignment controller panicked")?;
    health_task.await.wrap_err("health checker panicked")?;

    server_task
        .await
        .wrap_err("http server panicked")?
        .wrap_err("http server failed")?;
    info!("pool assigner stopped");

    Ok(())
}
