use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use conveyor_api::app::{AppState, PublishDefaults, build_app};
use conveyor_api::config::AppConfig;
use conveyor_api::middleware::StaticSessions;
use conveyor_api::registry::{BrokerManager, BrokerRegistry, BrokerServices};
use conveyor_events::{MessageHandler, ProducerConfig};
use conveyor_infra::background::{
    BackgroundQueue, BackgroundService, CallbackRegistry, InMemoryJobTracker, JobTracker, QueueConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conveyor_observability::init();
    let config = AppConfig::from_env();

    let registry = BrokerRegistry::new();
    let mut services = BrokerServices::new();
    for name in &config.broker_backends {
        let backend = registry
            .build(name)
            .with_context(|| format!("building broker backend '{name}'"))?;
        let manager = services.insert(BrokerManager::new(name.clone(), backend, ProducerConfig::from_env()));
        manager
            .start()
            .await
            .with_context(|| format!("starting broker service '{name}'"))?;

        for options in &config.subscriptions {
            manager.subscribe(options.clone(), logging_handler()).await?;
        }
    }
    let brokers = Arc::new(services);

    let queue_config = QueueConfig::from_env();
    let hook = CallbackRegistry::new().resolve_or_default(&queue_config.callback);
    let queue = Arc::new(BackgroundQueue::with_hook(queue_config, hook));
    queue.start();
    let jobs = BackgroundService::new(queue.clone(), build_tracker(&config.job_tracker)?);

    let sessions = StaticSessions::from_env();
    if sessions.is_empty() {
        warn!("SESSION_TOKENS not set; every protected request will be rejected");
    }

    let app = build_app(AppState {
        brokers: brokers.clone(),
        jobs,
        sessions: Arc::new(sessions),
        defaults: PublishDefaults {
            destination: config.default_destination.clone(),
            max_retries: config.default_max_retries,
        },
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, services = ?brokers.names(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    brokers.stop_all().await;
    queue.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn logging_handler() -> MessageHandler {
    MessageHandler::sync(|message| {
        info!(
            message_id = %message.id,
            destination = %message.destination,
            routing_key = %message.routing_key,
            retry_count = message.retry_count,
            "message received"
        );
        Ok(())
    })
}

fn build_tracker(kind: &str) -> anyhow::Result<Arc<dyn JobTracker>> {
    match kind {
        "memory" => Ok(Arc::new(InMemoryJobTracker::new())),
        #[cfg(feature = "redis")]
        "redis" => {
            let url = conveyor_infra::broker::RedisConfig::from_env().url;
            Ok(Arc::new(conveyor_infra::background::RedisJobTracker::new(&url)?))
        }
        other => anyhow::bail!("unknown job tracker '{other}'"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
