use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    catalog::{CatalogApi, HttpCatalog},
    config::ServerConfig,
    metrics::Metrics,
    notify::{NotificationRouter, NotificationSink, SessionRegistry},
    processor::{JobOrchestrator, WorkerPool},
    queue::{Broker, ChunkConsumer},
};

/// Wires the collaborators together and owns the service-wide shutdown
/// channel. Consuming starts when `start` is called and ends on SIGINT,
/// SIGTERM, or a broker failure.
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub sessions: Arc<SessionRegistry>,
    consumer: ChunkConsumer,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let metrics = Arc::new(Metrics::default());

        let broker = Broker::connect(&config.broker).await?;
        let catalog: Arc<dyn CatalogApi> = Arc::new(
            HttpCatalog::new(&config.catalog).context("error initializing catalog client")?,
        );
        let sink: Arc<dyn NotificationSink> = Arc::new(broker.notification_publisher());

        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(NotificationRouter::new(
            sink,
            sessions.clone(),
            metrics.clone(),
        ));
        let orchestrator = Arc::new(JobOrchestrator::new(
            &config.processing,
            catalog,
            router,
            metrics.clone(),
        ));
        let pool = WorkerPool::new(
            orchestrator.clone(),
            config.processing.worker_count,
            shutdown_rx.clone(),
        );
        orchestrator.attach_worker_pool(pool);

        let consumer = broker.chunk_consumer(orchestrator.clone(), metrics);

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            orchestrator,
            sessions,
            consumer,
        })
    }

    pub async fn start(self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });
        self.consumer.run(self.shutdown_rx.clone()).await
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down gracefully");
}
