use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::BrokerConfig,
    data_model::{ChunkMessage, JobId, NotificationEvent},
    metrics::Metrics,
    notify::NotificationSink,
    processor::JobOrchestrator,
};

const CONSUMER_TAG: &str = "cipherforge-server";
const PREFETCH_COUNT: u16 = 16;

fn notification_routing_key(prefix: &str, job_id: &JobId) -> String {
    format!("{prefix}.{job_id}")
}

/// AMQP connection plus the topology both directions depend on: a topic
/// exchange and bound queue for inbound chunks, and a topic exchange for
/// outbound status events.
pub struct Broker {
    _connection: Connection,
    publish_channel: Channel,
    consume_channel: Channel,
    config: BrokerConfig,
}

impl Broker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.uri, ConnectionProperties::default())
            .await
            .with_context(|| format!("failed to connect to broker at {}", config.uri))?;
        let publish_channel = connection
            .create_channel()
            .await
            .context("failed to open publish channel")?;
        let consume_channel = connection
            .create_channel()
            .await
            .context("failed to open consume channel")?;
        consume_channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .context("failed to set consumer prefetch")?;

        for exchange in [&config.chunk_exchange, &config.notification_exchange] {
            consume_channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("failed to declare exchange {exchange}"))?;
        }
        consume_channel
            .queue_declare(
                &config.chunk_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare queue {}", config.chunk_queue))?;
        consume_channel
            .queue_bind(
                &config.chunk_queue,
                &config.chunk_exchange,
                &config.chunk_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| {
                format!(
                    "failed to bind queue {} to exchange {}",
                    config.chunk_queue, config.chunk_exchange
                )
            })?;

        info!(
            uri = %config.uri,
            chunk_queue = %config.chunk_queue,
            "broker topology declared"
        );
        Ok(Self {
            _connection: connection,
            publish_channel,
            consume_channel,
            config: config.clone(),
        })
    }

    pub fn notification_publisher(&self) -> NotificationPublisher {
        NotificationPublisher {
            channel: self.publish_channel.clone(),
            exchange: self.config.notification_exchange.clone(),
            routing_prefix: self.config.notification_routing_prefix.clone(),
        }
    }

    pub fn chunk_consumer(
        &self,
        orchestrator: Arc<JobOrchestrator>,
        metrics: Arc<Metrics>,
    ) -> ChunkConsumer {
        ChunkConsumer {
            channel: self.consume_channel.clone(),
            queue: self.config.chunk_queue.clone(),
            orchestrator,
            metrics,
        }
    }
}

/// Durable half of the notification fan-out: one JSON event per status
/// change, routed per job so subscribers can bind selectively.
pub struct NotificationPublisher {
    channel: Channel,
    exchange: String,
    routing_prefix: String,
}

#[async_trait]
impl NotificationSink for NotificationPublisher {
    async fn publish(&self, event: &NotificationEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("failed to serialize status event")?;
        let routing_key = notification_routing_key(&self.routing_prefix, &event.job_id);
        self.channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .context("failed to publish status event")?
            .await
            .context("broker did not confirm status event")?;
        debug!(
            job_id = %event.job_id,
            status = %event.status,
            routing_key = %routing_key,
            "status event published"
        );
        Ok(())
    }
}

/// Consume loop for inbound chunk messages. Messages that cannot be parsed
/// or applied are rejected without requeue so the broker dead-letters
/// them; a poison message is never redelivered to this queue.
pub struct ChunkConsumer {
    channel: Channel,
    queue: String,
    orchestrator: Arc<JobOrchestrator>,
    metrics: Arc<Metrics>,
}

impl ChunkConsumer {
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<()>) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to start consuming from {}", self.queue))?;
        info!(queue = %self.queue, "consuming chunk messages");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("chunk consumer shutting down");
                    return Ok(());
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                    Some(Err(e)) => {
                        error!("broker delivery error: {e}");
                    }
                    None => {
                        anyhow::bail!("broker consumer stream closed");
                    }
                },
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        self.metrics.messages_received.add(1, &[]);

        let message: ChunkMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable chunk message, dead-lettering: {e}");
                self.dead_letter(&delivery).await;
                return;
            }
        };
        if message.job_id.trim().is_empty() {
            warn!("chunk message with empty job id, dead-lettering");
            self.dead_letter(&delivery).await;
            return;
        }
        let job_id = JobId::from(message.job_id.as_str());
        if !job_id.is_path_safe() {
            warn!(job_id = %job_id, "job id is not usable as a path component, dead-lettering");
            self.dead_letter(&delivery).await;
            return;
        }
        match self.orchestrator.handle_chunk(message).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(job_id = %job_id, "failed to ack chunk message: {e}");
                }
            }
            Err(e) => {
                error!(job_id = %job_id, "failed to apply chunk message: {e:#}");
                self.dead_letter(&delivery).await;
                self.orchestrator
                    .force_fail(&job_id, &format!("Failed to apply a chunk message: {e:#}"))
                    .await;
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) {
        self.metrics.messages_dead_lettered.add(1, &[]);
        if let Err(e) = delivery
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
        {
            error!("failed to nack chunk message: {e}");
        }
    }
}
