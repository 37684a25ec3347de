use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    data_model::{JobId, NotificationEvent},
    metrics::Metrics,
};

/// Durable side of the notification fan-out: publishes an event onto the
/// broker. Implemented over AMQP in `queue`; tests substitute a capturing
/// sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> Result<()>;
}

/// Identifier of one subscriber connection, used to guard against a stale
/// close racing a reconnect for the same job id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SubscriberHandleId(String);

impl Default for SubscriberHandleId {
    fn default() -> Self {
        Self(nanoid!())
    }
}

impl std::fmt::Display for SubscriberHandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-process handle to one live subscriber. The transport collaborator
/// owns the receiving end and the wire framing.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberHandleId,
    sender: mpsc::UnboundedSender<NotificationEvent>,
}

impl SubscriberHandle {
    pub fn new(sender: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        Self {
            id: SubscriberHandleId::default(),
            sender,
        }
    }

    // Used by the transport collaborator when closing a session.
    #[allow(dead_code)]
    pub fn id(&self) -> &SubscriberHandleId {
        &self.id
    }

    fn deliver(&self, event: NotificationEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
    }
}

/// At most one live subscriber per job id. Registration is
/// last-writer-wins; unregistration with a stale handle id is a logged
/// no-op.
pub struct SessionRegistry {
    sessions: DashMap<JobId, SubscriberHandle>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, job_id: JobId, handle: SubscriberHandle) {
        if let Some(previous) = self.sessions.insert(job_id.clone(), handle) {
            info!(
                job_id = %job_id,
                previous_handle = %previous.id,
                "replaced existing subscriber for job"
            );
        }
    }

    #[allow(dead_code)]
    pub fn unregister(&self, job_id: &JobId, handle_id: &SubscriberHandleId) {
        let stale = match self.sessions.get(job_id) {
            None => return,
            Some(current) => current.id != *handle_id,
        };
        if stale {
            warn!(
                job_id = %job_id,
                handle_id = %handle_id,
                "stale unregister for job, a newer subscriber is registered"
            );
            return;
        }
        self.sessions.remove_if(job_id, |_, current| current.id == *handle_id);
    }

    pub fn get(&self, job_id: &JobId) -> Option<SubscriberHandle> {
        self.sessions.get(job_id).map(|entry| entry.value().clone())
    }
}

/// Routes one status event to both halves of the fan-out: the durable
/// broker publish (system of record) and the job's live subscriber, if
/// any. Neither half's failure escalates.
pub struct NotificationRouter {
    sink: Arc<dyn NotificationSink>,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
}

impl NotificationRouter {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        sessions: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            sessions,
            metrics,
        }
    }

    pub async fn publish(&self, event: NotificationEvent) {
        let event = event.with_download_url();
        match self.sink.publish(&event).await {
            Ok(()) => self.metrics.notifications_published.add(1, &[]),
            Err(e) => {
                self.metrics.notification_publish_errors.add(1, &[]);
                error!(
                    job_id = %event.job_id,
                    status = %event.status,
                    "failed to publish durable status event: {e:#}"
                );
            }
        }

        if let Some(handle) = self.sessions.get(&event.job_id) {
            if let Err(e) = handle.deliver(event.clone()) {
                warn!(
                    job_id = %event.job_id,
                    handle_id = %handle.id,
                    "failed to deliver status event to subscriber: {e}"
                );
            }
        }
    }
}
