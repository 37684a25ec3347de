use opentelemetry::metrics::Counter;

/// Counters for the consume/orchestrate/notify edges. Incremented where
/// messages enter and leave the system; exporter wiring is left to the
/// embedding environment via the global meter provider.
pub struct Metrics {
    pub messages_received: Counter<u64>,
    pub messages_dead_lettered: Counter<u64>,
    pub jobs_completed: Counter<u64>,
    pub jobs_failed: Counter<u64>,
    pub notifications_published: Counter<u64>,
    pub notification_publish_errors: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        let meter = opentelemetry::global::meter("cipherforge-server");
        Self {
            messages_received: meter
                .u64_counter("cipherforge.messages_received")
                .with_description("chunk messages received from the broker")
                .build(),
            messages_dead_lettered: meter
                .u64_counter("cipherforge.messages_dead_lettered")
                .with_description("chunk messages rejected without redelivery")
                .build(),
            jobs_completed: meter
                .u64_counter("cipherforge.jobs_completed")
                .with_description("jobs that reached DONE")
                .build(),
            jobs_failed: meter
                .u64_counter("cipherforge.jobs_failed")
                .with_description("jobs that reached ERROR")
                .build(),
            notifications_published: meter
                .u64_counter("cipherforge.notifications_published")
                .with_description("status events published to the broker")
                .build(),
            notification_publish_errors: meter
                .u64_counter("cipherforge.notification_publish_errors")
                .with_description("failed durable status event publishes")
                .build(),
        }
    }
}
