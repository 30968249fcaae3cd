use crate::repos::{InboxStore, OutboxStore, StoreResult};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Outbox
    pub outbox_published_total: IntCounterVec,
    pub outbox_publish_failures_total: IntCounterVec,
    pub outbox_poisoned_total: IntCounterVec,

    // Inbox
    pub inbox_messages_total: IntCounterVec,
    pub inbox_handler_duration_seconds: HistogramVec,

    pub cleanup_deleted_total: IntCounterVec,

    // Gauges
    pub backlog: IntGaugeVec,
    pub dep_up: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let outbox_published_total = IntCounterVec::new(
            Opts::new("outbox_published_total", "Outbox events handed to the broker"),
            &["queue"],
        )?;

        let outbox_publish_failures_total = IntCounterVec::new(
            Opts::new(
                "outbox_publish_failures_total",
                "Failed outbox publish attempts",
            ),
            &["event_type"],
        )?;

        let outbox_poisoned_total = IntCounterVec::new(
            Opts::new(
                "outbox_poisoned_total",
                "Outbox events that exhausted their retry budget",
            ),
            &["event_type"],
        )?;

        let inbox_messages_total = IntCounterVec::new(
            Opts::new("inbox_messages_total", "Inbound deliveries by outcome"),
            &["outcome"], // processed|duplicate|unroutable|retry|dead_lettered|malformed
        )?;

        let inbox_handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "inbox_handler_duration_seconds",
                "Event handler duration seconds",
            ),
            &["event_type"],
        )?;

        let cleanup_deleted_total = IntCounterVec::new(
            Opts::new("cleanup_deleted_total", "Rows removed by retention cleanup"),
            &["table"],
        )?;

        let backlog = IntGaugeVec::new(
            Opts::new("relay_backlog", "Unprocessed rows per table and state"),
            &["table", "state"], // outbox: pending|poisoned, inbox: unprocessed|dead_lettered
        )?;

        let dep_up = IntGaugeVec::new(
            Opts::new("relay_dependency_up", "Dependency up gauge"),
            &["dep"], // db|nats
        )?;

        registry.register(Box::new(outbox_published_total.clone()))?;
        registry.register(Box::new(outbox_publish_failures_total.clone()))?;
        registry.register(Box::new(outbox_poisoned_total.clone()))?;
        registry.register(Box::new(inbox_messages_total.clone()))?;
        registry.register(Box::new(inbox_handler_duration_seconds.clone()))?;
        registry.register(Box::new(cleanup_deleted_total.clone()))?;
        registry.register(Box::new(backlog.clone()))?;
        registry.register(Box::new(dep_up.clone()))?;

        Ok(Self {
            registry,
            outbox_published_total,
            outbox_publish_failures_total,
            outbox_poisoned_total,
            inbox_messages_total,
            inbox_handler_duration_seconds,
            cleanup_deleted_total,
            backlog,
            dep_up,
        })
    }

    pub fn inbox_outcome(&self, outcome: &str) {
        self.inbox_messages_total.with_label_values(&[outcome]).inc();
    }

    /// Refresh the backlog gauges from the stores
    pub async fn refresh_backlog(
        &self,
        outbox: &dyn OutboxStore,
        inbox: &dyn InboxStore,
    ) -> StoreResult<()> {
        let out = outbox.backlog().await?;
        self.backlog
            .with_label_values(&["outbox", "pending"])
            .set(out.pending);
        self.backlog
            .with_label_values(&["outbox", "poisoned"])
            .set(out.poisoned);

        let inb = inbox.backlog().await?;
        self.backlog
            .with_label_values(&["inbox", "unprocessed"])
            .set(inb.unprocessed);
        self.backlog
            .with_label_values(&["inbox", "dead_lettered"])
            .set(inb.dead_lettered);

        Ok(())
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&mf, &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
