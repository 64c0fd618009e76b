//! Metrics collection for the write path
//!
//! Prometheus collectors registered into a crate-private registry, created
//! lazily on first use so library users that never scrape pay nothing.

use crate::core::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, IntCounter, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Counters for the inbound side of the dispatcher
pub struct IngressMetrics {
    /// Requests accepted and split
    pub requests_dispatched: IntCounter,
    /// Requests rejected as malformed
    pub requests_rejected: IntCounter,
    /// Sub-messages placed on a vnode queue
    pub sub_messages_enqueued: IntCounter,
    /// Sub-messages whose vnode could not be resolved
    pub vnode_not_found: IntCounter,
    /// Responses handed to the transport
    pub responses_sent: IntCounter,
}

/// Counters for the worker side
pub struct WorkerMetrics {
    /// Non-empty batches drained
    pub batches_drained: IntCounter,
    /// Items processed across all batches
    pub items_processed: IntCounter,
    /// Items whose durability write failed
    pub wal_failures: IntCounter,
    /// Items with no registered handler
    pub unsupported_messages: IntCounter,
    /// Items a handler rejected
    pub handler_failures: IntCounter,
    /// Distribution of drained batch sizes
    pub batch_size: Histogram,
    /// Worker threads currently running
    pub live_workers: IntGauge,
}

/// Centralized metrics for the ingest node
pub struct Metrics {
    /// Dispatcher metrics
    pub ingress: IngressMetrics,
    /// Worker pool metrics
    pub workers: WorkerMetrics,
}

impl Metrics {
    /// Create and register every collector
    pub fn new() -> Result<Self> {
        Ok(Self {
            ingress: IngressMetrics::new()?,
            workers: WorkerMetrics::new()?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> = Lazy::new(|| {
            Metrics::new().expect("Failed to initialize metrics")
        });
        &INSTANCE
    }
}

impl IngressMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            requests_dispatched: register_int_counter_with_registry!(
                "mi_requests_dispatched_total",
                "Write requests split and dispatched",
                REGISTRY
            )?,
            requests_rejected: register_int_counter_with_registry!(
                "mi_requests_rejected_total",
                "Write requests rejected with a malformed envelope",
                REGISTRY
            )?,
            sub_messages_enqueued: register_int_counter_with_registry!(
                "mi_sub_messages_enqueued_total",
                "Per-vnode sub-messages placed on a write queue",
                REGISTRY
            )?,
            vnode_not_found: register_int_counter_with_registry!(
                "mi_vnode_not_found_total",
                "Sub-messages addressed to a vnode not hosted here",
                REGISTRY
            )?,
            responses_sent: register_int_counter_with_registry!(
                "mi_responses_sent_total",
                "Merged write responses sent to callers",
                REGISTRY
            )?,
        })
    }
}

impl WorkerMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            batches_drained: register_int_counter_with_registry!(
                "mi_batches_drained_total",
                "Non-empty batches drained by write workers",
                REGISTRY
            )?,
            items_processed: register_int_counter_with_registry!(
                "mi_items_processed_total",
                "Sub-messages logged and applied",
                REGISTRY
            )?,
            wal_failures: register_int_counter_with_registry!(
                "mi_wal_failures_total",
                "Sub-messages whose durability write failed",
                REGISTRY
            )?,
            unsupported_messages: register_int_counter_with_registry!(
                "mi_unsupported_messages_total",
                "Sub-messages with no registered handler",
                REGISTRY
            )?,
            handler_failures: register_int_counter_with_registry!(
                "mi_handler_failures_total",
                "Sub-messages rejected by their handler",
                REGISTRY
            )?,
            batch_size: register_histogram_with_registry!(
                "mi_batch_size",
                "Items per drained batch",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0, 1024.0],
                REGISTRY
            )?,
            live_workers: register_int_gauge_with_registry!(
                "mi_live_workers",
                "Write worker threads currently running",
                REGISTRY
            )?,
        })
    }
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String> {
    // Touch the collectors so an early scrape still lists them.
    let _ = Metrics::global();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::core::Error::internal(e.to_string()))
}
