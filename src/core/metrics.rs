// src/core/metrics.rs

//! Defines and registers Prometheus metrics for node monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire process lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, TextEncoder, register_histogram, register_int_counter,
    register_int_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// The number of peer connections currently held in the global set.
    pub static ref CONNECTED_PEERS: IntGauge =
        register_int_gauge!("riptide_connected_peers", "Number of currently connected peers.").unwrap();
    /// Aggregate number of requests sitting in pool queues.
    pub static ref INPUT_QUEUE_SIZE: IntGauge =
        register_int_gauge!("riptide_input_queue_size", "Requests queued across all work pools.").unwrap();
    /// Aggregate number of frames sitting in connection send queues.
    pub static ref OUTPUT_QUEUE_SIZE: IntGauge =
        register_int_gauge!("riptide_output_queue_size", "Frames queued across all send queues.").unwrap();
    /// Whether the receive paths are suspended by admission control.
    pub static ref NET_SUSPENDED: IntGauge =
        register_int_gauge!("riptide_net_suspended", "Receive paths suspended by admission control (1 or 0).").unwrap();

    // --- Counters ---
    /// The total number of commands processed by the work pools since startup.
    pub static ref COMMANDS_PROCESSED_TOTAL: IntCounter =
        register_int_counter!("riptide_commands_processed_total", "Total number of commands processed.").unwrap();
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: IntCounter =
        register_int_counter!("riptide_connections_received_total", "Total number of connections received.").unwrap();
    /// The total number of transactions completed by the timeout sweeper.
    pub static ref TRANSACTIONS_TIMED_OUT_TOTAL: IntCounter =
        register_int_counter!("riptide_transactions_timed_out_total", "Total number of transactions that timed out.").unwrap();
    /// The total number of requests rejected because a bounded pool queue was full.
    pub static ref REQUESTS_REJECTED_TOTAL: IntCounter =
        register_int_counter!("riptide_requests_rejected_total", "Total number of requests rejected by full pool queues.").unwrap();

    // --- Histograms ---
    /// A histogram of the time requests spend waiting in pool queues.
    pub static ref QUEUE_WAIT_SECONDS: Histogram =
        register_histogram!("riptide_queue_wait_seconds", "Time requests spend in pool queues, in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
