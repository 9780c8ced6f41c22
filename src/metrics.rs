//! Prometheus metrics and the periodic diagnostics output

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

lazy_static! {
    /// Total number of OPC UA notifications received from all endpoints
    pub static ref NOTIFICATIONS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "bridge_notifications_received_total",
        "Total number of OPC UA notifications received",
        &["endpoint"]
    )
    .unwrap();

    /// Notifications dropped because their status code is suppressed
    pub static ref NOTIFICATIONS_SUPPRESSED: IntCounter = register_int_counter!(
        "bridge_notifications_suppressed_total",
        "Notifications dropped due to a suppressed OPC UA status code"
    )
    .unwrap();

    /// Notifications dropped because the hub queue was full
    pub static ref MISSED_MESSAGES: IntCounter = register_int_counter!(
        "bridge_missed_messages_total",
        "Notifications dropped because the hub queue was full"
    )
    .unwrap();

    /// Synthetic heartbeat records emitted
    pub static ref HEARTBEATS_EMITTED: IntCounter = register_int_counter!(
        "bridge_heartbeats_emitted_total",
        "Synthetic heartbeat records emitted for silent nodes"
    )
    .unwrap();

    /// Hub messages successfully sent
    pub static ref HUB_MESSAGES_SENT: IntCounter = register_int_counter!(
        "bridge_hub_messages_sent_total",
        "Messages successfully delivered to the hub"
    )
    .unwrap();

    /// Failed hub send attempts (before retry)
    pub static ref HUB_SEND_FAILURES: IntCounter = register_int_counter!(
        "bridge_hub_send_failures_total",
        "Failed hub transport attempts"
    )
    .unwrap();

    /// Records dropped after exhausting hub retries
    pub static ref HUB_RECORDS_LOST: IntCounter = register_int_counter!(
        "bridge_hub_records_lost_total",
        "Records dropped after exhausting hub retries"
    )
    .unwrap();

    /// Current depth of the hub queue
    pub static ref HUB_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "bridge_hub_queue_depth",
        "Current number of records waiting in the hub queue"
    )
    .unwrap();

    /// Number of endpoints with a connected session
    pub static ref CONNECTED_ENDPOINTS: IntGauge = register_int_gauge!(
        "bridge_connected_endpoints",
        "Number of endpoints with a connected OPC UA session"
    )
    .unwrap();

    /// Monitored items currently in the Monitored state
    pub static ref MONITORED_ITEMS: IntGauge = register_int_gauge!(
        "bridge_monitored_items",
        "Monitored items currently active on the server"
    )
    .unwrap();
}

/// Spawn the periodic diagnostics task.
///
/// `interval_secs` follows the `DiagnosticsInterval` option: a positive value
/// is the output period, `0` keeps the counters without output, `-1` disables
/// diagnostics entirely.
pub fn spawn_diagnostics(
    interval_secs: i64,
    site: Option<String>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval_secs <= 0 {
        return None;
    }

    let period = std::time::Duration::from_secs(interval_secs as u64);
    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the first summary
        // covers a full period
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            info!(
                site = site.as_deref().unwrap_or(""),
                connected_endpoints = CONNECTED_ENDPOINTS.get(),
                monitored_items = MONITORED_ITEMS.get(),
                queue_depth = HUB_QUEUE_DEPTH.get(),
                notifications_suppressed = NOTIFICATIONS_SUPPRESSED.get(),
                missed_messages = MISSED_MESSAGES.get(),
                heartbeats = HEARTBEATS_EMITTED.get(),
                hub_messages_sent = HUB_MESSAGES_SENT.get(),
                hub_send_failures = HUB_SEND_FAILURES.get(),
                hub_records_lost = HUB_RECORDS_LOST.get(),
                "diagnostics"
            );
        }
    }))
}
