//! Hub sender: bounded queue, size/interval batching, retry with backoff
//!
//! Producers enqueue shaped records through [`HubHandle::enqueue`], which
//! never blocks; when the queue is full the incoming record is dropped and
//! counted. A single consumer task frames batches as JSON arrays and ships
//! them through the [`HubSink`], retrying failed sends with exponential
//! backoff and preserving order.

pub mod mqtt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

/// Hard upper bound for a hub payload.
pub const HUB_MESSAGE_SIZE_MAX: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum HubSendError {
    #[error("hub transport error: {0}")]
    Transport(String),
}

/// Downstream sink accepting opaque UTF-8 payloads.
#[async_trait]
pub trait HubSink: Send + Sync {
    async fn send(&self, payload: String) -> Result<(), HubSendError>;
}

#[derive(Clone, Debug)]
pub struct HubSenderConfig {
    /// Bounded queue length (`MonitoredItemsQueueCapacity`)
    pub queue_capacity: usize,
    /// Maximum serialised batch size; 0 disables batching entirely
    pub message_size: usize,
    /// Time-based batch release (`DefaultSendIntervalSeconds`)
    pub send_interval: Duration,
    /// Drain window on shutdown (`PublisherShutdownWaitPeriod`)
    pub shutdown_wait: Duration,
}

impl HubSenderConfig {
    pub fn clamped_message_size(&self) -> usize {
        self.message_size.min(HUB_MESSAGE_SIZE_MAX)
    }
}

/// Producer side of the hub queue.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<String>,
}

impl HubHandle {
    /// Enqueue one shaped record. Returns `false` when the queue is full and
    /// the record was dropped; callers count that as a missed message.
    pub fn enqueue(&self, record: String) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                metrics::HUB_QUEUE_DEPTH.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct HubSender;

impl HubSender {
    /// Spawn the sender task; the returned handle feeds it.
    pub fn spawn(
        sink: Arc<dyn HubSink>,
        config: HubSenderConfig,
        cancel: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let task = tokio::spawn(run_sender(sink, config, rx, cancel));
        (HubHandle { tx }, task)
    }
}

struct Batch {
    records: Vec<String>,
    /// serialised length of the JSON array framing the records
    serialised_len: usize,
}

impl Batch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            serialised_len: 2,
        }
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Length after adding one more record.
    fn len_with(&self, record: &str) -> usize {
        let separator = usize::from(!self.records.is_empty());
        self.serialised_len + record.len() + separator
    }

    fn push(&mut self, record: String) {
        self.serialised_len = self.len_with(&record);
        self.records.push(record);
    }

    fn frame(&mut self) -> (String, usize) {
        let count = self.records.len();
        let payload = format!("[{}]", self.records.join(","));
        self.records.clear();
        self.serialised_len = 2;
        (payload, count)
    }
}

async fn run_sender(
    sink: Arc<dyn HubSink>,
    config: HubSenderConfig,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let message_size = config.clamped_message_size();
    let mut batch = Batch::new();
    let mut interval = tokio::time::interval(config.send_interval.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        queue_capacity = config.queue_capacity,
        message_size,
        send_interval_ms = config.send_interval.as_millis() as u64,
        "hub sender started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !batch.is_empty() {
                    let (payload, count) = batch.frame();
                    ship(&*sink, payload, count, &cancel, None).await;
                }
            }
            received = rx.recv() => {
                let Some(record) = received else { break };
                metrics::HUB_QUEUE_DEPTH.dec();

                if message_size == 0 {
                    // batching disabled, every record ships on its own
                    ship(&*sink, record, 1, &cancel, None).await;
                    continue;
                }

                if record.len() + 2 > message_size {
                    warn!(
                        record_len = record.len(),
                        message_size,
                        "record exceeds the hub message size, sending as a 1-element batch"
                    );
                    if !batch.is_empty() {
                        let (payload, count) = batch.frame();
                        ship(&*sink, payload, count, &cancel, None).await;
                    }
                    ship(&*sink, format!("[{record}]"), 1, &cancel, None).await;
                    continue;
                }

                if batch.len_with(&record) > message_size {
                    let (payload, count) = batch.frame();
                    ship(&*sink, payload, count, &cancel, None).await;
                }
                batch.push(record);
            }
        }
    }

    drain(&*sink, &config, &mut batch, &mut rx, message_size).await;
    info!("hub sender stopped");
}

/// Ship one payload with exponential backoff. The batch is dropped and
/// counted as lost after ten consecutive failures, or when the deadline
/// passes during shutdown.
async fn ship(
    sink: &dyn HubSink,
    payload: String,
    record_count: usize,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) {
    const MAX_ATTEMPTS: u32 = 10;
    let mut backoff = Duration::from_secs(1);

    for attempt in 1..=MAX_ATTEMPTS {
        match sink.send(payload.clone()).await {
            Ok(()) => {
                metrics::HUB_MESSAGES_SENT.inc();
                return;
            }
            Err(e) => {
                metrics::HUB_SEND_FAILURES.inc();
                warn!(attempt, error = %e, "hub send failed");
            }
        }

        if attempt == MAX_ATTEMPTS {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() + backoff > deadline {
                break;
            }
        }
        // during normal operation retries survive cancellation so the final
        // drain can still deliver the batch
        if cancel.is_cancelled() && deadline.is_none() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }

    metrics::HUB_RECORDS_LOST.inc_by(record_count as u64);
    warn!(record_count, "dropping hub batch after repeated failures");
}

async fn drain(
    sink: &dyn HubSink,
    config: &HubSenderConfig,
    batch: &mut Batch,
    rx: &mut mpsc::Receiver<String>,
    message_size: usize,
) {
    let deadline = Instant::now() + config.shutdown_wait;
    let drain_cancel = CancellationToken::new();
    debug!("draining hub queue");

    while Instant::now() < deadline {
        let Ok(record) = rx.try_recv() else { break };
        metrics::HUB_QUEUE_DEPTH.dec();

        if message_size == 0 || record.len() + 2 > message_size {
            if !batch.is_empty() {
                let (payload, count) = batch.frame();
                ship(sink, payload, count, &drain_cancel, Some(deadline)).await;
            }
            let payload = if message_size == 0 { record } else { format!("[{record}]") };
            ship(sink, payload, 1, &drain_cancel, Some(deadline)).await;
            continue;
        }
        if batch.len_with(&record) > message_size {
            let (payload, count) = batch.frame();
            ship(sink, payload, count, &drain_cancel, Some(deadline)).await;
        }
        batch.push(record);
    }

    if !batch.is_empty() {
        let (payload, count) = batch.frame();
        ship(sink, payload, count, &drain_cancel, Some(deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink recording every payload; optionally gated to simulate a slow hub.
    struct RecordingSink {
        payloads: Mutex<Vec<String>>,
        fail_times: Mutex<u32>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
                fail_times: Mutex::new(0),
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            let sink = Self::new();
            *sink.fail_times.lock().unwrap() = times;
            sink
        }

        fn payloads(&self) -> Vec<String> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HubSink for RecordingSink {
        async fn send(&self, payload: String) -> Result<(), HubSendError> {
            {
                let mut remaining = self.fail_times.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HubSendError::Transport("induced".to_string()));
                }
            }
            self.payloads.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn config(message_size: usize, send_interval: Duration) -> HubSenderConfig {
        HubSenderConfig {
            queue_capacity: 1024,
            message_size,
            send_interval,
            shutdown_wait: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_immediate_mode_ships_each_record() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let (handle, task) =
            HubSender::spawn(sink.clone(), config(0, Duration::from_secs(10)), cancel.clone());

        for i in 0..3 {
            assert!(handle.enqueue(format!("{{\"n\":{i}}}")));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0], "{\"n\":0}");
    }

    #[tokio::test]
    async fn test_interval_batching_frames_json_array() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let (handle, task) = HubSender::spawn(
            sink.clone(),
            config(HUB_MESSAGE_SIZE_MAX, Duration::from_millis(100)),
            cancel.clone(),
        );

        handle.enqueue("{\"a\":1}".to_string());
        handle.enqueue("{\"b\":2}".to_string());
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        task.await.unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], "[{\"a\":1},{\"b\":2}]");
    }

    #[tokio::test]
    async fn test_size_trigger_never_exceeds_message_size() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let size = 64;
        let (handle, task) =
            HubSender::spawn(sink.clone(), config(size, Duration::from_secs(10)), cancel.clone());

        for i in 0..10 {
            handle.enqueue(format!("{{\"value\":\"rec-{i:02}\"}}"));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.unwrap();

        let payloads = sink.payloads();
        assert!(payloads.len() > 1);
        for payload in &payloads {
            assert!(payload.len() <= size, "payload {} exceeds {size}", payload.len());
            assert!(payload.starts_with('[') && payload.ends_with(']'));
        }
        // no records lost, order preserved
        let joined = payloads.join("");
        for i in 0..10 {
            assert!(joined.contains(&format!("rec-{i:02}")));
        }
    }

    #[tokio::test]
    async fn test_oversized_record_ships_alone() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let (handle, task) =
            HubSender::spawn(sink.clone(), config(32, Duration::from_millis(50)), cancel.clone());

        let big = format!("{{\"v\":\"{}\"}}", "x".repeat(64));
        handle.enqueue(big.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], format!("[{big}]"));
    }

    #[tokio::test]
    async fn test_retry_preserves_batch() {
        let sink = RecordingSink::failing(2);
        let cancel = CancellationToken::new();
        let (handle, task) =
            HubSender::spawn(sink.clone(), config(0, Duration::from_secs(10)), cancel.clone());

        handle.enqueue("{\"x\":1}".to_string());
        // two failures back off 1s + 2s before the third attempt succeeds
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sink.payloads(), vec!["{\"x\":1}".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_full_drops_incoming() {
        // no consumer: enqueue against a queue that fills up
        let (tx, _rx) = mpsc::channel(4);
        let handle = HubHandle { tx };

        let mut accepted = 0;
        for i in 0..10 {
            if handle.enqueue(format!("{i}")) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
    }
}
