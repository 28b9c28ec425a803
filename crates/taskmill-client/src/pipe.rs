//! Batching output pipe.
//!
//! Accepts events from any caller task, buffers them in a bounded queue and
//! ships size/time-bounded batches to the ingestion endpoint with bounded
//! exponential-backoff retry. Delivery is at-most-once: a full buffer drops
//! the event with a warning and exhausted retries drop the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use taskmill_core::error::Result;
use taskmill_core::event::{Event, EventsWrapper};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipeConfig;
use crate::transport::{EventTransport, HttpEventTransport};

/// Retry ceiling for one batch transmission.
const MAX_RETRY: u32 = 5;
/// How long the worker dozes when the buffer is momentarily empty.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Client-side pipe that turns a stream of events into bounded network calls.
///
/// One background worker drains the buffer per pipe instance; all sends go
/// through the bounded channel and never block the caller.
pub struct BatchingPipe {
    sender: mpsc::Sender<Event>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    max_buffer_size: usize,
}

impl BatchingPipe {
    /// Creates a pipe shipping batches over HTTP to the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`taskmill_core::MillError::Config`] when the configuration
    /// is invalid.
    pub fn new(config: PipeConfig) -> Result<Self> {
        let transport = Arc::new(HttpEventTransport::new(&config.server_url)?);
        Self::with_transport(config, transport)
    }

    /// Creates a pipe over a custom transport (used by tests and embedders).
    pub fn with_transport(
        config: PipeConfig,
        transport: Arc<dyn EventTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.max_buffer_size);
        let cancel = CancellationToken::new();
        let max_buffer_size = config.max_buffer_size;
        let worker = tokio::spawn(worker_loop(
            receiver,
            config,
            transport,
            cancel.clone(),
        ));

        Ok(Self {
            sender,
            cancel,
            worker: tokio::sync::Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
            max_buffer_size,
        })
    }

    /// Enqueues an event for delivery.
    ///
    /// Never blocks: when the buffer is full the event is dropped and a
    /// warning logged. Callers get no delivery confirmation either way.
    pub fn send(&self, event: Event) {
        if let Err(err) = self.sender.try_send(event) {
            let event = match &err {
                mpsc::error::TrySendError::Full(event)
                | mpsc::error::TrySendError::Closed(event) => event,
            };
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Event {} was dropped from the queue due to insufficient space",
                event.task_id()
            );
        }
    }

    /// Number of events currently waiting in the buffer.
    pub fn current_buffer_size(&self) -> usize {
        self.max_buffer_size - self.sender.capacity()
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signals the worker to stop after its current iteration and joins it.
    ///
    /// A batch in flight completes its retry loop before the signal is
    /// observed, so nothing is abandoned mid-transmission.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                tracing::warn!("Pipe worker did not shut down cleanly: {err}");
            }
        }
    }
}

async fn worker_loop(
    mut receiver: mpsc::Receiver<Event>,
    config: PipeConfig,
    transport: Arc<dyn EventTransport>,
    cancel: CancellationToken,
) {
    loop {
        let (events, channel_closed) = collect_batch(&mut receiver, &config, &cancel).await;
        if !events.is_empty() {
            let wrapper = EventsWrapper::new(events);
            send_with_retry(transport.as_ref(), &wrapper).await;
        }
        if channel_closed || cancel.is_cancelled() {
            break;
        }
    }
}

/// Accumulates events until the size threshold is passed, the batch window
/// elapses, or shutdown is signalled. An empty buffer is polled briefly
/// rather than flushing a short batch eagerly. The boolean is true once the
/// sending side has gone away and no further batch can ever form.
async fn collect_batch(
    receiver: &mut mpsc::Receiver<Event>,
    config: &PipeConfig,
    cancel: &CancellationToken,
) -> (Vec<Event>, bool) {
    let window = Duration::from_secs(config.max_batch_wait_secs);
    let started = tokio::time::Instant::now();
    let mut events = Vec::new();
    let mut batch_size = 0usize;
    let mut channel_closed = false;

    while batch_size <= config.max_batch_bytes && started.elapsed() < window {
        match tokio::time::timeout(IDLE_POLL, receiver.recv()).await {
            Ok(Some(mut event)) => {
                clean_event(&mut event, config);
                batch_size += event.estimated_size();
                events.push(event);
            }
            Ok(None) => {
                channel_closed = true;
                break;
            }
            Err(_) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
    }
    (events, channel_closed)
}

async fn send_with_retry(transport: &dyn EventTransport, wrapper: &EventsWrapper) {
    for attempt in 1..=MAX_RETRY {
        match transport.send_batch(wrapper).await {
            Ok(()) => {
                tracing::debug!("{} events were sent to the ingestion server", wrapper.len());
                return;
            }
            Err(err) => {
                tracing::warn!(
                    "Request to ingestion server failed, Attempt: {attempt}/{MAX_RETRY}: {err}"
                );
            }
        }
        if attempt < MAX_RETRY {
            // Exponential backoff.
            tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
        }
    }
    let payload = serde_json::to_string(wrapper).unwrap_or_else(|_| "<unserializable>".into());
    tracing::error!(
        "Can't send events to ingestion server, failed {MAX_RETRY} attempts. Failed request: {payload}"
    );
}

/// Trims an event before transmission: empty attribute maps become `None`
/// and over-long values are truncated per field kind. Idempotent.
fn clean_event(event: &mut Event, config: &PipeConfig) {
    let data = event.data_mut();
    trim_map(&mut data.strings, config.max_chars_non_analyzed);
    trim_map(&mut data.context, config.max_chars_non_analyzed);
    trim_map(&mut data.texts, config.max_chars_analyzed);
    if data.metrics.as_ref().is_some_and(BTreeMap::is_empty) {
        data.metrics = None;
    }
    if data.logs.as_ref().is_some_and(Vec::is_empty) {
        data.logs = None;
    }
}

fn trim_map(map: &mut Option<BTreeMap<String, String>>, max_chars: usize) {
    match map {
        Some(inner) if inner.is_empty() => *map = None,
        Some(inner) => {
            for (key, value) in inner.iter_mut() {
                if value.chars().count() > max_chars {
                    tracing::debug!(
                        "Entry with key {key} is over max characters allowed {max_chars}"
                    );
                    *value = value.chars().take(max_chars).collect();
                }
            }
        }
        None => {}
    }
}
