//! Submission statistics.
//!
//! [`StatsCollectingTransport`] decorates any [`EventTransport`] with atomic
//! counters for delivered events and submit latency. Counters are sampled
//! with [`StatsCollectingTransport::statistics`]; collection itself never
//! blocks the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use taskmill_core::error::Result;
use taskmill_core::event::EventsWrapper;

use crate::transport::EventTransport;

/// Point-in-time snapshot of a transport's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStatistics {
    /// Events in batches that were accepted by the server.
    pub events_sent: u64,
    /// Batches accepted by the server.
    pub batches_sent: u64,
    /// Sum of all submit durations, failed attempts included.
    pub total_submit_millis: u64,
    /// Longest single submit duration observed.
    pub max_submit_millis: u64,
}

/// Transport decorator that measures every batch submission.
pub struct StatsCollectingTransport {
    inner: Arc<dyn EventTransport>,
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    total_submit_millis: AtomicU64,
    max_submit_millis: AtomicU64,
}

impl StatsCollectingTransport {
    pub fn new(inner: Arc<dyn EventTransport>) -> Self {
        Self {
            inner,
            events_sent: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            total_submit_millis: AtomicU64::new(0),
            max_submit_millis: AtomicU64::new(0),
        }
    }

    /// Samples the counters. Individual loads are relaxed: a snapshot taken
    /// concurrently with a submit may straddle it.
    pub fn statistics(&self) -> PipeStatistics {
        PipeStatistics {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            total_submit_millis: self.total_submit_millis.load(Ordering::Relaxed),
            max_submit_millis: self.max_submit_millis.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventTransport for StatsCollectingTransport {
    async fn send_batch(&self, batch: &EventsWrapper) -> Result<()> {
        let started = tokio::time::Instant::now();
        let result = self.inner.send_batch(batch).await;
        let elapsed = started.elapsed().as_millis() as u64;

        self.total_submit_millis.fetch_add(elapsed, Ordering::Relaxed);
        self.max_submit_millis.fetch_max(elapsed, Ordering::Relaxed);
        if result.is_ok() {
            self.events_sent
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.batches_sent.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
