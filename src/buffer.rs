use crate::error::Result;
use crate::gaze::QualityTier;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Async flush callback invoked with each drained batch.
pub type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Statistics for buffer monitoring
#[derive(Debug, Default)]
pub struct BufferStats {
    pub pushed: AtomicU64,
    pub flushed: AtomicU64,
    pub failed_flushes: AtomicU64,
}

/// Snapshot of buffer statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStatsSnapshot {
    pub pushed: u64,
    pub flushed: u64,
    pub failed_flushes: u64,
}

impl BufferStats {
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Ordered sample accumulator that flushes through a caller-supplied async
/// function when a size threshold is reached or a timer interval elapses.
///
/// A failed flush re-queues the un-flushed batch at the front, so samples are
/// delivered at-least-once and never silently dropped.
pub struct SampleBuffer<T: Send + 'static> {
    queue: Mutex<VecDeque<T>>,
    max_batch: usize,
    flush: FlushFn<T>,
    stats: BufferStats,
}

impl<T: Send + Clone + 'static> SampleBuffer<T> {
    pub fn new(max_batch: usize, flush: FlushFn<T>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_batch: max_batch.max(1),
            flush,
            stats: BufferStats::default(),
        }
    }

    /// Append a sample. Triggers a flush when the buffer reaches the size
    /// threshold; any flush error propagates to the caller.
    pub async fn push(&self, sample: T) -> Result<()> {
        let should_flush = {
            let mut queue = self.queue.lock().await;
            queue.push_back(sample);
            queue.len() >= self.max_batch
        };
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);

        if should_flush {
            self.flush_now().await?;
        }
        Ok(())
    }

    /// Drain the buffer and hand the batch to the flush callback. Returns the
    /// number of samples flushed. On failure the batch goes back to the front
    /// of the queue, ahead of anything pushed during the flush.
    pub async fn flush_now(&self) -> Result<usize> {
        let batch: Vec<T> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        trace!("Flushing {} buffered samples", count);

        match (self.flush)(batch.clone()).await {
            Ok(()) => {
                self.stats.flushed.fetch_add(count as u64, Ordering::Relaxed);
                Ok(count)
            }
            Err(e) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!("Flush failed, re-queueing {} samples: {}", count, e);
                let mut queue = self.queue.lock().await;
                for sample in batch.into_iter().rev() {
                    queue.push_front(sample);
                }
                Err(e)
            }
        }
    }

    /// Number of samples currently held.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the interval-flush task. The task runs until the token is
    /// cancelled; flush errors are logged and retried on the next tick.
    pub fn start_interval_flush(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let buffer = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // Skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Interval flush task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush_now().await {
                            warn!("Interval flush failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

const RATE_WINDOW: usize = 10;

/// Live quality metrics over the incoming sample stream: sampling rate from a
/// sliding window of inter-sample intervals, a running confidence average with
/// a three-bucket histogram, and a data-loss estimate against the expected
/// sample count.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    intervals_ms: VecDeque<f64>,
    last_sample_ms: Option<f64>,
    first_sample_ms: Option<f64>,
    observed: u64,
    confidence_sum: f64,
    high_confidence: u64,
    medium_confidence: u64,
    low_confidence: u64,
    /// Rate assumed before the window has enough data to measure one
    default_rate_hz: f64,
}

/// Histogram of sample confidence: >0.8 high, 0.5-0.8 medium, <0.5 low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfidenceHistogram {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

/// Point-in-time quality summary.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub sampling_rate_hz: Option<f64>,
    pub average_confidence: Option<f64>,
    pub histogram: ConfidenceHistogram,
    pub data_loss_rate: f64,
    pub observed_samples: u64,
    pub tier: QualityTier,
}

impl QualityMonitor {
    pub fn new(default_rate_hz: f64) -> Self {
        Self {
            intervals_ms: VecDeque::with_capacity(RATE_WINDOW),
            last_sample_ms: None,
            first_sample_ms: None,
            observed: 0,
            confidence_sum: 0.0,
            high_confidence: 0,
            medium_confidence: 0,
            low_confidence: 0,
            default_rate_hz: default_rate_hz.max(1.0),
        }
    }

    /// Record one sample's capture time and confidence.
    pub fn record(&mut self, monotonic_ms: f64, confidence: f64) {
        if let Some(last) = self.last_sample_ms {
            let interval = monotonic_ms - last;
            if interval > 0.0 {
                if self.intervals_ms.len() == RATE_WINDOW {
                    self.intervals_ms.pop_front();
                }
                self.intervals_ms.push_back(interval);
            }
        } else {
            self.first_sample_ms = Some(monotonic_ms);
        }
        self.last_sample_ms = Some(monotonic_ms);

        self.observed += 1;
        self.confidence_sum += confidence;
        if confidence > 0.8 {
            self.high_confidence += 1;
        } else if confidence >= 0.5 {
            self.medium_confidence += 1;
        } else {
            self.low_confidence += 1;
        }
    }

    /// Current sampling rate estimated from the interval window.
    pub fn sampling_rate_hz(&self) -> Option<f64> {
        if self.intervals_ms.is_empty() {
            return None;
        }
        let mean_ms: f64 =
            self.intervals_ms.iter().sum::<f64>() / self.intervals_ms.len() as f64;
        if mean_ms <= 0.0 {
            return None;
        }
        Some(1000.0 / mean_ms)
    }

    pub fn average_confidence(&self) -> Option<f64> {
        if self.observed == 0 {
            return None;
        }
        Some(self.confidence_sum / self.observed as f64)
    }

    /// Estimated data-loss rate at `now_ms`:
    /// `max(0, 1 - observed / expected)`, where expected derives from elapsed
    /// time and the measured (or assumed default) sampling rate.
    pub fn data_loss_rate(&self, now_ms: f64) -> f64 {
        let first = match self.first_sample_ms {
            Some(first) => first,
            None => return 0.0,
        };
        let elapsed_s = (now_ms - first) / 1000.0;
        if elapsed_s <= 0.0 {
            return 0.0;
        }
        let rate = self.sampling_rate_hz().unwrap_or(self.default_rate_hz);
        let expected = elapsed_s * rate;
        if expected <= 0.0 {
            return 0.0;
        }
        (1.0 - self.observed as f64 / expected).max(0.0)
    }

    pub fn histogram(&self) -> ConfidenceHistogram {
        ConfidenceHistogram {
            high: self.high_confidence,
            medium: self.medium_confidence,
            low: self.low_confidence,
        }
    }

    /// Coarse tier classification for status reporting.
    pub fn tier(&self, now_ms: f64) -> QualityTier {
        if self.observed == 0 {
            return QualityTier::Unavailable;
        }
        let loss = self.data_loss_rate(now_ms);
        let confidence = self.average_confidence().unwrap_or(0.0);
        if loss < 0.05 && confidence > 0.8 {
            QualityTier::Excellent
        } else if loss < 0.2 && confidence >= 0.5 {
            QualityTier::Good
        } else {
            QualityTier::Poor
        }
    }

    pub fn report(&self, now_ms: f64) -> QualityReport {
        QualityReport {
            sampling_rate_hz: self.sampling_rate_hz(),
            average_confidence: self.average_confidence(),
            histogram: self.histogram(),
            data_loss_rate: self.data_loss_rate(now_ms),
            observed_samples: self.observed,
            tier: self.tier(now_ms),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.default_rate_hz);
    }
}
