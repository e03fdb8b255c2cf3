//! In-memory implementations of the metrics, tracing and lock contracts.
//!
//! Used by unit and integration tests to assert what an invocation recorded.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::lock::{LocalLockProvider, LockHandle, LockProvider};
use crate::telemetry::{
    ActiveSpan, ExceptionEvent, Mechanism, MetricsSink, RequestLabels, RequestTimer, SpanKind,
    SpanOptions, Tracer, TracingCarrier,
};
use crate::types::{Error, Result};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded timer observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timer: RequestTimer,
    pub labels: RequestLabels,
    pub elapsed: Duration,
}

/// Metrics sink that keeps every observation.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    observations: Mutex<Vec<Observation>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observations(&self) -> Vec<Observation> {
        guard(&self.observations).clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn observe(&self, timer: RequestTimer, labels: &RequestLabels, elapsed: Duration) {
        guard(&self.observations).push(Observation {
            timer,
            labels: labels.clone(),
            elapsed,
        });
    }
}

/// Everything recorded about one span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub kind: SpanKind,
    pub mechanism: Mechanism,
    pub caller: Option<String>,
    pub parent: Option<TracingCarrier>,
    pub exceptions: Vec<ExceptionEvent>,
    /// Number of effective `end()` calls (0 or 1).
    pub ended: usize,
}

/// Tracer that keeps every span it started.
#[derive(Debug, Default, Clone)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

impl RecordingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        guard(&self.spans).clone()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, options: SpanOptions) -> Box<dyn ActiveSpan> {
        let mut spans = guard(&self.spans);
        spans.push(SpanRecord {
            name: options.name,
            kind: options.kind,
            mechanism: options.mechanism,
            caller: options.caller,
            parent: options.parent,
            exceptions: Vec::new(),
            ended: 0,
        });
        Box::new(RecordingSpan {
            index: spans.len() - 1,
            spans: Arc::clone(&self.spans),
        })
    }
}

struct RecordingSpan {
    index: usize,
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

impl ActiveSpan for RecordingSpan {
    fn record_exception(&mut self, exception: &ExceptionEvent) {
        if let Some(record) = guard(&self.spans).get_mut(self.index) {
            record.exceptions.push(exception.clone());
        }
    }

    fn inject(&self, carrier: &mut TracingCarrier) {
        carrier.insert(
            "traceparent".to_string(),
            format!("00-{:032x}-{:016x}-01", self.index + 1, self.index + 1),
        );
    }

    fn end(&mut self) {
        if let Some(record) = guard(&self.spans).get_mut(self.index) {
            record.ended = 1;
        }
    }
}

/// Lock provider that counts acquisitions and release calls.
///
/// Wraps a [`LocalLockProvider`] so mutual exclusion still holds. Release
/// calls are counted before the idempotency check, so a double release shows
/// up as two calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingLockProvider {
    inner: LocalLockProvider,
    unavailable: bool,
    resources: Arc<Mutex<Vec<(String, Duration)>>>,
    release_calls: Arc<AtomicUsize>,
}

impl RecordingLockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A provider whose every acquisition fails.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Self::default()
        })
    }

    /// Resources requested so far, with their TTLs.
    pub fn acquired(&self) -> Vec<(String, Duration)> {
        guard(&self.resources).clone()
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockProvider for RecordingLockProvider {
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<Box<dyn LockHandle>> {
        if self.unavailable {
            return Err(Error::lock_unavailable(resource, "provider unavailable"));
        }
        let handle = self.inner.lock(resource, ttl).await?;
        guard(&self.resources).push((resource.to_string(), ttl));
        Ok(Box::new(RecordingLockHandle {
            inner: handle,
            release_calls: Arc::clone(&self.release_calls),
        }))
    }
}

struct RecordingLockHandle {
    inner: Box<dyn LockHandle>,
    release_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LockHandle for RecordingLockHandle {
    fn resource(&self) -> &str {
        self.inner.resource()
    }

    async fn release(&self) -> Result<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.release().await
    }
}
