//! Tracing abstraction.
//!
//! The runtime wraps every major step (agent run, flow step, model call,
//! tool execution) in a span from the process-wide tracer. The default
//! tracer is a no-op; tests install a [`RecordingTracer`] to assert on the
//! spans that were opened.

use lazy_static::lazy_static;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

/// One unit of traced work.
pub trait Span: Send {
    fn set_attribute(&mut self, key: &str, value: &str);
    fn add_event(&mut self, name: &str, attributes: &[(&str, &str)]);
    fn end(&mut self);
}

/// Span factory; implementations bridge to a concrete telemetry backend.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str) -> Box<dyn Span>;
}

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: &str) {}
    fn add_event(&mut self, _name: &str, _attributes: &[(&str, &str)]) {}
    fn end(&mut self) {}
}

/// Discards everything.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// A finished span captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub events: Vec<String>,
}

/// Collects finished spans in memory.
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self {
            spans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of all spans that have ended so far.
    pub fn finished_spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for RecordingTracer {
    fn default() -> Self {
        Self::new()
    }
}

struct RecordingSpan {
    record: RecordedSpan,
    sink: Arc<Mutex<Vec<RecordedSpan>>>,
    ended: bool,
}

impl Span for RecordingSpan {
    fn set_attribute(&mut self, key: &str, value: &str) {
        self.record
            .attributes
            .push((key.to_string(), value.to_string()));
    }

    fn add_event(&mut self, name: &str, attributes: &[(&str, &str)]) {
        let mut entry = name.to_string();
        for (key, value) in attributes {
            entry.push_str(&format!(" {}={}", key, value));
        }
        self.record.events.push(entry);
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Ok(mut spans) = self.sink.lock() {
            spans.push(self.record.clone());
        }
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str) -> Box<dyn Span> {
        Box::new(RecordingSpan {
            record: RecordedSpan {
                name: name.to_string(),
                attributes: Vec::new(),
                events: Vec::new(),
            },
            sink: self.spans.clone(),
            ended: false,
        })
    }
}

lazy_static! {
    static ref DEFAULT_TRACER: RwLock<Arc<dyn Tracer>> = RwLock::new(Arc::new(NoopTracer));
}

/// The process-wide tracer.
pub fn default_tracer() -> Arc<dyn Tracer> {
    DEFAULT_TRACER
        .read()
        .map(|t| t.clone())
        .unwrap_or_else(|_| Arc::new(NoopTracer))
}

/// Replace the process-wide tracer.
pub fn set_default_tracer(tracer: Arc<dyn Tracer>) {
    if let Ok(mut slot) = DEFAULT_TRACER.write() {
        *slot = tracer;
    }
}
