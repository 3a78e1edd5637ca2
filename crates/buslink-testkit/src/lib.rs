//! Buslink testkit - test doubles for links, monitors and dispatchers
//!
//! - [`ScriptedTransport`]: probe transport replaying scripted outcomes
//! - [`RecordingLiveness`]: liveness sink that records every signal
//! - [`RecordingFaults`]: fault reporter that keeps every fault
//! - [`LogCapture`]: JSON log capture for asserting on tracing output
//! - [`qualified`], [`entry`], [`batch`]: notification builders

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use buslink_core::{
    ChannelNamer, Cursor, DispatchFault, FaultReporter, Liveness, NotificationBatch,
    NotificationEntry, ProbeRequest, ProbeTransport, TransportError,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptedTransport
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one scripted probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Request accepted.
    Accept,
    /// Request accepted after a delay.
    AcceptAfter(Duration),
    /// Request rejected with a reason.
    Reject(String),
}

/// Probe transport that replays scripted outcomes in order.
///
/// Once the script runs out every request uses the fallback outcome,
/// [`ProbeOutcome::Accept`] unless changed.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: Mutex<ProbeOutcome>,
    requests: Mutex<Vec<(String, ProbeRequest)>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ProbeOutcome::Accept),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedTransport {
    /// Transport accepting every probe.
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport rejecting every probe.
    #[must_use]
    pub fn rejecting(reason: impl Into<String>) -> Arc<Self> {
        let transport = Self::default();
        *lock(&transport.fallback) = ProbeOutcome::Reject(reason.into());
        Arc::new(transport)
    }

    /// Transport replaying `outcomes`, then accepting.
    #[must_use]
    pub fn scripted(outcomes: impl IntoIterator<Item = ProbeOutcome>) -> Arc<Self> {
        let transport = Self::default();
        lock(&transport.script).extend(outcomes);
        Arc::new(transport)
    }

    /// Append an outcome to the script.
    pub fn push(&self, outcome: ProbeOutcome) {
        lock(&self.script).push_back(outcome);
    }

    /// Change the outcome used once the script is exhausted.
    pub fn set_fallback(&self, outcome: ProbeOutcome) {
        *lock(&self.fallback) = outcome;
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, ProbeRequest)> {
        lock(&self.requests).clone()
    }

    /// Number of requests received so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    fn next_outcome(&self) -> ProbeOutcome {
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| lock(&self.fallback).clone())
    }
}

#[async_trait]
impl ProbeTransport for ScriptedTransport {
    async fn request(&self, endpoint: &str, body: &ProbeRequest) -> Result<(), TransportError> {
        lock(&self.requests).push((endpoint.to_string(), body.clone()));
        match self.next_outcome() {
            ProbeOutcome::Accept => Ok(()),
            ProbeOutcome::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ProbeOutcome::Reject(reason) => Err(TransportError::Rejected(reason)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordingLiveness
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness sink recording every signal it receives.
#[derive(Debug, Default)]
pub struct RecordingLiveness {
    evidence: Mutex<Vec<bool>>,
    probes: AtomicUsize,
}

impl RecordingLiveness {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Evidence reports in order; each value is the `has_payload` flag.
    #[must_use]
    pub fn evidence(&self) -> Vec<bool> {
        lock(&self.evidence).clone()
    }

    /// Number of probe requests.
    #[must_use]
    pub fn probe_requests(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Liveness for RecordingLiveness {
    fn record_evidence(&self, has_payload: bool) {
        lock(&self.evidence).push(has_payload);
    }

    fn request_probe(&self) {
        self.probes.fetch_add(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordingFaults
// ─────────────────────────────────────────────────────────────────────────────

/// One reported fault, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFault {
    /// Channel the fault belongs to, if any.
    pub channel: Option<String>,
    /// Rendered fault.
    pub message: String,
}

/// Fault reporter keeping every fault it receives.
#[derive(Debug, Default)]
pub struct RecordingFaults {
    faults: Mutex<Vec<RecordedFault>>,
}

impl RecordingFaults {
    /// Create an empty reporter.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Faults in report order.
    #[must_use]
    pub fn faults(&self) -> Vec<RecordedFault> {
        lock(&self.faults).clone()
    }

    /// Channels of reported faults, `None` for faults without one.
    #[must_use]
    pub fn channels(&self) -> Vec<Option<String>> {
        lock(&self.faults).iter().map(|f| f.channel.clone()).collect()
    }
}

impl FaultReporter for RecordingFaults {
    fn report(&self, fault: &DispatchFault) {
        lock(&self.faults).push(RecordedFault {
            channel: fault.channel().map(str::to_string),
            message: fault.to_string(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LogCapture
// ─────────────────────────────────────────────────────────────────────────────

/// Captures tracing output as JSON lines.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Create an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the thread-default subscriber until the guard drops.
    #[must_use]
    pub fn install_json(&self, filter: &str) -> tracing::subscriber::DefaultGuard {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(self.clone())
            .json()
            .with_ansi(false)
            .with_level(true)
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .with_current_span(false)
            .flatten_event(true);

        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(layer);
        tracing::subscriber::set_default(subscriber)
    }

    /// Raw captured output.
    #[must_use]
    pub fn jsonl(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).to_string()
    }

    /// Captured events parsed as JSON; lines that do not parse are skipped.
    #[must_use]
    pub fn events(&self) -> Vec<Value> {
        self.jsonl()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Captured events whose `message` field equals `message`.
    #[must_use]
    pub fn events_with_message(&self, message: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event.get("message").and_then(Value::as_str) == Some(message))
            .collect()
    }
}

/// Writer handed out by [`LogCapture`].
#[derive(Debug)]
pub struct LogCaptureWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            bytes: Arc::clone(&self.bytes),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notification builders
// ─────────────────────────────────────────────────────────────────────────────

/// Qualified key of `name` for a tenant and scope.
#[must_use]
pub fn qualified(tenant: &str, scope: &str, name: &str) -> String {
    ChannelNamer::new(tenant, scope).qualify(name).to_key()
}

/// Entry addressed with the string form of a qualified key.
#[must_use]
pub fn entry(tenant: &str, scope: &str, name: &str, payload: Value) -> NotificationEntry {
    NotificationEntry::new(qualified(tenant, scope, name), payload)
}

/// Batch from entries and the bus cursor.
#[must_use]
pub fn batch(entries: Vec<NotificationEntry>, last: u64) -> NotificationBatch {
    NotificationBatch::new(entries, Cursor(last))
}
