//! Heartbeat liveness monitor.
//!
//! This module provides:
//! - [`HeartbeatMonitor`]: the probe/timeout state machine, free of I/O
//! - [`HeartbeatService`]: a tokio task driving the monitor's single timer and
//!   in-flight probes
//! - [`MonitorHandle`]: cloneable handle for reporting evidence, requesting
//!   probes and observing status changes
//!
//! The monitor runs two kinds of timer through one slot. A query timer fires
//! the next probe; a response timer is the deadline for the current probe's
//! acknowledgment. Starting either replaces whatever was pending, so there is
//! never more than one.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::transport::{ProbeRequest, ProbeTransport};

const STATUS_EVENT_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// HeartbeatMonitor
// ─────────────────────────────────────────────────────────────────────────────

/// Timer settings for the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Delay between evidence of life and the next probe.
    pub query_interval: Duration,
    /// Deadline for a probe's acknowledgment once the request has settled.
    pub response_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            query_interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(10),
        }
    }
}

/// Connectivity status as seen by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// No evidence either way yet.
    #[default]
    Unknown,
    /// Link confirmed alive.
    Up,
    /// Link considered down.
    Down,
}

impl LinkStatus {
    /// Check if the link is confirmed alive. `Unknown` counts as not alive.
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }

    const fn from_online(online: bool) -> Self {
        if online { Self::Up } else { Self::Down }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Emitted whenever the connectivity status actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// New status; `true` means the link is up.
    pub online: bool,
}

/// Kind of the pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires the next probe.
    Query,
    /// Declares the link down if no acknowledgment arrived.
    Response,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// The single delayed action a monitor may have outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    /// What happens when the timer fires.
    pub kind: TimerKind,
    /// When it fires.
    pub deadline: Instant,
}

/// Probe/timeout state machine.
///
/// All methods take the current instant explicitly so the machine can be
/// driven by any clock. Methods that may change status return the
/// [`StatusChange`] to emit, or `None` when the status is unchanged.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    status: LinkStatus,
    acknowledged: bool,
    timer: Option<PendingTimer>,
}

impl HeartbeatMonitor {
    /// Create a monitor with unknown status and no pending timer.
    #[must_use]
    pub const fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            status: LinkStatus::Unknown,
            acknowledged: false,
            timer: None,
        }
    }

    /// Timer settings.
    #[must_use]
    pub const fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Current status.
    #[must_use]
    pub const fn link_status(&self) -> LinkStatus {
        self.status
    }

    /// Current status as a boolean.
    #[must_use]
    pub const fn status(&self) -> bool {
        self.status.is_up()
    }

    /// Whether the outstanding probe has been acknowledged.
    #[must_use]
    pub const fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// The pending timer, if any.
    #[must_use]
    pub const fn pending_timer(&self) -> Option<PendingTimer> {
        self.timer
    }

    /// Record proof of life.
    ///
    /// `has_payload` marks the outstanding probe as acknowledged. Any evidence
    /// restarts the query cycle and sets the status up.
    pub fn on_link_evidence(&mut self, has_payload: bool, now: Instant) -> Option<StatusChange> {
        if has_payload {
            self.acknowledged = true;
        }
        self.start_timer(TimerKind::Query, now);
        self.set_status(true)
    }

    /// Record a failed probe or an expired response deadline.
    ///
    /// Restarts the query cycle so the next probe goes out on normal cadence.
    pub fn on_link_failure(&mut self, now: Instant) -> Option<StatusChange> {
        self.start_timer(TimerKind::Query, now);
        self.set_status(false)
    }

    /// Prepare for a new probe: clears the acknowledgment flag.
    pub const fn begin_probe(&mut self) {
        self.acknowledged = false;
    }

    /// Record that a probe request settled.
    ///
    /// A successful request that has not been acknowledged yet arms the
    /// response timer. One that has already been acknowledged leaves the timer
    /// slot alone: evidence already restarted the query timer. A failed request
    /// is treated as link failure immediately.
    pub fn on_probe_settled(
        &mut self,
        result: Result<(), &TransportError>,
        now: Instant,
    ) -> Option<StatusChange> {
        match result {
            Ok(()) if self.acknowledged => None,
            Ok(()) => {
                self.start_timer(TimerKind::Response, now);
                None
            }
            Err(_) => self.on_link_failure(now),
        }
    }

    /// Take the pending timer if it is due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<TimerKind> {
        match self.timer {
            Some(timer) if timer.deadline <= now => {
                self.timer = None;
                Some(timer.kind)
            }
            _ => None,
        }
    }

    /// Cancel the pending timer.
    pub const fn cancel_timer(&mut self) {
        self.timer = None;
    }

    fn start_timer(&mut self, kind: TimerKind, now: Instant) {
        let delay = match kind {
            TimerKind::Query => self.config.query_interval,
            TimerKind::Response => self.config.response_timeout,
        };
        self.timer = Some(PendingTimer {
            kind,
            deadline: now + delay,
        });
    }

    fn set_status(&mut self, online: bool) -> Option<StatusChange> {
        let next = LinkStatus::from_online(online);
        if self.status == next {
            return None;
        }
        self.status = next;
        Some(StatusChange { online })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HeartbeatService
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorCommand {
    Evidence { has_payload: bool },
    Failure,
    Probe,
}

type ProbeFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// Counters from a heartbeat service run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Probes sent.
    pub probes_sent: u64,
    /// Probe requests that failed.
    pub probe_failures: u64,
    /// Response deadlines that expired.
    pub response_timeouts: u64,
    /// Evidence reports received.
    pub evidence_events: u64,
    /// Status transitions emitted.
    pub status_changes: u64,
}

/// Tokio task that owns a [`HeartbeatMonitor`].
///
/// All monitor state is touched from this one task, so commands, timer
/// expiry and probe settlement are processed strictly one at a time.
pub struct HeartbeatService {
    monitor: HeartbeatMonitor,
    transport: Arc<dyn ProbeTransport>,
    endpoint: String,
    probe: ProbeRequest,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    status_tx: watch::Sender<LinkStatus>,
    events: broadcast::Sender<StatusChange>,
    in_flight: FuturesUnordered<ProbeFuture>,
    stats: HeartbeatStats,
}

impl fmt::Debug for HeartbeatService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatService")
            .field("monitor", &self.monitor)
            .field("endpoint", &self.endpoint)
            .field("probe", &self.probe)
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl HeartbeatService {
    /// Create a service and the handle used to talk to it.
    pub fn new(
        config: HeartbeatConfig,
        transport: Arc<dyn ProbeTransport>,
        endpoint: impl Into<String>,
        probe: ProbeRequest,
    ) -> (Self, MonitorHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::Unknown);
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);

        let handle = MonitorHandle {
            commands: command_tx,
            status: status_rx,
            events: events.clone(),
        };
        let service = Self {
            monitor: HeartbeatMonitor::new(config),
            transport,
            endpoint: endpoint.into(),
            probe,
            commands,
            status_tx,
            events,
            in_flight: FuturesUnordered::new(),
            stats: HeartbeatStats::default(),
        };
        (service, handle)
    }

    /// The monitor state.
    #[must_use]
    pub const fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// Run until shutdown is signalled or every handle is dropped.
    ///
    /// In-flight probes are abandoned on exit.
    #[tracing::instrument(skip_all, fields(endpoint = %self.endpoint, pos_id = %self.probe.pos_id))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> HeartbeatStats {
        tracing::debug!("Heartbeat service started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.monitor.pending_timer().map(|timer| timer.deadline);

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        tracing::debug!("All monitor handles dropped");
                        break;
                    }
                },
                Some(result) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.settle(&result);
                }
                () = sleep_until_deadline(deadline) => self.fire_timer(),
            }
        }

        self.monitor.cancel_timer();
        tracing::info!(
            probes_sent = self.stats.probes_sent,
            probe_failures = self.stats.probe_failures,
            response_timeouts = self.stats.response_timeouts,
            status_changes = self.stats.status_changes,
            "Heartbeat service stopped"
        );
        self.stats
    }

    fn apply(&mut self, command: MonitorCommand) {
        let now = Instant::now();
        match command {
            MonitorCommand::Evidence { has_payload } => {
                self.stats.evidence_events += 1;
                tracing::trace!(has_payload, "Link evidence");
                let change = self.monitor.on_link_evidence(has_payload, now);
                self.emit(change);
            }
            MonitorCommand::Failure => {
                let change = self.monitor.on_link_failure(now);
                self.emit(change);
            }
            MonitorCommand::Probe => self.send_probe(),
        }
    }

    fn send_probe(&mut self) {
        self.monitor.begin_probe();
        self.stats.probes_sent += 1;
        tracing::debug!(message = %self.probe.message, "Sending probe");

        // A request still pending when the next probe would be due counts as failed.
        let limit = self.monitor.config().query_interval;
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        let probe = self.probe.clone();
        self.in_flight.push(Box::pin(async move {
            tokio::time::timeout(limit, transport.request(&endpoint, &probe))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::TimedOut {
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                })
        }));
    }

    fn settle(&mut self, result: &Result<(), TransportError>) {
        if let Err(err) = result {
            self.stats.probe_failures += 1;
            tracing::warn!(error = %err, "Probe request failed");
        }
        let change = self
            .monitor
            .on_probe_settled(result.as_ref().map(|_| ()), Instant::now());
        tracing::trace!(
            ok = result.is_ok(),
            acknowledged = self.monitor.acknowledged(),
            "Probe settled"
        );
        self.emit(change);
    }

    fn fire_timer(&mut self) {
        // The select arm only completes at the deadline, so the timer is due.
        let Some(kind) = self.monitor.take_due(Instant::now()) else {
            return;
        };
        tracing::debug!(timer = %kind, "Timer fired");
        match kind {
            TimerKind::Query => self.send_probe(),
            TimerKind::Response => {
                self.stats.response_timeouts += 1;
                tracing::warn!(
                    timeout_ms = u64::try_from(self.monitor.config().response_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "Probe not acknowledged before deadline"
                );
                let change = self.monitor.on_link_failure(Instant::now());
                self.emit(change);
            }
        }
    }

    fn emit(&mut self, change: Option<StatusChange>) {
        let Some(change) = change else {
            return;
        };
        self.stats.status_changes += 1;
        self.status_tx.send_replace(self.monitor.link_status());
        tracing::info!(status = %self.monitor.link_status(), "Link status changed");
        // No subscribers is fine; the watch channel still carries the status.
        let _ = self.events.send(change);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MonitorHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running [`HeartbeatService`].
///
/// Reports are fire-and-forget; once the service has stopped they are
/// dropped.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    status: watch::Receiver<LinkStatus>,
    events: broadcast::Sender<StatusChange>,
}

impl MonitorHandle {
    /// Report proof of life. `has_payload` acknowledges the outstanding probe.
    pub fn report_evidence(&self, has_payload: bool) {
        self.send(MonitorCommand::Evidence { has_payload });
    }

    /// Report that the link failed.
    pub fn report_failure(&self) {
        self.send(MonitorCommand::Failure);
    }

    /// Send a probe now instead of waiting for the query timer.
    pub fn send_probe(&self) {
        self.send(MonitorCommand::Probe);
    }

    /// Current status as a boolean.
    #[must_use]
    pub fn status(&self) -> bool {
        self.status.borrow().is_up()
    }

    /// Current status.
    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch the current status.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Subscribe to status transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    fn send(&self, command: MonitorCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(?command, "Heartbeat service stopped, dropping command");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUERY: Duration = Duration::from_secs(30);
    const RESPONSE: Duration = Duration::from_secs(5);

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            query_interval: QUERY,
            response_timeout: RESPONSE,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // HeartbeatMonitor tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn starts_unknown_without_timer() {
        let monitor = HeartbeatMonitor::new(config());
        assert_eq!(monitor.link_status(), LinkStatus::Unknown);
        assert!(!monitor.status());
        assert!(monitor.pending_timer().is_none());
    }

    #[test]
    fn evidence_sets_up_and_arms_query_timer() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());

        let change = monitor.on_link_evidence(false, now);
        assert_eq!(change, Some(StatusChange { online: true }));
        assert!(monitor.status());
        assert!(!monitor.acknowledged());
        assert_eq!(
            monitor.pending_timer(),
            Some(PendingTimer {
                kind: TimerKind::Query,
                deadline: now + QUERY,
            })
        );
    }

    #[test]
    fn repeated_evidence_changes_status_once() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());

        assert!(monitor.on_link_evidence(true, now).is_some());
        assert!(monitor.on_link_evidence(true, now + QUERY).is_none());
        assert!(monitor.on_link_evidence(false, now + QUERY * 2).is_none());
        assert_eq!(
            monitor.pending_timer().map(|t| t.deadline),
            Some(now + QUERY * 3)
        );
    }

    #[test]
    fn first_failure_from_unknown_is_a_transition() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());

        assert_eq!(
            monitor.on_link_failure(now),
            Some(StatusChange { online: false })
        );
        assert!(monitor.on_link_failure(now).is_none());
        assert_eq!(monitor.link_status(), LinkStatus::Down);
        assert_eq!(
            monitor.pending_timer().map(|t| t.kind),
            Some(TimerKind::Query)
        );
    }

    #[test]
    fn unacknowledged_settle_arms_response_timer() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());
        monitor.on_link_evidence(false, now);

        monitor.begin_probe();
        assert!(monitor.on_probe_settled(Ok(()), now).is_none());
        assert_eq!(
            monitor.pending_timer(),
            Some(PendingTimer {
                kind: TimerKind::Response,
                deadline: now + RESPONSE,
            })
        );
    }

    #[test]
    fn acknowledged_settle_keeps_query_timer() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());

        monitor.begin_probe();
        monitor.on_link_evidence(true, now);
        let before = monitor.pending_timer();

        assert!(monitor.on_probe_settled(Ok(()), now).is_none());
        assert_eq!(monitor.pending_timer(), before);
        assert_eq!(before.map(|t| t.kind), Some(TimerKind::Query));
    }

    #[test]
    fn begin_probe_clears_previous_acknowledgment() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());
        monitor.on_link_evidence(true, now);
        assert!(monitor.acknowledged());

        monitor.begin_probe();
        assert!(!monitor.acknowledged());
    }

    #[test]
    fn failed_settle_is_immediate_failure() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());
        monitor.on_link_evidence(false, now);

        let err = TransportError::Rejected("offline".into());
        assert_eq!(
            monitor.on_probe_settled(Err(&err), now),
            Some(StatusChange { online: false })
        );
        assert_eq!(
            monitor.pending_timer().map(|t| t.kind),
            Some(TimerKind::Query)
        );
    }

    #[test]
    fn take_due_respects_deadline_and_empties_slot() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());
        monitor.on_link_failure(now);

        assert_eq!(monitor.take_due(now + QUERY - Duration::from_millis(1)), None);
        assert_eq!(monitor.take_due(now + QUERY), Some(TimerKind::Query));
        assert!(monitor.pending_timer().is_none());
        assert_eq!(monitor.take_due(now + QUERY * 2), None);
    }

    #[test]
    fn new_timer_replaces_pending_one() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config());

        monitor.begin_probe();
        monitor.on_probe_settled(Ok(()), now);
        assert_eq!(
            monitor.pending_timer().map(|t| t.kind),
            Some(TimerKind::Response)
        );

        // Late acknowledgment cancels the response deadline.
        monitor.on_link_evidence(true, now + Duration::from_secs(1));
        let timer = monitor.pending_timer().expect("timer");
        assert_eq!(timer.kind, TimerKind::Query);
        assert_eq!(timer.deadline, now + Duration::from_secs(1) + QUERY);
        assert_eq!(monitor.take_due(now + RESPONSE), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Evidence(bool),
        Failure,
        Probe,
        SettleOk,
        SettleErr,
        Advance(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Evidence),
            Just(Op::Failure),
            Just(Op::Probe),
            Just(Op::SettleOk),
            Just(Op::SettleErr),
            (0_u64..90).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn changes_only_on_transitions_and_timer_never_stale(ops in prop::collection::vec(op(), 0..64)) {
            let err = TransportError::Rejected("offline".into());
            let mut now = Instant::now();
            let mut monitor = HeartbeatMonitor::new(config());
            let mut previous = monitor.link_status();

            for op in ops {
                let change = match op {
                    Op::Evidence(has_payload) => monitor.on_link_evidence(has_payload, now),
                    Op::Failure => monitor.on_link_failure(now),
                    Op::Probe => {
                        monitor.begin_probe();
                        None
                    }
                    Op::SettleOk => monitor.on_probe_settled(Ok(()), now),
                    Op::SettleErr => monitor.on_probe_settled(Err(&err), now),
                    Op::Advance(secs) => {
                        now += Duration::from_secs(secs);
                        match monitor.take_due(now) {
                            Some(TimerKind::Response) => monitor.on_link_failure(now),
                            Some(TimerKind::Query) => {
                                monitor.begin_probe();
                                None
                            }
                            None => None,
                        }
                    }
                };

                let current = monitor.link_status();
                prop_assert_eq!(change.is_some(), current != previous);
                if let Some(change) = change {
                    prop_assert_eq!(change.online, current.is_up());
                }
                if let Some(timer) = monitor.pending_timer() {
                    prop_assert!(timer.deadline > now);
                    prop_assert!(timer.deadline <= now + QUERY.max(RESPONSE));
                }
                previous = current;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // HeartbeatService tests
    // ─────────────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeTransport {
        fail: bool,
        delay: Option<Duration>,
        calls: AtomicUsize,
        bodies: Mutex<Vec<(String, ProbeRequest)>>,
    }

    #[async_trait]
    impl ProbeTransport for FakeTransport {
        async fn request(&self, endpoint: &str, body: &ProbeRequest) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((endpoint.to_string(), body.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                Err(TransportError::Rejected("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn spawn_service(
        transport: Arc<FakeTransport>,
    ) -> (
        MonitorHandle,
        watch::Sender<bool>,
        tokio::task::JoinHandle<HeartbeatStats>,
    ) {
        let (service, handle) = HeartbeatService::new(
            config(),
            transport,
            "/pos_longpolling/update",
            ProbeRequest::new("PING", "1"),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(service.run(shutdown_rx));
        (handle, shutdown_tx, join)
    }

    fn drain(events: &mut broadcast::Receiver<StatusChange>) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(change) = events.try_recv() {
            seen.push(change.online);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_probe_times_out_after_response_window() {
        let transport = Arc::new(FakeTransport::default());
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));
        let mut events = handle.subscribe();

        handle.send_probe();
        tokio::time::sleep(RESPONSE - Duration::from_millis(1)).await;
        assert_eq!(handle.link_status(), LinkStatus::Unknown);
        assert!(drain(&mut events).is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(handle.link_status(), LinkStatus::Down);
        assert_eq!(drain(&mut events), vec![false]);

        shutdown_tx.send(true).unwrap();
        let stats = join.await.unwrap();
        assert_eq!(stats.probes_sent, 1);
        assert_eq!(stats.response_timeouts, 1);
        assert_eq!(stats.status_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_flips_status_immediately() {
        let transport = Arc::new(FakeTransport {
            fail: true,
            ..FakeTransport::default()
        });
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));
        let mut events = handle.subscribe();

        handle.send_probe();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(handle.link_status(), LinkStatus::Down);
        assert_eq!(drain(&mut events), vec![false]);

        shutdown_tx.send(true).unwrap();
        let stats = join.await.unwrap();
        assert_eq!(stats.probe_failures, 1);
        assert_eq!(stats.response_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_probes_fire_one_status_event() {
        let transport = Arc::new(FakeTransport::default());
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));
        let mut events = handle.subscribe();

        for _ in 0..3 {
            handle.send_probe();
            handle.report_evidence(true);
            tokio::time::sleep(RESPONSE * 2).await;
        }

        assert!(handle.status());
        assert_eq!(drain(&mut events), vec![true]);

        shutdown_tx.send(true).unwrap();
        let stats = join.await.unwrap();
        assert_eq!(stats.probes_sent, 3);
        assert_eq!(stats.response_timeouts, 0);
        assert_eq!(stats.status_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_timer_sends_next_probe_on_cadence() {
        let transport = Arc::new(FakeTransport::default());
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));

        handle.report_evidence(false);
        tokio::time::sleep(QUERY - Duration::from_millis(1)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let bodies = transport.bodies.lock().unwrap().clone();
        assert_eq!(
            bodies,
            vec![(
                "/pos_longpolling/update".to_string(),
                ProbeRequest::new("PING", "1")
            )]
        );

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_fails_after_one_query_interval() {
        let transport = Arc::new(FakeTransport {
            delay: Some(QUERY * 100),
            ..FakeTransport::default()
        });
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));

        handle.send_probe();
        tokio::time::sleep(QUERY - Duration::from_millis(1)).await;
        assert_eq!(handle.link_status(), LinkStatus::Unknown);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(handle.link_status(), LinkStatus::Down);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // The failure restarts the cadence, so probing carries on.
        tokio::time::sleep(QUERY).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        let stats = join.await.unwrap();
        assert_eq!(stats.probe_failures, 1);
        assert_eq!(stats.response_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgment_after_failure_brings_link_back_up() {
        let transport = Arc::new(FakeTransport {
            delay: Some(RESPONSE * 3),
            ..FakeTransport::default()
        });
        let (handle, shutdown_tx, join) = spawn_service(Arc::clone(&transport));
        let mut events = handle.subscribe();

        handle.report_evidence(true);
        handle.send_probe();
        handle.report_failure();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.link_status(), LinkStatus::Down);

        // Acknowledgment for the probe arrives while its request is in flight.
        handle.report_evidence(true);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(handle.status());
        assert_eq!(drain(&mut events), vec![true, false, true]);

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn service_stops_when_handles_drop() {
        let transport: Arc<dyn ProbeTransport> = Arc::new(FakeTransport::default());
        let (service, handle) =
            HeartbeatService::new(config(), transport, "/x", ProbeRequest::new("PING", "1"));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(handle);

        let stats = service.run(shutdown_rx).await;
        assert_eq!(stats, HeartbeatStats::default());
    }
}
