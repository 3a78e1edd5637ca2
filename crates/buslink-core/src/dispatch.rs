//! Channel registry and notification dispatch.
//!
//! The [`Dispatcher`] owns the mapping from application channel names to
//! callbacks and is the only component that drives the bus. Every recognised
//! notification counts as evidence of life for the heartbeat monitor; faults
//! raised by callbacks are isolated per entry and reported through a
//! [`FaultReporter`].

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::bus::{NotificationBatch, NotificationBus};
use crate::channel::ChannelNamer;
use crate::config::{DEFAULT_CURSOR_KEY, LinkConfig};
use crate::cursor::{Cursor, CursorStore};
use crate::error::{BusError, DispatchFault, HandlerError, LinkResult};
use crate::heartbeat::MonitorHandle;

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator traits
// ─────────────────────────────────────────────────────────────────────────────

/// Callback invoked with the payload of every notification on its channel.
pub trait ChannelHandler: Send {
    /// Handle one payload.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the payload could not be handled. The error
    /// is reported and dispatch continues with the next entry.
    fn handle(&mut self, payload: &Value) -> Result<(), HandlerError>;
}

impl<F> ChannelHandler for F
where
    F: FnMut(&Value) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, payload: &Value) -> Result<(), HandlerError> {
        self(payload)
    }
}

/// Sink for liveness signals produced by dispatch.
pub trait Liveness: Send {
    /// Record proof of life. `has_payload` acknowledges the outstanding probe.
    fn record_evidence(&self, has_payload: bool);

    /// Ask for a probe to be sent now.
    fn request_probe(&self);
}

impl Liveness for MonitorHandle {
    fn record_evidence(&self, has_payload: bool) {
        self.report_evidence(has_payload);
    }

    fn request_probe(&self) {
        self.send_probe();
    }
}

impl<T: Liveness + Sync + ?Sized> Liveness for Arc<T> {
    fn record_evidence(&self, has_payload: bool) {
        (**self).record_evidence(has_payload);
    }

    fn request_probe(&self) {
        (**self).request_probe();
    }
}

/// Error surface for faults observed during dispatch.
pub trait FaultReporter: Send + Sync {
    /// Report one fault.
    fn report(&self, fault: &DispatchFault);
}

impl<T: FaultReporter + ?Sized> FaultReporter for Arc<T> {
    fn report(&self, fault: &DispatchFault) {
        (**self).report(fault);
    }
}

/// Reports faults as `tracing` error events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFaultReporter;

impl FaultReporter for TracingFaultReporter {
    fn report(&self, fault: &DispatchFault) {
        match fault.channel() {
            Some(channel) => tracing::error!(channel, error = %fault, "Channel callback fault"),
            None => tracing::error!(error = %fault, "Dispatch fault"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one processed notification batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Entries whose callback completed successfully.
    pub delivered: usize,
    /// Entries skipped as unknown traffic.
    pub skipped: usize,
    /// Faults reported while processing the batch.
    pub faults: usize,
    /// Cursor after the batch.
    pub cursor: Cursor,
    /// Whether the cursor was persisted.
    pub cursor_saved: bool,
}

/// Counters from a dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Batches processed.
    pub batches: u64,
    /// Entries delivered to callbacks.
    pub delivered: u64,
    /// Entries skipped as unknown traffic.
    pub skipped: u64,
    /// Faults reported.
    pub faults: u64,
}

impl DispatchStats {
    fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.delivered += report.delivered as u64;
        self.skipped += report.skipped as u64;
        self.faults += report.faults as u64;
    }
}

/// Routes bus notifications to registered channel callbacks.
///
/// Inactive until [`Dispatcher::activate`]. While inactive, registration only
/// touches local bookkeeping; subscriptions are applied to the bus on
/// activation.
pub struct Dispatcher<B, S, L> {
    namer: ChannelNamer,
    handlers: HashMap<String, Box<dyn ChannelHandler>>,
    subscribed: HashSet<String>,
    bus: B,
    store: S,
    liveness: L,
    faults: Arc<dyn FaultReporter>,
    cursor_key: String,
    cursor: Cursor,
    active: bool,
    debug: bool,
}

impl<B, S, L> fmt::Debug for Dispatcher<B, S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        channels.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("namer", &self.namer)
            .field("channels", &channels)
            .field("cursor_key", &self.cursor_key)
            .field("cursor", &self.cursor)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<B, S, L> Dispatcher<B, S, L>
where
    B: NotificationBus,
    S: CursorStore,
    L: Liveness,
{
    /// Create an inactive dispatcher with no channels.
    pub fn new(namer: ChannelNamer, bus: B, store: S, liveness: L) -> Self {
        Self {
            namer,
            handlers: HashMap::new(),
            subscribed: HashSet::new(),
            bus,
            store,
            liveness,
            faults: Arc::new(TracingFaultReporter),
            cursor_key: DEFAULT_CURSOR_KEY.to_string(),
            cursor: Cursor::ZERO,
            active: false,
            debug: false,
        }
    }

    /// Create a dispatcher for a link config.
    pub fn from_config(config: &LinkConfig, bus: B, store: S, liveness: L) -> Self {
        Self::new(
            ChannelNamer::new(config.tenant.clone(), config.scope_id.clone()),
            bus,
            store,
            liveness,
        )
        .with_cursor_key(config.cursor_key.clone())
        .with_debug(config.debug)
    }

    /// Builder: set the fault reporter.
    #[must_use]
    pub fn with_fault_reporter(mut self, faults: Arc<dyn FaultReporter>) -> Self {
        self.faults = faults;
        self
    }

    /// Builder: set the cursor persistence key.
    #[must_use]
    pub fn with_cursor_key(mut self, key: impl Into<String>) -> Self {
        self.cursor_key = key.into();
        self
    }

    /// Builder: log every dispatched payload at debug level.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Channel namer.
    pub const fn namer(&self) -> &ChannelNamer {
        &self.namer
    }

    /// Check if [`Self::activate`] has completed.
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Last cursor loaded or processed.
    pub const fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Check if a channel name has a callback.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// The bus this dispatcher drives.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Register or replace the callback for a channel.
    ///
    /// Subscribes on the bus right away if the dispatcher is active.
    pub fn register_channel(&mut self, name: impl Into<String>, handler: impl ChannelHandler + 'static) {
        self.register_boxed(name.into(), Box::new(handler));
    }

    fn register_boxed(&mut self, name: String, handler: Box<dyn ChannelHandler>) {
        let replaced = self.handlers.insert(name.clone(), handler).is_some();
        tracing::debug!(channel = %name, replaced, active = self.active, "Channel registered");
        if self.active {
            self.subscribe(&name);
        }
    }

    /// Remove the callback for a channel. Returns `false` if it was unknown.
    ///
    /// Unsubscribes on the bus if the channel was subscribed.
    pub fn unregister_channel(&mut self, name: &str) -> bool {
        if self.handlers.remove(name).is_none() {
            return false;
        }
        let key = self.namer.qualify(name).to_key();
        if self.subscribed.remove(&key) {
            self.bus.remove_channel(&key);
        }
        tracing::debug!(channel = name, "Channel unregistered");
        true
    }

    fn subscribe(&mut self, name: &str) {
        let key = self.namer.qualify(name).to_key();
        if self.subscribed.insert(key.clone()) {
            self.bus.add_channel(&key);
        }
    }

    /// Start dispatching.
    ///
    /// Loads the persisted cursor into the bus, subscribes every registered
    /// channel, starts polling and requests an immediate probe. Calling it on
    /// an active dispatcher does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be loaded or polling cannot be
    /// started. The dispatcher stays inactive with no channels left
    /// subscribed, and activation may be retried.
    pub fn activate(&mut self) -> LinkResult<()> {
        if self.active {
            tracing::debug!("Dispatcher already active");
            return Ok(());
        }

        let cursor = self.store.load(&self.cursor_key, Cursor::ZERO)?;
        self.cursor = cursor;
        self.bus.set_cursor(cursor);
        self.bus.stop_polling();

        let names: Vec<String> = self.handlers.keys().cloned().collect();
        for name in &names {
            self.subscribe(name);
        }
        if let Err(err) = self.bus.start_polling() {
            // Inactive again: registry changes stay local until the next attempt.
            for key in self.subscribed.drain() {
                self.bus.remove_channel(&key);
            }
            return Err(err.into());
        }

        self.active = true;
        tracing::info!(
            cursor = cursor.value(),
            channels = names.len(),
            tenant = self.namer.tenant(),
            scope = self.namer.scope(),
            "Dispatcher activated"
        );
        self.liveness.request_probe();
        Ok(())
    }

    /// Process one batch delivered by the bus.
    ///
    /// Entries are handled strictly in order. Unknown traffic is skipped.
    /// Every recognised entry reports link evidence before its callback runs;
    /// callback errors and panics are reported and never stop the batch. The
    /// cursor is persisted once after the whole batch.
    pub fn handle_notification_batch(&mut self, batch: &NotificationBatch) -> BatchReport {
        let mut report = BatchReport::default();

        for entry in &batch.entries {
            let Some(name) = self.namer.unqualify(&entry.channel) else {
                tracing::trace!(channel = %entry.channel, "Skipping foreign notification");
                report.skipped += 1;
                continue;
            };
            let Some(handler) = self.handlers.get_mut(&name) else {
                tracing::trace!(channel = %name, "Skipping unregistered channel");
                report.skipped += 1;
                continue;
            };

            self.liveness.record_evidence(false);
            if self.debug {
                tracing::debug!(channel = %name, payload = %entry.payload, "Dispatching notification");
            }

            let fault = match catch_unwind(AssertUnwindSafe(|| handler.handle(&entry.payload))) {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(DispatchFault::Callback {
                    channel: name,
                    error,
                }),
                Err(panic) => Some(DispatchFault::Panicked {
                    channel: name,
                    message: panic_message(panic.as_ref()),
                }),
            };
            match fault {
                None => report.delivered += 1,
                Some(fault) => {
                    report.faults += 1;
                    self.faults.report(&fault);
                }
            }
        }

        self.cursor.advance_to(batch.last);
        report.cursor = self.cursor;
        match self.store.save(&self.cursor_key, self.cursor) {
            Ok(()) => report.cursor_saved = true,
            Err(error) => {
                report.faults += 1;
                self.faults.report(&DispatchFault::CursorPersist {
                    key: self.cursor_key.clone(),
                    error,
                });
            }
        }

        tracing::debug!(
            entries = batch.len(),
            delivered = report.delivered,
            skipped = report.skipped,
            faults = report.faults,
            cursor = report.cursor.value(),
            "Batch processed"
        );
        report
    }

    fn apply(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Register { name, handler } => self.register_boxed(name, handler),
            DispatcherCommand::Unregister { name } => {
                self.unregister_channel(&name);
            }
        }
    }

    /// Process batches and commands until shutdown or until the batch stream
    /// closes. Stops bus polling on exit.
    pub async fn run(
        mut self,
        mut batches: mpsc::Receiver<NotificationBatch>,
        mut commands: mpsc::UnboundedReceiver<DispatcherCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut commands_open = true;
        tracing::debug!(channels = self.handlers.len(), "Dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.apply(command),
                    None => commands_open = false,
                },
                batch = batches.recv() => match batch {
                    Some(batch) => {
                        let report = self.handle_notification_batch(&batch);
                        stats.record(&report);
                    }
                    None => {
                        tracing::debug!("Batch stream closed");
                        break;
                    }
                },
            }
        }

        self.bus.stop_polling();
        tracing::info!(
            batches = stats.batches,
            delivered = stats.delivered,
            faults = stats.faults,
            cursor = self.cursor.value(),
            "Dispatch loop stopped"
        );
        stats
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DispatcherHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Registry change sent to a running dispatcher.
pub enum DispatcherCommand {
    /// Register or replace a channel callback.
    Register {
        /// Channel name.
        name: String,
        /// Callback.
        handler: Box<dyn ChannelHandler>,
    },
    /// Remove a channel callback.
    Unregister {
        /// Channel name.
        name: String,
    },
}

impl fmt::Debug for DispatcherCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { name, .. } => f.debug_struct("Register").field("name", name).finish_non_exhaustive(),
            Self::Unregister { name } => f.debug_struct("Unregister").field("name", name).finish(),
        }
    }
}

/// Cloneable handle for changing the registry of a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    /// Create a handle and the receiver to pass to [`Dispatcher::run`].
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatcherCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    /// Register or replace a channel callback.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if the dispatch loop has stopped.
    pub fn register_channel(
        &self,
        name: impl Into<String>,
        handler: impl ChannelHandler + 'static,
    ) -> Result<(), BusError> {
        self.send(DispatcherCommand::Register {
            name: name.into(),
            handler: Box::new(handler),
        })
    }

    /// Remove a channel callback.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if the dispatch loop has stopped.
    pub fn unregister_channel(&self, name: impl Into<String>) -> Result<(), BusError> {
        self.send(DispatcherCommand::Unregister { name: name.into() })
    }

    fn send(&self, command: DispatcherCommand) -> Result<(), BusError> {
        self.commands.send(command).map_err(|_| BusError::Closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, NotificationEntry};
    use crate::cursor::InMemoryCursorStore;
    use crate::error::StoreError;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Signals {
        evidence: Mutex<Vec<bool>>,
        probes: AtomicUsize,
    }

    impl Liveness for Signals {
        fn record_evidence(&self, has_payload: bool) {
            self.evidence.lock().unwrap().push(has_payload);
        }

        fn request_probe(&self) {
            self.probes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Faults(Mutex<Vec<String>>);

    impl FaultReporter for Faults {
        fn report(&self, fault: &DispatchFault) {
            self.0.lock().unwrap().push(fault.to_string());
        }
    }

    struct FailingStore;

    impl CursorStore for FailingStore {
        fn load(&self, _key: &str, default: Cursor) -> Result<Cursor, StoreError> {
            Ok(default)
        }

        fn save(&self, _key: &str, _cursor: Cursor) -> Result<(), StoreError> {
            Err(StoreError::Poisoned("read-only".into()))
        }
    }

    type Log = Arc<Mutex<Vec<(String, Value)>>>;

    fn recorder(name: &'static str, log: &Log) -> impl ChannelHandler + 'static {
        let log = Arc::clone(log);
        move |payload: &Value| -> Result<(), HandlerError> {
            log.lock().unwrap().push((name.to_string(), payload.clone()));
            Ok(())
        }
    }

    struct Fixture {
        bus: Arc<InMemoryBus>,
        store: Arc<InMemoryCursorStore>,
        signals: Arc<Signals>,
        faults: Arc<Faults>,
        dispatcher: Dispatcher<Arc<InMemoryBus>, Arc<InMemoryCursorStore>, Arc<Signals>>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryCursorStore::new());
        let signals = Arc::new(Signals::default());
        let faults = Arc::new(Faults::default());
        let dispatcher = Dispatcher::new(
            ChannelNamer::new("shop", "1"),
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&signals),
        )
        .with_fault_reporter(faults.clone());
        Fixture {
            bus,
            store,
            signals,
            faults,
            dispatcher,
        }
    }

    fn key(name: &str) -> String {
        ChannelNamer::new("shop", "1").qualify(name).to_key()
    }

    fn entry(name: &str, payload: Value) -> NotificationEntry {
        NotificationEntry::new(key(name), payload)
    }

    #[test]
    fn registration_before_activation_is_deferred() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("pos.order", recorder("order", &log));

        assert!(fx.dispatcher.is_registered("pos.order"));
        assert!(fx.bus.channels().is_empty());

        fx.dispatcher.activate().unwrap();
        assert_eq!(fx.bus.channels(), vec![key("pos.order")]);
        assert!(fx.bus.is_polling());
        assert_eq!(fx.signals.probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_after_activation_subscribes_immediately() {
        let mut fx = fixture();
        fx.dispatcher.activate().unwrap();

        let log = Log::default();
        fx.dispatcher.register_channel("pos.order", recorder("order", &log));
        assert!(fx.bus.is_subscribed(&key("pos.order")));

        // Overwriting keeps a single subscription.
        fx.dispatcher.register_channel("pos.order", recorder("order2", &log));
        assert_eq!(fx.bus.add_calls(&key("pos.order")), 1);
    }

    #[test]
    fn activate_twice_subscribes_once() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.dispatcher.register_channel("b", recorder("b", &log));

        fx.dispatcher.activate().unwrap();
        fx.dispatcher.activate().unwrap();

        assert_eq!(fx.bus.add_calls(&key("a")), 1);
        assert_eq!(fx.bus.add_calls(&key("b")), 1);
        assert_eq!(fx.bus.start_calls(), 1);
        assert_eq!(fx.signals.probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn activate_loads_persisted_cursor() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryCursorStore::with_value("bus_last", Cursor(41)));
        let mut dispatcher = Dispatcher::new(
            ChannelNamer::new("shop", "1"),
            Arc::clone(&bus),
            store,
            Arc::new(Signals::default()),
        );
        dispatcher.activate().unwrap();
        assert_eq!(bus.cursor(), Cursor(41));
        assert_eq!(dispatcher.cursor(), Cursor(41));
    }

    #[test]
    fn failed_start_leaves_dispatcher_inactive_and_retryable() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.bus.fail_start_with("no session");

        assert!(fx.dispatcher.activate().is_err());
        assert!(!fx.dispatcher.is_active());
        assert_eq!(fx.signals.probes.load(Ordering::SeqCst), 0);

        assert!(fx.bus.channels().is_empty());

        assert!(fx.dispatcher.activate().is_err());
        assert!(fx.bus.channels().is_empty());
    }

    #[test]
    fn registry_changes_after_failed_activation_stay_local() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.dispatcher.register_channel("b", recorder("b", &log));
        fx.bus.fail_start_with("no session");
        assert!(fx.dispatcher.activate().is_err());

        assert!(fx.dispatcher.unregister_channel("b"));
        fx.dispatcher.register_channel("c", recorder("c", &log));
        assert!(fx.bus.channels().is_empty());
        assert_eq!(fx.bus.add_calls(&key("c")), 0);

        fx.bus.allow_start();
        fx.dispatcher.activate().unwrap();
        assert_eq!(fx.bus.channels(), vec![key("a"), key("c")]);
        assert!(fx.bus.is_polling());
    }

    #[test]
    fn unregister_removes_subscription() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.dispatcher.activate().unwrap();

        assert!(fx.dispatcher.unregister_channel("a"));
        assert!(!fx.bus.is_subscribed(&key("a")));
        assert!(!fx.dispatcher.unregister_channel("a"));
        assert!(!fx.dispatcher.unregister_channel("never"));
    }

    #[test]
    fn batch_routes_known_entries_in_order() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.dispatcher.register_channel("b", recorder("b", &log));
        fx.dispatcher.activate().unwrap();

        let batch = NotificationBatch::new(
            vec![
                entry("a", json!("x")),
                entry("unknown", json!("y")),
                entry("b", json!("z")),
            ],
            Cursor(17),
        );
        let report = fx.dispatcher.handle_notification_batch(&batch);

        assert_eq!(
            *log.lock().unwrap(),
            vec![("a".to_string(), json!("x")), ("b".to_string(), json!("z"))]
        );
        assert_eq!(
            report,
            BatchReport {
                delivered: 2,
                skipped: 1,
                faults: 0,
                cursor: Cursor(17),
                cursor_saved: true,
            }
        );
        assert_eq!(fx.store.save_count(), 1);
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(17)));
        assert_eq!(*fx.signals.evidence.lock().unwrap(), vec![false, false]);
    }

    #[test]
    fn failing_callback_does_not_stop_batch() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher
            .register_channel("a", |_: &Value| -> Result<(), HandlerError> {
                Err(HandlerError::new("bad order"))
            });
        fx.dispatcher.register_channel("b", recorder("b", &log));
        fx.dispatcher.activate().unwrap();

        let batch = NotificationBatch::new(
            vec![entry("a", json!("x")), entry("unknown", json!("y")), entry("b", json!("z"))],
            Cursor(5),
        );
        let report = fx.dispatcher.handle_notification_batch(&batch);

        assert_eq!(*log.lock().unwrap(), vec![("b".to_string(), json!("z"))]);
        assert_eq!(report.faults, 1);
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(5)));
        assert_eq!(
            *fx.faults.0.lock().unwrap(),
            vec!["Channel a callback failed: bad order".to_string()]
        );
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher
            .register_channel("a", |_: &Value| -> Result<(), HandlerError> { panic!("boom") });
        fx.dispatcher.register_channel("b", recorder("b", &log));
        fx.dispatcher.activate().unwrap();

        let batch = NotificationBatch::new(vec![entry("a", json!(1)), entry("b", json!(2))], Cursor(6));
        let report = fx.dispatcher.handle_notification_batch(&batch);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.faults, 1);
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(6)));
        assert_eq!(
            *fx.faults.0.lock().unwrap(),
            vec!["Channel a callback panicked: boom".to_string()]
        );

        // The panicking handler stays registered.
        assert!(fx.dispatcher.is_registered("a"));
        let again = NotificationBatch::new(vec![entry("a", json!(3))], Cursor(7));
        assert_eq!(fx.dispatcher.handle_notification_batch(&again).faults, 1);
    }

    #[test]
    fn foreign_scope_is_unknown_traffic() {
        let mut fx = fixture();
        let log = Log::default();
        fx.dispatcher.register_channel("a", recorder("a", &log));
        fx.dispatcher.activate().unwrap();

        let foreign = ChannelNamer::new("shop", "2").qualify("a").to_key();
        let batch = NotificationBatch::new(
            vec![
                NotificationEntry::new(foreign, json!("x")),
                NotificationEntry::new(json!(42), json!("y")),
            ],
            Cursor(3),
        );
        let report = fx.dispatcher.handle_notification_batch(&batch);

        assert_eq!(report.skipped, 2);
        assert!(log.lock().unwrap().is_empty());
        assert!(fx.signals.evidence.lock().unwrap().is_empty());
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(3)));
    }

    #[test]
    fn cursor_never_regresses() {
        let mut fx = fixture();
        fx.dispatcher.activate().unwrap();

        fx.dispatcher
            .handle_notification_batch(&NotificationBatch::new(Vec::new(), Cursor(20)));
        let report = fx
            .dispatcher
            .handle_notification_batch(&NotificationBatch::new(Vec::new(), Cursor(8)));

        assert_eq!(report.cursor, Cursor(20));
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(20)));
        assert_eq!(fx.store.save_count(), 2);
    }

    #[test]
    fn cursor_save_failure_is_reported() {
        let faults = Arc::new(Faults::default());
        let mut dispatcher = Dispatcher::new(
            ChannelNamer::new("shop", "1"),
            Arc::new(InMemoryBus::new()),
            FailingStore,
            Signals::default(),
        )
        .with_fault_reporter(faults.clone());
        dispatcher.activate().unwrap();

        let report = dispatcher.handle_notification_batch(&NotificationBatch::new(Vec::new(), Cursor(2)));
        assert!(!report.cursor_saved);
        assert_eq!(report.faults, 1);
        assert_eq!(
            *faults.0.lock().unwrap(),
            vec!["Failed to persist cursor under bus_last: Cursor store poisoned: read-only".to_string()]
        );
    }

    #[test]
    fn from_config_uses_cursor_key() {
        let config = LinkConfig::new("shop", "9").with_cursor_key("custom_last");
        let store = Arc::new(InMemoryCursorStore::new());
        let mut dispatcher = Dispatcher::from_config(
            &config,
            Arc::new(InMemoryBus::new()),
            Arc::clone(&store),
            Signals::default(),
        );
        dispatcher.activate().unwrap();
        dispatcher.handle_notification_batch(&NotificationBatch::new(Vec::new(), Cursor(4)));

        assert_eq!(dispatcher.namer().scope(), "9");
        assert_eq!(store.get("custom_last"), Some(Cursor(4)));
    }

    #[test]
    fn panic_message_formats() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn run_applies_commands_then_batches_and_stops_polling() {
        let mut fx = fixture();
        fx.dispatcher.activate().unwrap();

        let (handle, commands) = DispatcherHandle::channel();
        let (batch_tx, batches) = mpsc::channel(8);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let log = Log::default();
        handle.register_channel("a", recorder("a", &log)).unwrap();
        batch_tx
            .send(NotificationBatch::new(vec![entry("a", json!("hi"))], Cursor(9)))
            .await
            .unwrap();
        drop(batch_tx);

        let bus = Arc::clone(&fx.bus);
        let stats = fx.dispatcher.run(batches, commands, shutdown).await;

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec![("a".to_string(), json!("hi"))]);
        assert!(bus.is_subscribed(&key("a")));
        assert!(!bus.is_polling());
        assert_eq!(fx.store.get("bus_last"), Some(Cursor(9)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = fixture();
        let (handle, commands) = DispatcherHandle::channel();
        let (_batch_tx, batches) = mpsc::channel(1);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let join = tokio::spawn(fx.dispatcher.run(batches, commands, shutdown));
        shutdown_tx.send(true).unwrap();

        assert_eq!(join.await.unwrap(), DispatchStats::default());
        assert!(matches!(
            handle.unregister_channel("a"),
            Err(BusError::Closed)
        ));
    }
}
