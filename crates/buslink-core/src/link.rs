//! Link composition.
//!
//! Wires one [`HeartbeatService`] and one [`Dispatcher`] together: the probe
//! channel's callback acknowledges probes and every other recognised
//! notification counts as evidence of life. The two loops share no state and
//! only talk through the monitor handle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{NotificationBatch, NotificationBus};
use crate::config::LinkConfig;
use crate::cursor::CursorStore;
use crate::dispatch::{ChannelHandler, DispatchStats, Dispatcher, DispatcherHandle, FaultReporter};
use crate::error::{ConfigError, HandlerError, LinkResult};
use crate::heartbeat::{HeartbeatService, HeartbeatStats, LinkStatus, MonitorHandle, StatusChange};
use crate::transport::{ProbeRequest, ProbeTransport};

/// A heartbeat monitor and channel dispatcher ready to be started.
///
/// Channels registered here are subscribed on the bus when [`Self::start`]
/// activates the dispatcher.
#[derive(Debug)]
pub struct LongpollingLink<B, S> {
    config: LinkConfig,
    service: HeartbeatService,
    monitor: MonitorHandle,
    dispatcher: Dispatcher<B, S, MonitorHandle>,
}

impl<B, S> LongpollingLink<B, S>
where
    B: NotificationBus + 'static,
    S: CursorStore + 'static,
{
    /// Validate `config` and build both components.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the config fails validation.
    pub fn new(
        config: LinkConfig,
        bus: B,
        store: S,
        transport: Arc<dyn ProbeTransport>,
    ) -> LinkResult<Self> {
        config.validate().map_err(ConfigError::Invalid)?;

        let (service, monitor) = HeartbeatService::new(
            config.heartbeat(),
            transport,
            config.probe_endpoint.clone(),
            ProbeRequest::new(config.probe_message.clone(), config.scope_id.clone()),
        );

        let mut dispatcher = Dispatcher::from_config(&config, bus, store, monitor.clone());
        let ack = monitor.clone();
        dispatcher.register_channel(
            config.probe_channel.clone(),
            move |payload: &Value| -> Result<(), HandlerError> {
                ack.report_evidence(carries_payload(payload));
                Ok(())
            },
        );

        Ok(Self {
            config,
            service,
            monitor,
            dispatcher,
        })
    }

    /// Builder: set the fault reporter used by the dispatcher.
    #[must_use]
    pub fn with_fault_reporter(mut self, faults: Arc<dyn FaultReporter>) -> Self {
        self.dispatcher = self.dispatcher.with_fault_reporter(faults);
        self
    }

    /// Link configuration.
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Monitor handle, usable before the link starts.
    pub const fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Register an application channel.
    pub fn register_channel(&mut self, name: impl Into<String>, handler: impl ChannelHandler + 'static) {
        self.dispatcher.register_channel(name, handler);
    }

    /// Activate the dispatcher and spawn both loops on the current runtime.
    ///
    /// `batches` is the stream of notification batches emitted by the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be loaded or the bus fails to
    /// start polling. Nothing is spawned in that case.
    pub fn start(mut self, batches: mpsc::Receiver<NotificationBatch>) -> LinkResult<LinkHandles> {
        self.dispatcher.activate()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatcher, commands) = DispatcherHandle::channel();

        let heartbeat_task = tokio::spawn(self.service.run(shutdown_rx.clone()));
        let dispatch_task = tokio::spawn(self.dispatcher.run(batches, commands, shutdown_rx));

        tracing::info!(
            tenant = %self.config.tenant,
            scope = %self.config.scope_id,
            probe_channel = %self.config.probe_channel,
            "Link started"
        );

        Ok(LinkHandles {
            monitor: self.monitor,
            dispatcher,
            shutdown,
            heartbeat_task,
            dispatch_task,
        })
    }
}

/// Whether a probe channel payload acknowledges the outstanding probe.
///
/// Null, `false`, zero and the empty string do not.
fn carries_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Counters from both loops of a stopped link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Heartbeat counters.
    pub heartbeat: HeartbeatStats,
    /// Dispatch counters.
    pub dispatch: DispatchStats,
}

/// Handles to a running link.
#[derive(Debug)]
pub struct LinkHandles {
    monitor: MonitorHandle,
    dispatcher: DispatcherHandle,
    shutdown: watch::Sender<bool>,
    heartbeat_task: JoinHandle<HeartbeatStats>,
    dispatch_task: JoinHandle<DispatchStats>,
}

impl LinkHandles {
    /// Monitor handle.
    pub const fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Dispatcher handle for registry changes while running.
    pub const fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Current connectivity status as a boolean.
    #[must_use]
    pub fn status(&self) -> bool {
        self.monitor.status()
    }

    /// Current connectivity status.
    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.monitor.link_status()
    }

    /// Subscribe to status transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.monitor.subscribe()
    }

    /// Signal both loops to stop and wait for them.
    pub async fn shutdown(self) -> LinkStats {
        let _ = self.shutdown.send(true);

        let heartbeat = self.heartbeat_task.await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "Heartbeat task failed");
            HeartbeatStats::default()
        });
        let dispatch = self.dispatch_task.await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "Dispatch task failed");
            DispatchStats::default()
        });

        tracing::info!("Link stopped");
        LinkStats { heartbeat, dispatch }
    }
}
