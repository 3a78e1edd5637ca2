//! Buslink - heartbeat liveness and channel dispatch over a long-poll bus
//!
//! This crate provides:
//!
//! - **Heartbeat**: probe/timeout state machine with a single pending timer
//! - **Dispatch**: channel registry routing bus notifications to callbacks
//! - **Cursor**: replay position persistence across restarts
//! - **Link**: composition of both loops on a tokio runtime
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use buslink_core::{JsonRpcProbeTransport, LinkConfig, LongpollingLink};
//!
//! let config = LinkConfig::from_file("link.toml")?;
//! let transport = JsonRpcProbeTransport::new(base_url, config.response_timeout())?;
//!
//! let mut link = LongpollingLink::new(config, bus, store, Arc::new(transport))?;
//! link.register_channel("pos.order", |payload: &Value| {
//!     println!("order update: {payload}");
//!     Ok(())
//! });
//!
//! let handles = link.start(batches)?;
//! let mut changes = handles.subscribe();
//! while let Ok(change) = changes.recv().await {
//!     println!("link online: {}", change.online);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod channel;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod telemetry;
pub mod transport;

pub use bus::{InMemoryBus, NotificationBatch, NotificationBus, NotificationEntry};
pub use channel::{ChannelNamer, QualifiedChannel};
pub use config::LinkConfig;
pub use cursor::{Cursor, CursorStore, FileCursorStore, InMemoryCursorStore};
pub use dispatch::{
    BatchReport, ChannelHandler, DispatchStats, Dispatcher, DispatcherCommand, DispatcherHandle,
    FaultReporter, Liveness, TracingFaultReporter,
};
pub use error::*;
pub use heartbeat::{
    HeartbeatConfig, HeartbeatMonitor, HeartbeatService, HeartbeatStats, LinkStatus, MonitorHandle,
    PendingTimer, StatusChange, TimerKind,
};
pub use link::{LinkHandles, LinkStats, LongpollingLink};
pub use telemetry::{LogFormat, TelemetryError, init_tracing};
pub use transport::{JsonRpcProbeTransport, ProbeRequest, ProbeTransport};
