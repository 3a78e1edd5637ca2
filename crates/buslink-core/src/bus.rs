//! Notification bus collaborator.
//!
//! The long-poll bus owns the connection and its polling loop. This crate only
//! drives it through [`NotificationBus`] and consumes the batches it emits.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::BusError;

/// One `(channel, payload)` pair of a notification batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    /// Qualified channel identifier, either an array or its JSON string.
    pub channel: Value,
    /// Notification payload.
    pub payload: Value,
}

impl NotificationEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(channel: impl Into<Value>, payload: impl Into<Value>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Ordered notifications delivered by one poll, with the bus's `last` cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    /// Entries in delivery order.
    pub entries: Vec<NotificationEntry>,
    /// Bus cursor after this batch.
    pub last: Cursor,
}

impl NotificationBatch {
    /// Create a batch.
    #[must_use]
    pub const fn new(entries: Vec<NotificationEntry>, last: Cursor) -> Self {
        Self { entries, last }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Operations the dispatcher needs from the long-poll bus.
pub trait NotificationBus: Send {
    /// Subscribe a qualified channel key.
    fn add_channel(&mut self, channel: &str);

    /// Unsubscribe a qualified channel key.
    fn remove_channel(&mut self, channel: &str);

    /// Set the replay position the next poll starts from.
    fn set_cursor(&mut self, cursor: Cursor);

    /// Start the polling loop.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if polling cannot be started.
    fn start_polling(&mut self) -> Result<(), BusError>;

    /// Stop the polling loop. Stopping an idle bus is a no-op.
    fn stop_polling(&mut self);
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    channels: BTreeSet<String>,
    add_calls: HashMap<String, usize>,
    cursor: Cursor,
    polling: bool,
    start_calls: usize,
    fail_start: Option<String>,
}

/// In-memory bus for tests and local development.
///
/// Records subscriptions instead of talking to a server. `Arc<InMemoryBus>`
/// is the bus handle; keep a clone to inspect state after handing one to a
/// dispatcher.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    state: Mutex<InMemoryBusState>,
}

impl InMemoryBus {
    /// Create an idle bus with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start_polling` calls fail with `reason`.
    pub fn fail_start_with(&self, reason: impl Into<String>) {
        self.lock().fail_start = Some(reason.into());
    }

    /// Let `start_polling` succeed again after [`Self::fail_start_with`].
    pub fn allow_start(&self) {
        self.lock().fail_start = None;
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryBusState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Currently subscribed channel keys, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.lock().channels.iter().cloned().collect()
    }

    /// Check if a channel key is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock().channels.contains(channel)
    }

    /// Number of times `add_channel` was called for a key.
    #[must_use]
    pub fn add_calls(&self, channel: &str) -> usize {
        self.lock().add_calls.get(channel).copied().unwrap_or(0)
    }

    /// Replay position last set on the bus.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.lock().cursor
    }

    /// Check if the polling loop is running.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.lock().polling
    }

    /// Number of successful `start_polling` calls.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }
}

/// The bus is only handed out shared, so tests keep a handle for inspection.
impl NotificationBus for Arc<InMemoryBus> {
    fn add_channel(&mut self, channel: &str) {
        let mut state = self.lock();
        state.channels.insert(channel.to_string());
        *state.add_calls.entry(channel.to_string()).or_default() += 1;
    }

    fn remove_channel(&mut self, channel: &str) {
        self.lock().channels.remove(channel);
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        self.lock().cursor = cursor;
    }

    fn start_polling(&mut self) -> Result<(), BusError> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_start.clone() {
            return Err(BusError::StartFailed(reason));
        }
        state.polling = true;
        state.start_calls += 1;
        Ok(())
    }

    fn stop_polling(&mut self) {
        self.lock().polling = false;
    }
}
