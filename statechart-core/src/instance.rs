//! Running machine instances.

use crate::definition::State;
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::Machine;
use crate::subscription::{self, SubscriberList, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Upper bound on queued events processed by a single `send` or `flush`.
pub const MAX_QUEUED_EVENTS: usize = 1024;

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Instance accepts events.
    #[default]
    Active,
    /// Instance has released its subscribers and rejects all operations.
    Disposed,
}

/// The observable state of an instance at a point in time.
///
/// The context is shared, never mutated: a snapshot taken before a `send`
/// keeps its values forever, and [`Snapshot::same_context`] tells whether two
/// snapshots carry the identical context object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    state: State,
    context: Arc<Value>,
}

impl Snapshot {
    pub fn new(state: State, context: Arc<Value>) -> Self {
        Self { state, context }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns the current state name.
    pub fn value(&self) -> &str {
        self.state.as_str()
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn context_arc(&self) -> &Arc<Value> {
        &self.context
    }

    /// Returns true if the instance is in the given state.
    pub fn matches(&self, state: &str) -> bool {
        self.state.as_str() == state
    }

    /// Returns true if both snapshots share the same context object.
    pub fn same_context(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.context, &other.context)
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: VecDeque<Event>,
    closed: bool,
}

/// Queues events for an instance from places that cannot borrow it,
/// such as subscriber callbacks.
///
/// Queued events run after the current notification round completes, each
/// to completion before the next.
#[derive(Debug, Clone)]
pub struct EventSender {
    mailbox: Weak<Mutex<Mailbox>>,
}

impl EventSender {
    /// Queues an event. Returns false if the instance is gone or disposed.
    pub fn send(&self, event: impl Into<Event>) -> bool {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return false;
        };
        let mut mailbox = mailbox.lock();
        if mailbox.closed {
            return false;
        }
        mailbox.queue.push_back(event.into());
        true
    }
}

/// A running instance of a [`Machine`].
///
/// `send` takes `&mut self`, so at most one event is in flight per instance.
/// Share an instance across threads by wrapping it in a mutex.
pub struct Instance {
    machine: Machine,
    snapshot: Snapshot,
    lifecycle: InstanceState,
    subscribers: SubscriberList,
    mailbox: Arc<Mutex<Mailbox>>,
    sequence: u64,
}

impl Instance {
    pub(crate) fn new(machine: Machine, snapshot: Snapshot) -> Self {
        tracing::debug!(
            "Started instance of '{}' in state '{}'",
            machine.id(),
            snapshot.value()
        );
        Self {
            machine,
            snapshot,
            lifecycle: InstanceState::Active,
            subscribers: SubscriberList::new(),
            mailbox: Arc::new(Mutex::new(Mailbox::default())),
            sequence: 0,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn lifecycle(&self) -> InstanceState {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == InstanceState::Active
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle == InstanceState::Disposed
    }

    /// Number of transitions applied since start.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the snapshot after the most recent completed `send`.
    pub fn snapshot(&self) -> Result<Snapshot, CoreError> {
        self.ensure_active()?;
        Ok(self.snapshot.clone())
    }

    /// Sends an event and returns the resulting snapshot.
    ///
    /// Unmatched events are ignored: the snapshot stays the same and no
    /// subscriber is called. A failing guard or action leaves the instance
    /// untouched and returns the error. Events queued through an
    /// [`EventSender`] during notification are processed before returning.
    pub fn send(&mut self, event: impl Into<Event>) -> Result<Snapshot, CoreError> {
        self.ensure_active()?;
        let event = event.into();
        self.step(&event)?;
        self.drain_mailbox();
        Ok(self.snapshot.clone())
    }

    /// Processes events queued outside of a `send`.
    pub fn flush(&mut self) -> Result<Snapshot, CoreError> {
        self.ensure_active()?;
        self.drain_mailbox();
        Ok(self.snapshot.clone())
    }

    /// Returns true if `event` would be handled in the current state.
    pub fn can(&self, event: impl Into<Event>) -> Result<bool, CoreError> {
        self.ensure_active()?;
        self.machine.can(&self.snapshot, &event.into())
    }

    /// Event types with rules in the current state.
    pub fn next_events(&self) -> Result<Vec<&str>, CoreError> {
        self.ensure_active()?;
        Ok(self
            .machine
            .definition()
            .events_from(self.snapshot.value()))
    }

    /// Registers a callback invoked after every transition.
    ///
    /// The callback is not called with the current snapshot.
    pub fn subscribe<F>(&self, callback: F) -> Result<Subscription, CoreError>
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        Ok(self.subscribers.add(Arc::new(callback)))
    }

    /// Registers a callback invoked only when `selector` yields a new value.
    pub fn subscribe_select<T, S, F>(
        &self,
        selector: S,
        callback: F,
    ) -> Result<Subscription, CoreError>
    where
        T: PartialEq + Send + 'static,
        S: Fn(&Snapshot) -> T + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let initial = selector(&self.snapshot);
        Ok(self
            .subscribers
            .add(subscription::select(initial, selector, callback)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns a handle for queueing events into this instance.
    pub fn sender(&self) -> EventSender {
        EventSender {
            mailbox: Arc::downgrade(&self.mailbox),
        }
    }

    /// Releases subscribers and queued events. Idempotent.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.lifecycle = InstanceState::Disposed;
        self.subscribers.clear();

        let mut mailbox = self.mailbox.lock();
        mailbox.closed = true;
        mailbox.queue.clear();

        tracing::debug!("Disposed instance of '{}'", self.machine.id());
    }

    fn ensure_active(&self) -> Result<(), CoreError> {
        if self.is_disposed() {
            return Err(CoreError::Disposed);
        }
        Ok(())
    }

    /// Applies one event. Returns whether a rule matched.
    fn step(&mut self, event: &Event) -> Result<bool, CoreError> {
        let Some(next) = self.machine.transition(&self.snapshot, event)? else {
            tracing::trace!(
                "Ignored event '{}' in state '{}'",
                event.event_type(),
                self.snapshot.value()
            );
            return Ok(false);
        };

        tracing::debug!(
            "Transition '{}' -> '{}' on event '{}'",
            self.snapshot.value(),
            next.value(),
            event.event_type()
        );

        self.snapshot = next;
        self.sequence += 1;
        self.subscribers.notify(&self.snapshot);
        Ok(true)
    }

    fn drain_mailbox(&mut self) {
        let mut processed = 0;
        loop {
            let next = self.mailbox.lock().queue.pop_front();
            let Some(event) = next else {
                break;
            };

            if processed == MAX_QUEUED_EVENTS {
                let mut mailbox = self.mailbox.lock();
                let dropped = mailbox.queue.len() + 1;
                mailbox.queue.clear();
                tracing::error!(
                    "Dropped {} queued events for '{}': more than {} queued in one send",
                    dropped,
                    self.machine.id(),
                    MAX_QUEUED_EVENTS
                );
                break;
            }
            processed += 1;

            if let Err(e) = self.step(&event) {
                tracing::warn!(
                    "Dropped queued event '{}' for '{}': {}",
                    event.event_type(),
                    self.machine.id(),
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("machine", &self.machine.id())
            .field("snapshot", &self.snapshot)
            .field("lifecycle", &self.lifecycle)
            .field("sequence", &self.sequence)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
