//! Lifecycle events.
//!
//! Every phase of a staleness check or recreate is announced as a pair of
//! events: `<noun>:<verb>-begin` before the work starts and
//! `<noun>:<verb>-end` (or `-error`) after it finishes. Emission is
//! fire-and-forget: [`EventPublisher::emit`] queues the event for a
//! background task and returns immediately, so a slow or failing sink can
//! never stall the operation that produced the event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::Result;

/// Flat property map carried by every event
pub type Properties = BTreeMap<String, String>;

/// Stage of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStage {
    Begin,
    End,
    Error,
}

impl std::fmt::Display for EventStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::End => write!(f, "end"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A named transition such as `container:create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub noun: &'static str,
    pub verb: &'static str,
}

impl Transition {
    pub const fn new(noun: &'static str, verb: &'static str) -> Self {
        Self { noun, verb }
    }

    /// Full event name for a stage, e.g. `container:create-begin`.
    pub fn name(&self, stage: EventStage) -> String {
        format!("{}:{}-{}", self.noun, self.verb, stage)
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.noun, self.verb)
    }
}

/// Lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event name (e.g., "container:start-end")
    pub name: String,

    /// Correlation and call-specific properties
    pub properties: Properties,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event {
    /// Create a new event
    pub fn new(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a transition event
    pub fn transition(transition: Transition, stage: EventStage, properties: Properties) -> Self {
        Self::new(transition.name(stage), properties)
    }

    /// Look up a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Ambient request-scoped properties merged into every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    properties: Properties,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, replacing any previous value for the key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Layer `other` on top of this context.
    pub fn merged(&self, other: &EventContext) -> Self {
        let mut properties = self.properties.clone();
        properties.extend(other.properties.clone());
        Self { properties }
    }

    /// Context properties overlaid with call-specific ones; call-specific win.
    pub fn resolve(&self, call: Properties) -> Properties {
        let mut properties = self.properties.clone();
        properties.extend(call);
        properties
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// Destination for published events.
///
/// Delivery failures are returned to the publisher, which logs them; they
/// never reach the caller of the operation that emitted the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

enum Command {
    Publish(Event),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking event publisher.
///
/// Owns a bounded queue drained by a single background task, so events
/// from one producer reach the sink in emission order. When the queue is
/// full the event is dropped and counted.
#[derive(Clone)]
pub struct EventPublisher {
    sender: mpsc::Sender<Command>,
    context: EventContext,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Start the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Command>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Publish(event) => {
                        let name = event.name.clone();
                        if let Err(e) = sink.publish(event).await {
                            tracing::warn!(event = %name, error = %e, "Event delivery failed");
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("Event publisher drained");
        });

        Self {
            sender,
            context: EventContext::default(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A publisher sharing this queue whose events also carry `context`.
    pub fn with_context(&self, context: &EventContext) -> Self {
        Self {
            sender: self.sender.clone(),
            context: self.context.merged(context),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// Queue a transition event. Never blocks.
    pub fn emit(&self, transition: Transition, stage: EventStage, properties: Properties) {
        let event = Event::transition(transition, stage, self.context.resolve(properties));
        self.publish(event);
    }

    /// Queue a prepared event. Never blocks.
    pub fn publish(&self, event: Event) {
        match self.sender.try_send(Command::Publish(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Command::Publish(event))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %event.name, "Event queue full, dropping event");
            }
            Err(TrySendError::Closed(Command::Publish(event))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %event.name, "Event publisher closed, dropping event");
            }
            Err(_) => {}
        }
    }

    /// Wait until everything queued before this call has been handed to the sink.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Number of events dropped because the queue was full or closed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sink fanning events out to in-process subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: Arc<broadcast::Sender<Event>>,
}

impl BroadcastSink {
    /// Create a new broadcast sink
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe to events with a filter
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: Event) -> Result<()> {
        // No subscribers is not a delivery failure.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Event stream with filtering
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
    filter: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain every matching event that is already buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.filter)(&event) => events.push(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return events,
            }
        }
    }
}

/// Sink rendering events as tracing records.
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

#[async_trait]
impl EventSink for LoggingSink {
    async fn publish(&self, event: Event) -> Result<()> {
        if event.name.ends_with("-error") {
            tracing::warn!(target: "refit::events", event = %event.name, properties = ?event.properties, "Event");
        } else {
            tracing::info!(target: "refit::events", event = %event.name, properties = ?event.properties, "Event");
        }
        Ok(())
    }
}

/// Event catalog - predefined transitions
pub mod events {
    use super::Transition;

    // Image events
    pub const IMAGE_CHECK: Transition = Transition::new("image", "check");
    pub const IMAGE_PULL: Transition = Transition::new("image", "pull");

    // Container events
    pub const CONTAINER_CREATE: Transition = Transition::new("container", "create");
    pub const CONTAINER_STOP: Transition = Transition::new("container", "stop");
    pub const CONTAINER_START: Transition = Transition::new("container", "start");
    pub const CONTAINER_REMOVE: Transition = Transition::new("container", "remove");
    pub const CONTAINER_RENAME: Transition = Transition::new("container", "rename");

    // Property keys
    pub const PROP_CONTAINER_ID: &str = "container_id";
    pub const PROP_CONTAINER_NAME: &str = "container_name";
    pub const PROP_IMAGE: &str = "image";
    pub const PROP_MESSAGE: &str = "message";
    /// Set to "true" on events of compensating actions
    pub const PROP_COMPENSATION: &str = "compensation";
}
