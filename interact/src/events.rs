//! Per-handler event streams.
//!
//! Every handler owns an [`EventBus`] and publishes [`HandlerEvent`]s as messages move
//! through its pipeline. Observers call `subscribe()` on the handler and receive every
//! event published after that point.
//!
//! Stage sets per handler kind:
//! - queue and broadcast handlers: `Incoming`, `Handled`, `Failed`
//! - rpc handlers: `Incoming` (the request), `Responded`, `Failed`
//!
//! All kinds also publish `Started` and `Stopped` as their consumers come and go.

use bytes::Bytes;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Pipeline stage at which a message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Deserializing,
    Validating,
    Handling,
    Serializing,
    Sending,
    Acking,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Deserializing => "deserializing",
            Stage::Validating => "validating",
            Stage::Handling => "handling",
            Stage::Serializing => "serializing",
            Stage::Sending => "sending",
            Stage::Acking => "acking",
        };
        f.write_str(label)
    }
}

/// A message that failed somewhere in a handler pipeline.
#[derive(Debug, Clone)]
pub struct Failure<I, O> {
    pub actor_id: String,
    /// Actor on the other side, when known
    pub counterpart: Option<String>,
    pub stage: Stage,
    pub reason: String,
    /// Body as received, kept when decoding failed
    pub raw: Option<Bytes>,
    pub incoming: Option<I>,
    pub outgoing: Option<O>,
}

impl<I, O> Failure<I, O> {
    pub fn new(actor_id: &str, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            counterpart: None,
            stage,
            reason: reason.into(),
            raw: None,
            incoming: None,
            outgoing: None,
        }
    }

    pub fn with_counterpart(mut self, counterpart: Option<String>) -> Self {
        self.counterpart = counterpart;
        self
    }

    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_incoming(mut self, incoming: I) -> Self {
        self.incoming = Some(incoming);
        self
    }

    pub fn with_outgoing(mut self, outgoing: O) -> Self {
        self.outgoing = Some(outgoing);
        self
    }
}

/// Structured record of what a handler did with one message.
#[derive(Debug, Clone)]
pub enum HandlerEvent<I, O = ()> {
    /// A consumer registered while the handler was running.
    Started,
    /// The broker cancelled the last running consumer.
    Stopped,
    /// A message decoded and is about to reach the application callback.
    Incoming {
        actor_id: String,
        counterpart: Option<String>,
        payload: I,
    },
    /// The application callback returned successfully.
    Handled {
        actor_id: String,
        counterpart: Option<String>,
        payload: I,
    },
    /// An rpc reply was published.
    Responded {
        actor_id: String,
        request: I,
        response: O,
    },
    Failed(Failure<I, O>),
}

impl<I, O> HandlerEvent<I, O> {
    pub fn failure(&self) -> Option<&Failure<I, O>> {
        match self {
            HandlerEvent::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Broadcast channel for handler events.
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Errors are ignored if there are no active subscribers.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
