//! Commonly used types and traits.
//!
//! Import this module to start an actor and register handlers.

pub use super::actor::Actor; // Connection, identity and handler registry
pub use super::broadcast::BroadcastHandler; // Fan-out subscriptions
pub use super::broker::{
    AmqpConnector, // Networked AMQP broker
    Connection,    // Open broker connection
    Connector,     // Opens connections
    MemoryBroker,  // In-process broker
};
pub use super::config::ActorConfig; // Identity and timings
pub use super::emitter::Emitter; // Broadcasts and confirmed enqueues
pub use super::entities::{ActorIdentity, Ping, Pong}; // Runtime payloads
pub use super::envelope::{Envelope, FieldError, Payload}; // Wire wrapper and payload contract
pub use super::error::{HandlerError, InteractError, StartConflict};
pub use super::events::{HandlerEvent, Stage}; // Per-handler event stream
pub use super::handler::Handler; // Lifecycle shared by every handler
pub use super::id::Id; // An identifier type used for handlers and launches.
pub use super::liveness::LivenessWatcher;
pub use super::queue::QueueHandler; // Competing consumers
pub use super::register_payload;
pub use super::rpc::{RpcClient, RpcHandler}; // Request/reply
pub use super::schema::SchemaRegistry;
pub use super::ttl_set::{ExpiringSet, SetEvent};
