//! Test support: an in-memory broker harness, event helpers and sample payloads.
//!
//! # Quick Start
//!
//! ```ignore
//! use crate::test_utils::prelude::*;
//!
//! #[test_log::test(tokio::test)]
//! async fn test_my_handler() {
//!     let harness = BrokerHarness::new();
//!     let server = harness.actor("2").await;
//!     let client = harness.actor("1").await;
//!
//!     server
//!         .register_rpc_handler(1, |numbers: Numbers| async move {
//!             Ok::<_, HandlerError>(Product { value: numbers.first * numbers.second })
//!         })
//!         .await
//!         .unwrap();
//!
//!     let product: Product = client.call("2", Numbers { first: 2, second: 3 }).await.unwrap();
//!     assert_eq!(product.value, 6);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::actor::Actor;
use crate::broker::{Channel, Connection, ExchangeKind, MemoryBroker, Properties, QueueOptions};
use crate::config::ActorConfig;
use crate::envelope::{FieldError, Payload};
use crate::register_payload;

pub mod prelude {
    pub use super::{
        BrokerHarness, EVENT_TIMEOUT, Notify, Numbers, Product, SkippedNotify, fast_config,
        next_event, next_matching,
    };
    pub use crate::broker::{Connection, MemoryBroker};
    pub use crate::envelope::{Envelope, Payload};
    pub use crate::error::{HandlerError, InteractError};
    pub use crate::events::{HandlerEvent, Stage};
}

/// How long event helpers wait before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns a fresh in-memory broker per test.
#[derive(Clone, Default)]
pub struct BrokerHarness {
    pub broker: MemoryBroker,
}

impl BrokerHarness {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
        }
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.broker.open_connection()
    }

    /// Actor configuration with timings scaled down for tests.
    pub fn config(&self, id: &str) -> ActorConfig {
        fast_config(id)
    }

    /// Starts an actor on its own connection, failing the test if it cannot.
    pub async fn actor(&self, id: &str) -> Actor {
        Actor::start(&self.broker, self.config(id))
            .await
            .expect("actor failed to start")
    }

    /// Declares a durable work queue.
    pub async fn declare(&self, queue: &str) {
        let channel = self.channel().await;
        channel
            .queue_declare(queue, QueueOptions::durable())
            .await
            .expect("failed to declare queue");
        let _ = channel.close().await;
    }

    /// Publishes bytes as-is, bypassing envelopes.
    pub async fn publish_raw(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let channel = self.channel().await;
        if !exchange.is_empty() {
            channel
                .exchange_declare(exchange, ExchangeKind::Fanout)
                .await
                .expect("failed to declare exchange");
        }
        channel
            .basic_publish(
                exchange,
                routing_key,
                false,
                Properties::default(),
                Bytes::copy_from_slice(body),
            )
            .await
            .expect("failed to publish");
        let _ = channel.close().await;
    }

    async fn channel(&self) -> Arc<dyn Channel> {
        self.broker
            .open_connection()
            .create_channel()
            .await
            .expect("failed to open channel")
    }
}

/// Actor configuration with timings scaled down for tests.
pub fn fast_config(id: &str) -> ActorConfig {
    ActorConfig {
        probe_timeout: Duration::from_millis(150),
        launch_window: Duration::from_millis(400),
        launch_period: Duration::from_millis(50),
        liveness_period: Duration::from_millis(100),
        rpc_timeout: Duration::from_secs(1),
        confirm_timeout: Duration::from_secs(1),
        ..ActorConfig::new("test").with_id(id)
    }
}

/// Next event on `rx`, failing the test after [`EVENT_TIMEOUT`].
pub async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Skips events until one matches `predicate`.
pub async fn next_matching<E: Clone>(
    rx: &mut broadcast::Receiver<E>,
    predicate: impl Fn(&E) -> bool,
) -> E {
    loop {
        let event = next_event(rx).await;
        if predicate(&event) {
            return event;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Numbers {
    pub first: i64,
    pub second: i64,
}

impl Payload for Numbers {
    const TAG: &'static str = "Numbers";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Product {
    pub value: i64,
}

impl Payload for Product {
    const TAG: &'static str = "Product";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notify {
    pub message: String,
}

impl Payload for Notify {
    const TAG: &'static str = "Notify";

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        FieldError::require(&mut errors, "Message", &self.message);
        errors
    }
}

/// Same shape as [`Notify`] under another tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SkippedNotify {
    pub message: String,
}

impl Payload for SkippedNotify {
    const TAG: &'static str = "SkippedNotify";
}

register_payload!(Numbers);
register_payload!(Product);
register_payload!(Notify);
register_payload!(SkippedNotify);
