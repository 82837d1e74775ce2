//! Broker transport seam.
//!
//! The runtime talks to an AMQP 0-9-1 style broker through three traits:
//! [`Connector`] opens connections, a [`Connection`] hands out channels, and a
//! [`Channel`] carries the protocol verbs. [`amqp::AmqpConnector`] reaches a real
//! broker over the network; [`memory::MemoryBroker`] implements the same semantics in
//! process.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Queue argument carrying the bounded queue length
pub const MAX_LENGTH_ARG: &str = "x-max-length";
/// Queue argument selecting the overflow behaviour of a bounded queue
pub const OVERFLOW_ARG: &str = "x-overflow";
/// Overflow behaviour that nacks publishes once the queue is full
pub const REJECT_PUBLISH: &str = "reject-publish";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Resource locked: {0}")]
    ResourceLocked(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Long(i64),
    Text(String),
}

pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueOptions {
    /// Durable, shared and persistent across consumers.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Private to the declaring connection and gone with its last consumer.
    pub fn private() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    /// Rejects publishes once `limit` messages are ready.
    pub fn bounded(mut self, limit: u32) -> Self {
        self.arguments
            .insert(MAX_LENGTH_ARG.to_string(), FieldValue::Long(limit as i64));
        self.arguments.insert(
            OVERFLOW_ARG.to_string(),
            FieldValue::Text(REJECT_PUBLISH.to_string()),
        );
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message time to live in milliseconds
    pub expiration: Option<String>,
    pub content_type: Option<String>,
}

impl Properties {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Bytes,
}

/// A registered consumer. The stream ending means the broker cancelled it.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(tag: String, deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, deliveries }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

/// Broker outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The message was mandatory and no queue accepted it.
    Returned,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Resolves once the broker settles a publish.
#[derive(Debug)]
pub struct PublisherConfirm {
    rx: oneshot::Receiver<Confirmation>,
}

impl PublisherConfirm {
    pub fn new(rx: oneshot::Receiver<Confirmation>) -> Self {
        Self { rx }
    }

    pub fn settled(confirmation: Confirmation) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(confirmation);
        Self { rx }
    }
}

impl Future for PublisherConfirm {
    type Output = Result<Confirmation, BrokerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| BrokerError::ChannelClosed))
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Why the channel or its connection closed, if it did.
    fn close_reason(&self) -> Option<String>;

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declares a queue. An empty name asks the broker to generate one.
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo, BrokerError>;

    async fn queue_declare_passive(&self, queue: &str) -> Result<QueueInfo, BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn queue_delete(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Limits unacked deliveries per consumer created afterwards on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn confirm_select(&self) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: Properties,
        body: Bytes,
    ) -> Result<PublisherConfirm, BrokerError>;

    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    fn close_reason(&self) -> Option<String>;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}
