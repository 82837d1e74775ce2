//! Connection-bound base shared by the queue, broadcast and rpc handlers.
//!
//! A [`HandlerBase`] owns one broker channel. Each consumer registered through it runs
//! on its own task and feeds deliveries into a [`Pipeline`]. The consumer stream ending
//! is the broker cancelling the consumer; the last one going away publishes
//! [`HandlerEvent::Stopped`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::broker::{Channel, Connection, Delivery, QueueInfo, QueueOptions};
use crate::error::{HandlerError, InteractError};
use crate::events::{EventBus, HandlerEvent};
use crate::id::Id;
use crate::naming::validate_queue_name;

/// Upper bound on consumers per handler
pub const MAX_CONCURRENCY: usize = 10;

/// A broker-bound handler owned by an actor.
#[async_trait]
pub trait Handler: Send + Sync {
    fn id(&self) -> Id;

    /// True while at least one consumer is registered with the broker.
    fn is_running(&self) -> bool;

    /// Cancels consumers, deletes private queues and closes the channel. Idempotent.
    async fn dispose(&self);
}

/// Application callback, boxed so handlers stay object safe.
pub type Callback<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, HandlerError>> + Send + Sync>;

pub fn callback<I, O, F, Fut>(f: F) -> Callback<I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
{
    Arc::new(move |input| f(input).boxed())
}

/// Runs a callback, turning both errors and panics into a failure reason.
pub(crate) async fn invoke<I, O>(callback: &Callback<I, O>, input: I) -> Result<O, String> {
    match AssertUnwindSafe(callback(input)).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_reason(panic)),
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {reason}")
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        format!("handler panicked: {reason}")
    } else {
        "handler panicked".to_string()
    }
}

pub(crate) fn check_concurrency(concurrency: usize) -> Result<(), InteractError> {
    if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
        return Err(InteractError::InvalidArgument(format!(
            "concurrency must be within 1..={MAX_CONCURRENCY}, got {concurrency}"
        )));
    }
    Ok(())
}

/// Declares a durable work queue. A positive `limit` bounds it and makes the broker
/// reject publishes once full.
pub async fn declare_queue(
    channel: &dyn Channel,
    name: &str,
    limit: u32,
) -> Result<QueueInfo, InteractError> {
    validate_queue_name(name)?;
    let mut options = QueueOptions::durable();
    if limit > 0 {
        options = options.bounded(limit);
    }
    Ok(channel.queue_declare(name, options).await?)
}

/// Per-message processing of one handler kind.
#[async_trait]
pub(crate) trait Pipeline: Send + Sync + 'static {
    async fn process(&self, delivery: Delivery);
}

pub(crate) struct HandlerBase<I, O> {
    id: Id,
    actor_id: String,
    channel: Arc<dyn Channel>,
    events: EventBus<HandlerEvent<I, O>>,
    consumers: Mutex<Vec<String>>,
    owned_queue: Mutex<Option<String>>,
    running: Arc<AtomicUsize>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    _guard: DropGuard,
}

impl<I, O> HandlerBase<I, O>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    pub async fn open(connection: &Arc<dyn Connection>, actor_id: &str) -> Result<Self, InteractError> {
        if !connection.is_open() {
            return Err(InteractError::InvalidArgument(
                "connection must be open".to_string(),
            ));
        }
        if actor_id.trim().is_empty() {
            return Err(InteractError::InvalidArgument(
                "actor id cannot be blank".to_string(),
            ));
        }
        let channel = connection
            .create_channel()
            .await
            .map_err(InteractError::Subscription)?;
        let shutdown = CancellationToken::new();
        Ok(Self {
            id: Id::new(),
            actor_id: actor_id.to_string(),
            channel,
            events: EventBus::default(),
            consumers: Mutex::new(Vec::new()),
            owned_queue: Mutex::new(None),
            running: Arc::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
            _guard: shutdown.clone().drop_guard(),
            shutdown,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn events(&self) -> &EventBus<HandlerEvent<I, O>> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent<I, O>> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst) > 0
    }

    /// Marks a queue for deletion on dispose.
    pub fn own_queue(&self, queue: &str) {
        *self.owned_queue.lock() = Some(queue.to_string());
    }

    /// Registers a consumer on `queue` and drives it on its own task.
    pub async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<(), InteractError> {
        let mut consumer = self
            .channel
            .basic_consume(queue, auto_ack)
            .await
            .map_err(InteractError::Subscription)?;
        let tag = consumer.tag().to_string();
        self.consumers.lock().push(tag.clone());

        self.running.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(actor_id = %self.actor_id, queue, consumer = %tag, "Consumer registered");
        self.events.publish(HandlerEvent::Started);

        let running = self.running.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let actor_id = self.actor_id.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    delivery = consumer.next() => match delivery {
                        Some(delivery) => pipeline.process(delivery).await,
                        None => break,
                    },
                }
            }
            let remaining = running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            tracing::debug!(actor_id = %actor_id, queue = %queue, consumer = %tag, "Consumer cancelled by broker");
            if remaining == 0 {
                events.publish(HandlerEvent::Stopped);
            }
        });
        Ok(())
    }

    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for tag in consumers {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                tracing::debug!(error = %err, consumer = %tag, "Failed to cancel consumer");
            }
        }

        let owned = self.owned_queue.lock().take();
        if let Some(queue) = owned {
            if self.channel.is_open() {
                if let Err(err) = self.channel.queue_delete(&queue).await {
                    tracing::debug!(error = %err, queue = %queue, "Failed to delete queue");
                }
            }
        }

        if let Err(err) = self.channel.close().await {
            tracing::debug!(error = %err, "Failed to close channel");
        }
        tracing::debug!(actor_id = %self.actor_id, handler = %self.id, "Handler disposed");
    }
}
