//! Competing consumers on a named work queue.
//!
//! Each message is acknowledged once it has been decoded and validated, before the
//! callback runs. A callback failure is reported but never retried.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{Channel, Connection, Delivery};
use crate::envelope::{Envelope, Payload};
use crate::error::{HandlerError, InteractError};
use crate::events::{EventBus, Failure, HandlerEvent, Stage};
use crate::handler::{Callback, Handler, HandlerBase, Pipeline, callback, check_concurrency, invoke};
use crate::id::Id;
use crate::naming::validate_queue_name;

#[cfg(test)]
#[path = "queue.test.rs"]
mod tests;

pub type QueueEvent<P> = HandlerEvent<P, ()>;

pub struct QueueHandler<P: Payload> {
    base: HandlerBase<P, ()>,
    queue: String,
}

impl<P: Payload> std::fmt::Debug for QueueHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandler")
            .field("id", &self.base.id())
            .field("queue", &self.queue)
            .field("running", &self.base.is_running())
            .finish()
    }
}

impl<P: Payload> QueueHandler<P> {
    /// Starts `concurrency` consumers on `queue`. The queue must already exist.
    pub async fn start<F, Fut>(
        connection: &Arc<dyn Connection>,
        actor_id: &str,
        queue: &str,
        concurrency: usize,
        handler: F,
    ) -> Result<Self, InteractError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        validate_queue_name(queue)?;
        check_concurrency(concurrency)?;
        let base = HandlerBase::open(connection, actor_id).await?;
        let pipeline = Arc::new(QueuePipeline {
            actor_id: actor_id.to_string(),
            queue: queue.to_string(),
            channel: base.channel().clone(),
            events: base.events().clone(),
            callback: callback(handler),
        });
        for _ in 0..concurrency {
            if let Err(err) = base.consume(queue, false, pipeline.clone()).await {
                base.dispose().await;
                return Err(err);
            }
        }
        tracing::info!(actor_id, queue, concurrency, "Queue handler started");
        Ok(Self {
            base,
            queue: queue.to_string(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<P>> {
        self.base.subscribe()
    }
}

#[async_trait]
impl<P: Payload> Handler for QueueHandler<P> {
    fn id(&self) -> Id {
        self.base.id()
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    async fn dispose(&self) {
        self.base.dispose().await
    }
}

struct QueuePipeline<P: Payload> {
    actor_id: String,
    queue: String,
    channel: Arc<dyn Channel>,
    events: EventBus<QueueEvent<P>>,
    callback: Callback<P, ()>,
}

impl<P: Payload> QueuePipeline<P> {
    fn fail(&self, stage: Stage, reason: impl Into<String>) -> Failure<P, ()> {
        Failure::new(&self.actor_id, stage, reason)
    }

    async fn ack(&self, delivery_tag: u64, incoming: Option<&P>) -> bool {
        match self.channel.basic_ack(delivery_tag).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(queue = %self.queue, error = %err, "Failed to ack message");
                let mut failure = self.fail(Stage::Acking, err.to_string());
                failure.incoming = incoming.cloned();
                self.events.publish(HandlerEvent::Failed(failure));
                false
            }
        }
    }
}

#[async_trait]
impl<P: Payload> Pipeline for QueuePipeline<P> {
    async fn process(&self, delivery: Delivery) {
        let envelope = match Envelope::<P>::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(queue = %self.queue, error = %err, "Dropping undecodable message");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Deserializing, err.to_string())
                        .with_raw(delivery.body.clone()),
                ));
                self.ack(delivery.delivery_tag, None).await;
                return;
            }
        };

        if let Err(err) = envelope.ensure_valid() {
            tracing::warn!(queue = %self.queue, error = %err, "Dropping invalid message");
            self.events.publish(HandlerEvent::Failed(
                self.fail(Stage::Validating, err.to_string())
                    .with_raw(delivery.body.clone())
                    .with_incoming(envelope.payload.clone()),
            ));
            self.ack(delivery.delivery_tag, Some(&envelope.payload)).await;
            return;
        }

        let payload = envelope.into_payload();
        self.events.publish(HandlerEvent::Incoming {
            actor_id: self.actor_id.clone(),
            counterpart: None,
            payload: payload.clone(),
        });

        if !self.ack(delivery.delivery_tag, Some(&payload)).await {
            return;
        }

        match invoke(&self.callback, payload.clone()).await {
            Ok(()) => self.events.publish(HandlerEvent::Handled {
                actor_id: self.actor_id.clone(),
                counterpart: None,
                payload,
            }),
            Err(reason) => {
                tracing::error!(queue = %self.queue, error = %reason, "Queue handler failed");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Handling, reason).with_incoming(payload),
                ));
            }
        }
    }
}
