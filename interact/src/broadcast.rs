//! Fan-out subscriptions.
//!
//! Every subscriber binds its own exclusive, server-named queue to the source's
//! fan-out exchange, so each one receives every broadcast. Deliveries are auto-acked:
//! anything published while a subscriber is down is lost to it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{Connection, Delivery, ExchangeKind, QueueOptions};
use crate::envelope::{Envelope, Payload};
use crate::error::{HandlerError, InteractError};
use crate::events::{EventBus, Failure, HandlerEvent, Stage};
use crate::handler::{Callback, Handler, HandlerBase, Pipeline, callback, invoke};
use crate::id::Id;
use crate::naming::broadcast_exchange;

#[cfg(test)]
#[path = "broadcast.test.rs"]
mod tests;

pub type BroadcastEvent<P> = HandlerEvent<P, ()>;

pub struct BroadcastHandler<P: Payload> {
    base: HandlerBase<P, ()>,
    exchange: String,
    queue: String,
}

impl<P: Payload> std::fmt::Debug for BroadcastHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHandler")
            .field("id", &self.base.id())
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("running", &self.base.is_running())
            .finish()
    }
}

impl<P: Payload> BroadcastHandler<P> {
    /// Subscribes `actor_id` to broadcasts published by `source_actor_id`.
    pub async fn start<F, Fut>(
        connection: &Arc<dyn Connection>,
        actor_id: &str,
        source_actor_id: &str,
        handler: F,
    ) -> Result<Self, InteractError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if source_actor_id.trim().is_empty() {
            return Err(InteractError::InvalidArgument(
                "broadcasting actor id cannot be blank".to_string(),
            ));
        }
        Self::listen(
            connection,
            actor_id,
            &broadcast_exchange(source_actor_id),
            Some(source_actor_id.to_string()),
            callback(handler),
        )
        .await
    }

    /// Subscribes to an arbitrary fan-out exchange.
    pub(crate) async fn listen(
        connection: &Arc<dyn Connection>,
        actor_id: &str,
        exchange: &str,
        counterpart: Option<String>,
        callback: Callback<P, ()>,
    ) -> Result<Self, InteractError> {
        let base = HandlerBase::open(connection, actor_id).await?;
        match Self::bind(&base, exchange, counterpart, callback).await {
            Ok(queue) => {
                tracing::debug!(actor_id, exchange, queue = %queue, "Broadcast handler started");
                Ok(Self {
                    base,
                    exchange: exchange.to_string(),
                    queue,
                })
            }
            Err(err) => {
                base.dispose().await;
                Err(err)
            }
        }
    }

    async fn bind(
        base: &HandlerBase<P, ()>,
        exchange: &str,
        counterpart: Option<String>,
        callback: Callback<P, ()>,
    ) -> Result<String, InteractError> {
        let channel = base.channel();
        channel
            .exchange_declare(exchange, ExchangeKind::Fanout)
            .await
            .map_err(InteractError::Subscription)?;
        let queue = channel
            .queue_declare("", QueueOptions::private())
            .await
            .map_err(InteractError::Subscription)?
            .name;
        base.own_queue(&queue);
        channel
            .queue_bind(&queue, exchange, "")
            .await
            .map_err(InteractError::Subscription)?;

        let pipeline = Arc::new(BroadcastPipeline {
            actor_id: base.actor_id().to_string(),
            counterpart,
            events: base.events().clone(),
            callback,
        });
        base.consume(&queue, true, pipeline).await?;
        Ok(queue)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Server generated name of this subscriber's private queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent<P>> {
        self.base.subscribe()
    }
}

#[async_trait]
impl<P: Payload> Handler for BroadcastHandler<P> {
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

struct BroadcastPipeline<P: Payload> {
    actor_id: String,
    counterpart: Option<String>,
    events: EventBus<BroadcastEvent<P>>,
    callback: Callback<P, ()>,
}

impl<P: Payload> BroadcastPipeline<P> {
    fn fail(&self, stage: Stage, reason: impl Into<String>) -> Failure<P, ()> {
        Failure::new(&self.actor_id, stage, reason).with_counterpart(self.counterpart.clone())
    }
}

#[async_trait]
impl<P: Payload> Pipeline for BroadcastPipeline<P> {
    async fn process(&self, delivery: Delivery) {
        let envelope = match Envelope::<P>::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(exchange = %delivery.exchange, error = %err, "Dropping undecodable broadcast");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Deserializing, err.to_string())
                        .with_raw(delivery.body),
                ));
                return;
            }
        };

        if let Err(err) = envelope.ensure_valid() {
            tracing::debug!(exchange = %delivery.exchange, error = %err, "Dropping invalid broadcast");
            self.events.publish(HandlerEvent::Failed(
                self.fail(Stage::Validating, err.to_string())
                    .with_raw(delivery.body)
                    .with_incoming(envelope.payload),
            ));
            return;
        }

        let payload = envelope.into_payload();
        self.events.publish(HandlerEvent::Incoming {
            actor_id: self.actor_id.clone(),
            counterpart: self.counterpart.clone(),
            payload: payload.clone(),
        });

        match invoke(&self.callback, payload.clone()).await {
            Ok(()) => self.events.publish(HandlerEvent::Handled {
                actor_id: self.actor_id.clone(),
                counterpart: self.counterpart.clone(),
                payload,
            }),
            Err(reason) => {
                tracing::error!(exchange = %delivery.exchange, error = %reason, "Broadcast handler failed");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Handling, reason).with_incoming(payload),
                ));
            }
        }
    }
}
