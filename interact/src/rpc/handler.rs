use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{Channel, Connection, Delivery, Properties, QueueOptions};
use crate::emitter::CONTENT_TYPE;
use crate::entities::HandlingError;
use crate::envelope::{Envelope, Payload};
use crate::error::{HandlerError, InteractError};
use crate::events::{EventBus, Failure, HandlerEvent, Stage};
use crate::handler::{Callback, Handler, HandlerBase, Pipeline, callback, check_concurrency, invoke};
use crate::id::Id;
use crate::naming::rpc_queue;

pub type RpcEvent<Req, Resp> = HandlerEvent<Req, Resp>;

/// Serves `Req` requests addressed to one actor.
///
/// `concurrency` consumers share the request queue, each with a prefetch of one, so up
/// to `concurrency` requests are handled at once and no two workers hold the same one.
pub struct RpcHandler<Req: Payload, Resp: Payload> {
    base: HandlerBase<Req, Resp>,
    queue: String,
}

impl<Req: Payload, Resp: Payload> std::fmt::Debug for RpcHandler<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandler")
            .field("id", &self.base.id())
            .field("queue", &self.queue)
            .field("running", &self.base.is_running())
            .finish()
    }
}

impl<Req: Payload, Resp: Payload> RpcHandler<Req, Resp> {
    pub async fn start<F, Fut>(
        connection: &Arc<dyn Connection>,
        actor_id: &str,
        concurrency: usize,
        handler: F,
    ) -> Result<Self, InteractError>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        check_concurrency(concurrency)?;
        let base = HandlerBase::open(connection, actor_id).await?;
        let queue = rpc_queue(actor_id, Req::TAG);
        if let Err(err) = Self::serve(&base, &queue, concurrency, callback(handler)).await {
            base.dispose().await;
            return Err(err);
        }
        tracing::info!(actor_id, queue = %queue, concurrency, "Rpc handler started");
        Ok(Self { base, queue })
    }

    async fn serve(
        base: &HandlerBase<Req, Resp>,
        queue: &str,
        concurrency: usize,
        callback: Callback<Req, Resp>,
    ) -> Result<(), InteractError> {
        let channel = base.channel();
        channel
            .queue_declare(queue, QueueOptions::default())
            .await
            .map_err(InteractError::Subscription)?;
        channel
            .basic_qos(1)
            .await
            .map_err(InteractError::Subscription)?;

        let pipeline = Arc::new(RpcPipeline {
            actor_id: base.actor_id().to_string(),
            channel: channel.clone(),
            events: base.events().clone(),
            callback,
        });
        for _ in 0..concurrency {
            base.consume(queue, false, pipeline.clone()).await?;
        }
        Ok(())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent<Req, Resp>> {
        self.base.subscribe()
    }
}

#[async_trait]
impl<Req: Payload, Resp: Payload> Handler for RpcHandler<Req, Resp> {
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

struct RpcPipeline<Req: Payload, Resp: Payload> {
    actor_id: String,
    channel: Arc<dyn Channel>,
    events: EventBus<RpcEvent<Req, Resp>>,
    callback: Callback<Req, Resp>,
}

impl<Req: Payload, Resp: Payload> RpcPipeline<Req, Resp> {
    fn fail(&self, stage: Stage, reason: impl Into<String>) -> Failure<Req, Resp> {
        Failure::new(&self.actor_id, stage, reason)
    }

    async fn ack(&self, delivery_tag: u64, request: Option<&Req>) {
        if !self.channel.is_open() {
            return;
        }
        if let Err(err) = self.channel.basic_ack(delivery_tag).await {
            tracing::error!(error = %err, "Failed to ack rpc request");
            let mut failure = self.fail(Stage::Acking, err.to_string());
            failure.incoming = request.cloned();
            self.events.publish(HandlerEvent::Failed(failure));
        }
    }

    /// Runs the callback, or explains why it was not run.
    async fn respond(&self, envelope: Envelope<Req>) -> Result<Resp, HandlingError> {
        if let Err(err) = envelope.ensure_valid() {
            tracing::warn!(error = %err, "Rejecting invalid rpc request");
            self.events.publish(HandlerEvent::Failed(
                self.fail(Stage::Validating, err.to_string())
                    .with_incoming(envelope.payload),
            ));
            return Err(HandlingError::new(format!("invalid rpc request: {err}")));
        }

        let request = envelope.into_payload();
        self.events.publish(HandlerEvent::Incoming {
            actor_id: self.actor_id.clone(),
            counterpart: None,
            payload: request.clone(),
        });
        invoke(&self.callback, request.clone())
            .await
            .map_err(|reason| {
                tracing::error!(error = %reason, "Rpc handler failed");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Handling, reason.clone())
                        .with_incoming(request),
                ));
                if reason.trim().is_empty() {
                    HandlingError::new("rpc handler failed")
                } else {
                    HandlingError::new(reason)
                }
            })
    }
}

#[async_trait]
impl<Req: Payload, Resp: Payload> Pipeline for RpcPipeline<Req, Resp> {
    async fn process(&self, delivery: Delivery) {
        let envelope = match Envelope::<Req>::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping undecodable rpc request");
                self.events.publish(HandlerEvent::Failed(
                    self.fail(Stage::Deserializing, err.to_string())
                        .with_raw(delivery.body.clone()),
                ));
                self.ack(delivery.delivery_tag, None).await;
                return;
            }
        };
        let request = envelope.payload.clone();
        let response = self.respond(envelope).await;

        let body = match &response {
            Ok(response) => Envelope::new(response.clone()).to_bytes(),
            Err(error) => Envelope::new(error.clone()).to_bytes(),
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize rpc response");
                let mut failure = self
                    .fail(Stage::Serializing, err.to_string())
                    .with_incoming(request.clone());
                failure.outgoing = response.ok();
                self.events.publish(HandlerEvent::Failed(failure));
                self.ack(delivery.delivery_tag, Some(&request)).await;
                return;
            }
        };

        let mut properties = Properties::default().with_content_type(CONTENT_TYPE);
        properties.correlation_id = delivery.properties.correlation_id.clone();
        let sent = match delivery.properties.reply_to.as_deref() {
            Some(reply_to) => self
                .channel
                .basic_publish("", reply_to, false, properties, body)
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
            None => Err("request carries no reply address".to_string()),
        };

        match (sent, response) {
            (Ok(()), Ok(response)) => self.events.publish(HandlerEvent::Responded {
                actor_id: self.actor_id.clone(),
                request: request.clone(),
                response,
            }),
            (Ok(()), Err(_)) => {}
            (Err(reason), response) => {
                tracing::warn!(error = %reason, "Failed to send rpc response");
                let mut failure = self
                    .fail(Stage::Sending, reason)
                    .with_incoming(request.clone());
                failure.outgoing = response.ok();
                self.events.publish(HandlerEvent::Failed(failure));
            }
        }

        self.ack(delivery.delivery_tag, Some(&request)).await;
    }
}
