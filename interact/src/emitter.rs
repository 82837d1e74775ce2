//! Outbound publishing: fire-and-forget broadcasts and confirmed enqueues.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::broker::{BrokerError, Channel, Confirmation, Connection, ExchangeKind, Properties};
use crate::entities::Pong;
use crate::envelope::{Envelope, Payload};
use crate::error::InteractError;
use crate::naming::{LIVENESS_EXCHANGE, broadcast_exchange, validate_queue_name};

#[cfg(test)]
#[path = "emitter.test.rs"]
mod tests;

pub(crate) const CONTENT_TYPE: &str = "application/json";

/// Publishes on behalf of one actor. Every operation runs on its own short-lived
/// channel, so confirmations never interleave between concurrent enqueues.
#[derive(Clone)]
pub struct Emitter {
    connection: Arc<dyn Connection>,
    actor_id: String,
    confirm_timeout: Duration,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("actor_id", &self.actor_id)
            .field("confirm_timeout", &self.confirm_timeout)
            .finish()
    }
}

impl Emitter {
    pub fn new(
        connection: Arc<dyn Connection>,
        actor_id: &str,
        confirm_timeout: Duration,
    ) -> Result<Self, InteractError> {
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
        Ok(Self {
            connection,
            actor_id: actor_id.to_string(),
            confirm_timeout,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Publishes to this actor's fan-out exchange without waiting for the broker.
    #[tracing::instrument(skip(self, notification), fields(actor_id = %self.actor_id, tag = P::TAG))]
    pub async fn broadcast<P: Payload>(&self, notification: P) -> Result<(), InteractError> {
        let body = Envelope::new(notification).to_bytes()?;
        self.publish_fanout(&broadcast_exchange(&self.actor_id), body)
            .await
    }

    /// Publishes a liveness announcement to the shared liveness exchange.
    pub(crate) async fn announce_alive(&self, pong: Pong) -> Result<(), InteractError> {
        let body = Envelope::new(pong).to_bytes()?;
        self.publish_fanout(LIVENESS_EXCHANGE, body).await
    }

    async fn publish_fanout(&self, exchange: &str, body: Bytes) -> Result<(), InteractError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(InteractError::sending)?;
        let result = async {
            channel.exchange_declare(exchange, ExchangeKind::Fanout).await?;
            channel
                .basic_publish(
                    exchange,
                    "",
                    false,
                    Properties::default().with_content_type(CONTENT_TYPE),
                    body,
                )
                .await?;
            Ok::<(), BrokerError>(())
        }
        .await;
        close(&*channel).await;
        result.map_err(|err| {
            tracing::warn!(exchange, error = %err, "Failed to broadcast");
            InteractError::sending(err)
        })
    }

    /// Publishes to a work queue and waits for the broker's verdict.
    ///
    /// An unroutable message fails with [`InteractError::Routing`], a rejected one (for
    /// example a full bounded queue) with [`InteractError::Nack`]. No verdict within the
    /// confirm timeout is a send error.
    #[tracing::instrument(skip(self, payload), fields(actor_id = %self.actor_id, tag = P::TAG))]
    pub async fn enqueue<P: Payload>(&self, queue: &str, payload: P) -> Result<(), InteractError> {
        validate_queue_name(queue)?;
        let body = Envelope::new(payload).to_bytes()?;
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(InteractError::sending)?;
        let result = self.publish_confirmed(&*channel, queue, body).await;
        close(&*channel).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "Enqueue failed");
        }
        result
    }

    async fn publish_confirmed(
        &self,
        channel: &dyn Channel,
        queue: &str,
        body: Bytes,
    ) -> Result<(), InteractError> {
        channel
            .confirm_select()
            .await
            .map_err(InteractError::sending)?;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                true,
                Properties::default().with_content_type(CONTENT_TYPE),
                body,
            )
            .await
            .map_err(InteractError::sending)?;

        match tokio::time::timeout(self.confirm_timeout, confirm).await {
            Ok(Ok(Confirmation::Ack | Confirmation::NotRequested)) => Ok(()),
            Ok(Ok(Confirmation::Returned)) => Err(InteractError::Routing {
                queue: queue.to_string(),
            }),
            Ok(Ok(Confirmation::Nack)) => Err(InteractError::Nack {
                queue: queue.to_string(),
            }),
            Ok(Err(err)) => Err(InteractError::sending(err)),
            Err(_) => Err(InteractError::Send(format!(
                "no confirmation for queue '{}' within {:?}",
                queue, self.confirm_timeout
            ))),
        }
    }
}

async fn close(channel: &dyn Channel) {
    if let Err(err) = channel.close().await {
        tracing::debug!(error = %err, "Failed to close channel");
    }
}
