use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{Channel, Connection, Consumer, Properties, QueueOptions};
use crate::emitter::CONTENT_TYPE;
use crate::entities::HandlingError;
use crate::envelope::{Envelope, Payload, peek_tag};
use crate::error::InteractError;
use crate::id::Id;
use crate::naming::rpc_queue;

/// Issues requests to other actors' rpc handlers.
///
/// Each call opens its own channel and private reply queue, so calls never share
/// correlation state and can run concurrently from clones of the same client.
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<dyn Connection>,
    actor_id: String,
    default_timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("actor_id", &self.actor_id)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl RpcClient {
    pub fn new(
        connection: Arc<dyn Connection>,
        actor_id: &str,
        default_timeout: Duration,
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
        if default_timeout.is_zero() {
            return Err(InteractError::InvalidArgument(
                "rpc timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            connection,
            actor_id: actor_id.to_string(),
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends `request` to `target` and waits for its reply.
    ///
    /// The request expires in the broker after `timeout` (or the client default), so a
    /// handler that comes up late never sees it. A remote failure surfaces as
    /// [`InteractError::Handling`] carrying the remote error message.
    #[tracing::instrument(skip_all, fields(actor_id = %self.actor_id, peer = %target, tag = Req::TAG))]
    pub async fn call<Req: Payload, Resp: Payload>(
        &self,
        target: &str,
        request: Req,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Resp, InteractError> {
        if target.trim().is_empty() {
            return Err(InteractError::InvalidArgument(
                "target actor id cannot be blank".to_string(),
            ));
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(InteractError::InvalidArgument(
                "rpc timeout must be positive".to_string(),
            ));
        }
        let body = Envelope::new(request).to_bytes()?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(InteractError::sending)?;
        let result = self
            .exchange(&*channel, target, &rpc_queue(target, Req::TAG), body, timeout, cancel)
            .await;
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "Failed to close rpc channel");
        }
        if let Err(err) = &result {
            tracing::debug!(error = %err, "Rpc call failed");
        }
        result
    }

    async fn exchange<Resp: Payload>(
        &self,
        channel: &dyn Channel,
        target: &str,
        request_queue: &str,
        body: bytes::Bytes,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Resp, InteractError> {
        let reply_queue = channel
            .queue_declare("", QueueOptions::private())
            .await
            .map_err(InteractError::sending)?
            .name;
        let mut consumer = channel
            .basic_consume(&reply_queue, true)
            .await
            .map_err(InteractError::sending)?;

        let correlation_id = Id::new().to_string();
        let properties = Properties::default()
            .with_content_type(CONTENT_TYPE)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_queue.clone())
            .with_expiration(timeout.as_millis().to_string());
        // The request queue belongs to the target; routing to a missing queue just
        // drops the message and the call times out.
        channel
            .basic_publish("", request_queue, false, properties, body)
            .await
            .map_err(InteractError::sending)?;

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InteractError::Cancelled),
            reply = wait_reply(&mut consumer, channel, &correlation_id) => reply.and_then(decode_reply),
            _ = &mut deadline => Err(match self.connection.close_reason() {
                Some(reason) => InteractError::ConnectionClosed(reason),
                None => InteractError::Timeout {
                    target: target.to_string(),
                    after: timeout,
                },
            }),
        }
    }
}

/// Waits for the reply carrying `correlation_id`, skipping strays.
async fn wait_reply(
    consumer: &mut Consumer,
    channel: &dyn Channel,
    correlation_id: &str,
) -> Result<bytes::Bytes, InteractError> {
    while let Some(delivery) = consumer.next().await {
        if delivery.properties.correlation_id.as_deref() == Some(correlation_id) {
            return Ok(delivery.body);
        }
        tracing::debug!(
            correlation_id = ?delivery.properties.correlation_id,
            "Ignoring reply for another request"
        );
    }
    match channel.close_reason() {
        Some(reason) => Err(InteractError::ConnectionClosed(reason)),
        None => std::future::pending().await,
    }
}

fn decode_reply<Resp: Payload>(body: bytes::Bytes) -> Result<Resp, InteractError> {
    if peek_tag(&body)? == HandlingError::TAG {
        let error = Envelope::<HandlingError>::from_bytes(&body)?.into_payload();
        return Err(InteractError::Handling(error.error_message));
    }
    let envelope = Envelope::<Resp>::from_bytes(&body)?;
    envelope.ensure_valid()?;
    Ok(envelope.into_payload())
}
