//! The actor: one connection, one identity and the handlers registered under it.
//!
//! Starting an actor claims its id on the broker. Two checks guard the claim:
//!
//! - a self-ping catches an instance that is already fully running;
//! - for a launch window the actor keeps broadcasting a [`LaunchNotification`] to its
//!   own broadcast exchange while listening there. Seeing a foreign notification that
//!   started earlier means another instance is launching concurrently, and this one
//!   backs off.
//!
//! The second check is time bounded. If broker latency exceeds the window, two
//! instances can both succeed.
//!
//! Once started, the actor announces itself on `who_alive` every liveness period
//! until disposed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastHandler;
use crate::broker::{Connection, Connector, QueueInfo};
use crate::config::ActorConfig;
use crate::emitter::Emitter;
use crate::entities::{ActorIdentity, LaunchNotification, Ping, Pong};
use crate::envelope::Payload;
use crate::error::{HandlerError, InteractError, StartConflict};
use crate::handler::{self, Handler};
use crate::id::Id;
use crate::liveness::LivenessWatcher;
use crate::queue::QueueHandler;
use crate::rpc::{RpcClient, RpcHandler};
use crate::schema::{Inspection, SchemaRegistry};

#[cfg(test)]
#[path = "actor.test.rs"]
mod tests;

pub struct Actor {
    identity: ActorIdentity,
    config: ActorConfig,
    connection: Arc<dyn Connection>,
    emitter: Emitter,
    rpc: RpcClient,
    schemas: Mutex<SchemaRegistry>,
    handlers: Mutex<HashMap<Id, Arc<dyn Handler>>>,
    liveness: CancellationToken,
    disposed: AtomicBool,
}

impl Actor {
    /// Connects through `connector` and claims the configured id.
    pub async fn start(connector: &dyn Connector, config: ActorConfig) -> Result<Self, InteractError> {
        config.validate()?;
        let connection = connector.connect().await?;
        Self::launch(connection, config).await
    }

    /// Claims the configured id over an existing connection. The actor takes ownership
    /// of the connection and closes it on dispose.
    pub async fn start_with_connection(
        connection: Arc<dyn Connection>,
        config: ActorConfig,
    ) -> Result<Self, InteractError> {
        config.validate()?;
        Self::launch(connection, config).await
    }

    #[tracing::instrument(skip_all, fields(kind = %config.kind))]
    async fn launch(connection: Arc<dyn Connection>, config: ActorConfig) -> Result<Self, InteractError> {
        let identity = config.identity();
        let emitter = Emitter::new(connection.clone(), &identity.id, config.confirm_timeout)?;
        let rpc = RpcClient::new(connection.clone(), &identity.id, config.rpc_timeout)?;
        let schemas = SchemaRegistry::from_inventory()?;

        let actor = Self {
            identity,
            config,
            connection,
            emitter,
            rpc,
            schemas: Mutex::new(schemas),
            handlers: Mutex::new(HashMap::new()),
            liveness: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        };

        if let Err(err) = actor.claim_identity().await {
            tracing::warn!(actor_id = %actor.identity.id, error = %err, "Actor failed to start");
            actor.dispose().await;
            return Err(err);
        }
        actor.spawn_liveness();
        tracing::info!(actor = %actor.identity, "Actor started");
        Ok(actor)
    }

    async fn claim_identity(&self) -> Result<(), InteractError> {
        let id = self.identity.id.clone();

        if self.occupied(&id).await? {
            return Err(InteractError::AlreadyStarted {
                id,
                conflict: StartConflict::Running,
            });
        }

        let identity = self.identity.clone();
        self.register_rpc_handler(1, move |_: Ping| {
            let pong = Pong::now(identity.clone());
            async move { Ok::<_, HandlerError>(pong) }
        })
        .await?;

        let own = LaunchNotification {
            launch_id: Id::new(),
            started_at: Utc::now(),
        };
        let (tx, mut rx) = mpsc::channel(1);
        let listener = {
            let own = own.clone();
            BroadcastHandler::start(&self.connection, &id, &id, move |notice: LaunchNotification| {
                if notice.launch_id != own.launch_id {
                    if own.yields_to(&notice) {
                        let _ = tx.try_send(notice.launch_id);
                    } else {
                        tracing::debug!(launch = %notice.launch_id, "Later launch observed");
                    }
                }
                async { Ok::<_, HandlerError>(()) }
            })
            .await?
        };

        let stop = CancellationToken::new();
        let announcer = self.spawn_announcer(own, stop.clone());
        let raced = tokio::time::timeout(self.config.launch_window, rx.recv()).await;
        stop.cancel();
        if let Err(err) = announcer.await {
            tracing::debug!(error = %err, "Launch announcer ended abnormally");
        }
        listener.dispose().await;

        match raced {
            Ok(Some(rival)) => {
                tracing::warn!(actor_id = %id, %rival, "Concurrent launch detected");
                Err(InteractError::AlreadyStarted {
                    id,
                    conflict: StartConflict::Launching,
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether anything serves pings for `id`. Any reply, even an error, means the id
    /// is taken.
    async fn occupied(&self, id: &str) -> Result<bool, InteractError> {
        let result = self
            .rpc
            .call::<Ping, Pong>(id, Ping::now(), Some(self.config.probe_timeout), None)
            .await;
        match result {
            Ok(_) | Err(InteractError::Handling(_)) | Err(InteractError::Validation(_)) => Ok(true),
            Err(InteractError::Timeout { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn spawn_announcer(&self, notice: LaunchNotification, stop: CancellationToken) -> JoinHandle<()> {
        let emitter = self.emitter.clone();
        let period = self.config.launch_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = emitter.broadcast(notice.clone()).await {
                            tracing::warn!(error = %err, "Failed to announce launch");
                        }
                    }
                }
            }
        })
    }

    fn spawn_liveness(&self) {
        let emitter = self.emitter.clone();
        let identity = self.identity.clone();
        let period = self.config.liveness_period;
        let stop = self.liveness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = emitter.announce_alive(Pong::now(identity.clone())).await {
                            tracing::debug!(error = %err, "Failed to announce liveness");
                        }
                    }
                }
            }
        });
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<(), InteractError> {
        if self.is_disposed() {
            return Err(InteractError::ConnectionClosed(format!(
                "actor '{}' is disposed",
                self.identity.id
            )));
        }
        Ok(())
    }

    /// Publishes `notification` to every subscriber of this actor's broadcasts.
    pub async fn broadcast<P: Payload>(&self, notification: P) -> Result<(), InteractError> {
        self.ensure_active()?;
        self.emitter.broadcast(notification).await
    }

    /// Publishes `payload` to the work queue `queue`, waiting for the broker to accept it.
    pub async fn enqueue<P: Payload>(&self, queue: &str, payload: P) -> Result<(), InteractError> {
        self.ensure_active()?;
        self.emitter.enqueue(queue, payload).await
    }

    /// Calls `target` with the configured rpc timeout.
    pub async fn call<Req: Payload, Resp: Payload>(
        &self,
        target: &str,
        request: Req,
    ) -> Result<Resp, InteractError> {
        self.call_with(target, request, None, None).await
    }

    /// Calls `target`, optionally overriding the timeout and watching `cancel`.
    pub async fn call_with<Req: Payload, Resp: Payload>(
        &self,
        target: &str,
        request: Req,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Resp, InteractError> {
        self.ensure_active()?;
        self.rpc.call(target, request, timeout, cancel).await
    }

    /// Whether `target` answers a ping within `timeout`. No answer is `false`, not an error.
    pub async fn ping(&self, target: &str, timeout: Option<Duration>) -> Result<bool, InteractError> {
        let ping = Ping::now();
        match self
            .rpc
            .call::<Ping, Pong>(target, ping.clone(), timeout, None)
            .await
        {
            Ok(pong) => Ok(pong.answers(target, &ping)),
            Err(InteractError::Timeout { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Decodes an envelope of any schema this actor knows and reports its validation
    /// errors.
    pub fn inspect(&self, bytes: &[u8]) -> Result<Inspection, InteractError> {
        self.schemas.lock().inspect(bytes)
    }

    fn register_schema<P: Payload>(&self) -> Result<(), InteractError> {
        self.schemas.lock().register::<P>()
    }

    fn track(&self, handler: Arc<dyn Handler>) -> Id {
        let id = handler.id();
        self.handlers.lock().insert(id, handler);
        id
    }

    /// Serves `Req` requests addressed to this actor with up to `concurrency` workers.
    pub async fn register_rpc_handler<Req, Resp, F, Fut>(
        &self,
        concurrency: usize,
        handler: F,
    ) -> Result<Arc<RpcHandler<Req, Resp>>, InteractError>
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.ensure_active()?;
        self.register_schema::<Req>()?;
        self.register_schema::<Resp>()?;
        let handler = Arc::new(
            RpcHandler::start(&self.connection, &self.identity.id, concurrency, handler).await?,
        );
        self.track(handler.clone());
        Ok(handler)
    }

    /// Subscribes to broadcasts published by `source_actor_id`.
    pub async fn register_broadcast_handler<P, F, Fut>(
        &self,
        source_actor_id: &str,
        handler: F,
    ) -> Result<Arc<BroadcastHandler<P>>, InteractError>
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.ensure_active()?;
        self.register_schema::<P>()?;
        let handler = Arc::new(
            BroadcastHandler::start(&self.connection, &self.identity.id, source_actor_id, handler)
                .await?,
        );
        self.track(handler.clone());
        Ok(handler)
    }

    /// Consumes the existing work queue `queue` with up to `concurrency` workers.
    pub async fn register_queue_handler<P, F, Fut>(
        &self,
        queue: &str,
        concurrency: usize,
        handler: F,
    ) -> Result<Arc<QueueHandler<P>>, InteractError>
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.ensure_active()?;
        self.register_schema::<P>()?;
        let handler = Arc::new(
            QueueHandler::start(&self.connection, &self.identity.id, queue, concurrency, handler)
                .await?,
        );
        self.track(handler.clone());
        Ok(handler)
    }

    /// Watches `who_alive`. Entries expire after `ttl`, three liveness periods by default.
    pub async fn watch_liveness(
        &self,
        ttl: Option<Duration>,
    ) -> Result<Arc<LivenessWatcher>, InteractError> {
        self.ensure_active()?;
        let ttl = ttl.unwrap_or(self.config.liveness_period * 3);
        let watcher =
            Arc::new(LivenessWatcher::start(&self.connection, &self.identity.id, ttl).await?);
        self.track(watcher.clone());
        Ok(watcher)
    }

    /// Disposes one registered handler. Returns `false` if the id is unknown.
    pub async fn stop_handler(&self, id: Id) -> bool {
        let handler = self.handlers.lock().remove(&id);
        match handler {
            Some(handler) => {
                handler.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Declares a durable work queue, bounded when `limit` is positive.
    pub async fn declare_queue(&self, name: &str, limit: u32) -> Result<QueueInfo, InteractError> {
        self.ensure_active()?;
        let channel = self.connection.create_channel().await?;
        let result = handler::declare_queue(&*channel, name, limit).await;
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "Failed to close channel");
        }
        result
    }

    /// Number of ready messages in `queue`.
    pub async fn message_count(&self, queue: &str) -> Result<u32, InteractError> {
        self.ensure_active()?;
        let channel = self.connection.create_channel().await?;
        let result = channel.queue_declare_passive(queue).await;
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "Failed to close channel");
        }
        Ok(result?.message_count)
    }

    /// Stops announcing liveness, disposes every handler and closes the connection.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.liveness.cancel();

        let handlers: Vec<Arc<dyn Handler>> =
            self.handlers.lock().drain().map(|(_, handler)| handler).collect();
        for handler in handlers {
            handler.dispose().await;
        }

        if let Err(err) = self.connection.close().await {
            tracing::debug!(error = %err, "Failed to close connection");
        }
        tracing::info!(actor_id = %self.identity.id, "Actor disposed");
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.liveness.cancel();
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("identity", &self.identity)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
