//! Passive observation of liveness announcements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broadcast::BroadcastHandler;
use crate::broker::Connection;
use crate::entities::{ActorIdentity, Pong};
use crate::error::{HandlerError, InteractError};
use crate::handler::{Handler, callback};
use crate::id::Id;
use crate::naming::LIVENESS_EXCHANGE;
use crate::ttl_set::{ExpiringSet, SetEvent};

#[cfg(test)]
#[path = "liveness.test.rs"]
mod tests;

/// Tracks which actors announced themselves on `who_alive` within the last `ttl`.
pub struct LivenessWatcher {
    listener: BroadcastHandler<Pong>,
    alive: Arc<ExpiringSet<ActorIdentity>>,
}

impl std::fmt::Debug for LivenessWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessWatcher")
            .field("listener", &self.listener)
            .field("alive", &self.alive)
            .finish()
    }
}

impl LivenessWatcher {
    pub async fn start(
        connection: &Arc<dyn Connection>,
        actor_id: &str,
        ttl: Duration,
    ) -> Result<Self, InteractError> {
        let alive = Arc::new(ExpiringSet::with_equality(
            ttl,
            |a: &ActorIdentity, b: &ActorIdentity| a.same_actor(b),
        )?);

        let set = alive.clone();
        let listener = BroadcastHandler::listen(
            connection,
            actor_id,
            LIVENESS_EXCHANGE,
            None,
            callback(move |pong: Pong| {
                if set.add(pong.actor_info.clone(), None) {
                    tracing::debug!(actor = %pong.actor_info, "Actor came alive");
                }
                async { Ok::<_, HandlerError>(()) }
            }),
        )
        .await?;
        tracing::debug!(actor_id, ?ttl, "Liveness watcher started");
        Ok(Self { listener, alive })
    }

    /// Actors seen within the time to live.
    pub fn alive(&self) -> Vec<ActorIdentity> {
        self.alive.snapshot()
    }

    pub fn is_alive(&self, actor_id: &str) -> bool {
        self.alive
            .snapshot()
            .iter()
            .any(|identity| identity.id == actor_id)
    }

    /// Appearances and expirations. Expirations are noticed on the next announcement
    /// or read.
    pub fn subscribe(&self) -> broadcast::Receiver<SetEvent<ActorIdentity>> {
        self.alive.subscribe()
    }
}

#[async_trait]
impl Handler for LivenessWatcher {
    fn id(&self) -> Id {
        self.listener.id()
    }

    fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    async fn dispose(&self) {
        self.listener.dispose().await
    }
}
