//! Broker names shared by every actor. Peers built elsewhere rely on these exactly.

use crate::error::InteractError;

/// Prefix of every rpc request queue.
pub const RPC_QUEUE_PREFIX: &str = "rpc_";

/// Prefix of every per-actor broadcast exchange.
pub const BROADCAST_EXCHANGE_PREFIX: &str = "broadcast_";

/// Fan-out exchange carrying liveness announcements.
pub const LIVENESS_EXCHANGE: &str = "who_alive";

/// Queue serving `tag` requests addressed to `actor_id`.
pub fn rpc_queue(actor_id: &str, tag: &str) -> String {
    format!("{RPC_QUEUE_PREFIX}{actor_id}_{tag}")
}

/// Fan-out exchange carrying broadcasts from `actor_id`.
pub fn broadcast_exchange(actor_id: &str) -> String {
    format!("{BROADCAST_EXCHANGE_PREFIX}{actor_id}")
}

/// Rejects blank work queue names and names colliding with the reserved ones.
pub fn validate_queue_name(name: &str) -> Result<(), InteractError> {
    if name.trim().is_empty() {
        return Err(InteractError::InvalidArgument(
            "queue name cannot be blank".to_string(),
        ));
    }
    if name.starts_with(RPC_QUEUE_PREFIX)
        || name.starts_with(BROADCAST_EXCHANGE_PREFIX)
        || name == LIVENESS_EXCHANGE
    {
        return Err(InteractError::InvalidArgument(format!(
            "queue name '{name}' uses a reserved prefix"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_names() {
        assert_eq!(rpc_queue("2", "Numbers"), "rpc_2_Numbers");
        assert_eq!(broadcast_exchange("7"), "broadcast_7");
    }

    #[test]
    fn test_reserved_queue_names() {
        assert!(validate_queue_name("articles").is_ok());
        assert_matches!(validate_queue_name("  "), Err(InteractError::InvalidArgument(_)));
        assert_matches!(validate_queue_name("rpc_x"), Err(InteractError::InvalidArgument(_)));
        assert_matches!(
            validate_queue_name("broadcast_1"),
            Err(InteractError::InvalidArgument(_))
        );
        assert_matches!(
            validate_queue_name("who_alive"),
            Err(InteractError::InvalidArgument(_))
        );
        assert!(validate_queue_name("who_alive_backup").is_ok());
    }
}
