use super::*;
use crate::broker::QueueOptions;
use crate::test_utils::prelude::*;

use assert_matches::assert_matches;

fn emitter(harness: &BrokerHarness) -> Emitter {
    Emitter::new(harness.connection(), "1", Duration::from_secs(1)).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_enqueue_is_confirmed() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    emitter(&harness)
        .enqueue("articles", Notify { message: "a".into() })
        .await
        .unwrap();
    assert_eq!(harness.broker.ready_count("articles"), Some(1));
}

#[test_log::test(tokio::test)]
async fn test_enqueue_without_queue_is_unroutable() {
    let harness = BrokerHarness::new();
    let result = emitter(&harness)
        .enqueue("missing", Notify { message: "a".into() })
        .await;
    assert_matches!(result, Err(InteractError::Routing { queue }) if queue == "missing");
}

#[test_log::test(tokio::test)]
async fn test_enqueue_to_full_queue_is_nacked() {
    let harness = BrokerHarness::new();
    let channel = harness.connection().create_channel().await.unwrap();
    channel
        .queue_declare("bounded", QueueOptions::durable().bounded(1))
        .await
        .unwrap();

    let emitter = emitter(&harness);
    emitter
        .enqueue("bounded", Notify { message: "a".into() })
        .await
        .unwrap();
    let result = emitter
        .enqueue("bounded", Notify { message: "b".into() })
        .await;
    assert_matches!(result, Err(InteractError::Nack { queue }) if queue == "bounded");
    assert_eq!(harness.broker.ready_count("bounded"), Some(1));
}

#[test_log::test(tokio::test)]
async fn test_enqueue_rejects_reserved_names() {
    let harness = BrokerHarness::new();
    let emitter = emitter(&harness);
    for queue in ["", "rpc_2_Numbers", "broadcast_1", "who_alive"] {
        assert_matches!(
            emitter.enqueue(queue, Notify { message: "a".into() }).await,
            Err(InteractError::InvalidArgument(_))
        );
    }
}

#[test_log::test(tokio::test)]
async fn test_broadcast_declares_exchange() {
    let harness = BrokerHarness::new();
    emitter(&harness)
        .broadcast(Notify { message: "1".into() })
        .await
        .unwrap();
    assert!(harness.broker.exchange_exists("broadcast_1"));
}

#[test_log::test(tokio::test)]
async fn test_closed_connection() {
    let harness = BrokerHarness::new();
    let connection = harness.broker.open_connection();
    let emitter = Emitter::new(connection.clone(), "1", Duration::from_secs(1)).unwrap();
    connection.sever("gone");

    assert_matches!(
        emitter.broadcast(Notify { message: "1".into() }).await,
        Err(InteractError::ConnectionClosed(reason)) if reason == "gone"
    );
    assert_matches!(
        Emitter::new(connection, "1", Duration::from_secs(1)),
        Err(InteractError::InvalidArgument(_))
    );
}
