use super::*;
use crate::emitter::Emitter;
use crate::test_utils::prelude::*;

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;

async fn subscriber(
    harness: &BrokerHarness,
    actor_id: &str,
) -> (BroadcastHandler<Notify>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = BroadcastHandler::start(&harness.connection(), actor_id, "1", move |notify: Notify| {
        let _ = tx.send(notify.message);
        async { Ok::<_, HandlerError>(()) }
    })
    .await
    .unwrap();
    (handler, rx)
}

#[test_log::test(tokio::test)]
async fn test_every_subscriber_receives_each_broadcast() {
    let harness = BrokerHarness::new();
    let (first, mut first_rx) = subscriber(&harness, "2").await;
    let (second, mut second_rx) = subscriber(&harness, "3").await;
    assert_eq!(first.exchange(), "broadcast_1");
    assert_ne!(first.queue(), second.queue());

    let emitter = Emitter::new(harness.connection(), "1", Duration::from_secs(1)).unwrap();
    emitter.broadcast(Notify { message: "1".into() }).await.unwrap();

    assert_eq!(first_rx.recv().await.unwrap(), "1");
    assert_eq!(second_rx.recv().await.unwrap(), "1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());
}

#[test_log::test(tokio::test)]
async fn test_foreign_schema_is_skipped() {
    let harness = BrokerHarness::new();
    let (handler, mut rx) = subscriber(&harness, "2").await;
    let mut events = handler.subscribe();

    let emitter = Emitter::new(harness.connection(), "1", Duration::from_secs(1)).unwrap();
    emitter
        .broadcast(SkippedNotify { message: "skip".into() })
        .await
        .unwrap();
    let failed = next_event(&mut events).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Validating && failure.counterpart.as_deref() == Some("1"));

    emitter.broadcast(Notify { message: "keep".into() }).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "keep");
}

#[test_log::test(tokio::test)]
async fn test_handler_failure_is_reported() {
    let harness = BrokerHarness::new();
    let handler = BroadcastHandler::start(&harness.connection(), "2", "1", |_: Notify| async {
        Err::<(), HandlerError>("rejected".into())
    })
    .await
    .unwrap();
    let mut events = handler.subscribe();

    let emitter = Emitter::new(harness.connection(), "1", Duration::from_secs(1)).unwrap();
    emitter.broadcast(Notify { message: "1".into() }).await.unwrap();

    let incoming = next_event(&mut events).await;
    assert_matches!(incoming, HandlerEvent::Incoming { counterpart: Some(source), .. } if source == "1");
    let failed = next_event(&mut events).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Handling && failure.reason == "rejected");
}

#[test_log::test(tokio::test)]
async fn test_dispose_removes_private_queue() {
    let harness = BrokerHarness::new();
    let (handler, _rx) = subscriber(&harness, "2").await;
    let queue = handler.queue().to_string();
    assert!(harness.broker.queue_exists(&queue));

    handler.dispose().await;
    handler.dispose().await;
    assert!(!handler.is_running());
    assert!(!harness.broker.queue_exists(&queue));
}

#[test_log::test(tokio::test)]
async fn test_blank_source_is_rejected() {
    let harness = BrokerHarness::new();
    let result = BroadcastHandler::start(&harness.connection(), "2", " ", |_: Notify| async {
        Ok::<_, HandlerError>(())
    })
    .await;
    assert_matches!(result, Err(InteractError::InvalidArgument(_)));
}
