use super::*;
use crate::test_utils::prelude::*;

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;

async fn start(
    harness: &BrokerHarness,
    concurrency: usize,
) -> (QueueHandler<Notify>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = QueueHandler::start(&harness.connection(), "1", "articles", concurrency, move |notify: Notify| {
        let tx = tx.clone();
        async move {
            if notify.message == "fail" {
                return Err::<(), HandlerError>("cannot index".into());
            }
            let _ = tx.send(notify.message);
            Ok(())
        }
    })
    .await
    .unwrap();
    (handler, rx)
}

#[test_log::test(tokio::test)]
async fn test_consumes_enqueued_messages() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let (handler, mut rx) = start(&harness, 1).await;
    assert!(handler.is_running());
    assert_eq!(handler.queue(), "articles");
    let mut events = handler.subscribe();

    let body = Envelope::new(Notify { message: "a".into() }).to_bytes().unwrap();
    harness.publish_raw("", "articles", &body).await;

    assert_eq!(rx.recv().await.unwrap(), "a");
    let incoming = next_event(&mut events).await;
    assert_matches!(incoming, HandlerEvent::Incoming { payload, .. } if payload.message == "a");
    let handled = next_event(&mut events).await;
    assert_matches!(handled, HandlerEvent::Handled { .. });
    assert_eq!(harness.broker.ready_count("articles"), Some(0));
}

#[test_log::test(tokio::test)]
async fn test_poison_messages_are_dropped() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let (handler, mut rx) = start(&harness, 1).await;
    let mut events = handler.subscribe();

    harness.publish_raw("", "articles", b"{broken").await;
    let failed = next_event(&mut events).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Deserializing && failure.raw.is_some());

    let invalid = Envelope::new(Notify { message: "".into() }).to_bytes().unwrap();
    harness.publish_raw("", "articles", &invalid).await;
    let failed = next_event(&mut events).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Validating);

    let wrong_tag = Envelope::new(SkippedNotify { message: "x".into() }).to_bytes().unwrap();
    harness.publish_raw("", "articles", &wrong_tag).await;
    let failed = next_event(&mut events).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Validating);

    // None of them reached the callback and none were requeued
    let ok = Envelope::new(Notify { message: "ok".into() }).to_bytes().unwrap();
    harness.publish_raw("", "articles", &ok).await;
    assert_eq!(rx.recv().await.unwrap(), "ok");
    assert_eq!(harness.broker.ready_count("articles"), Some(0));
}

#[test_log::test(tokio::test)]
async fn test_callback_failure_is_not_retried() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let (handler, mut rx) = start(&harness, 1).await;
    let mut events = handler.subscribe();

    let fail = Envelope::new(Notify { message: "fail".into() }).to_bytes().unwrap();
    harness.publish_raw("", "articles", &fail).await;
    let failed = next_matching(&mut events, |event| event.failure().is_some()).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Handling && failure.reason == "cannot index");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    assert_eq!(harness.broker.ready_count("articles"), Some(0));
}

#[test_log::test(tokio::test)]
async fn test_consumers_compete() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let (first, mut first_rx) = start(&harness, 1).await;
    let (_second, mut second_rx) = start(&harness, 1).await;

    for message in ["a", "b", "c", "d"] {
        let body = Envelope::new(Notify { message: message.into() }).to_bytes().unwrap();
        harness.publish_raw("", "articles", &body).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = Vec::new();
    while let Ok(message) = first_rx.try_recv() {
        seen.push(message);
    }
    let first_count = seen.len();
    while let Ok(message) = second_rx.try_recv() {
        seen.push(message);
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c", "d"]);
    assert!(first_count > 0 && first_count < 4);
    first.dispose().await;
}

#[test_log::test(tokio::test)]
async fn test_missing_queue_fails_to_start() {
    let harness = BrokerHarness::new();
    let result = QueueHandler::start(&harness.connection(), "1", "missing", 1, |_: Notify| async {
        Ok::<_, HandlerError>(())
    })
    .await;
    assert_matches!(result, Err(InteractError::Subscription(_)));
}

#[test_log::test(tokio::test)]
async fn test_rejects_bad_arguments() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let connection = harness.connection();
    for (queue, concurrency) in [("", 1), ("rpc_1_Ping", 1), ("articles", 0), ("articles", 11)] {
        let result = QueueHandler::start(&connection, "1", queue, concurrency, |_: Notify| async {
            Ok::<_, HandlerError>(())
        })
        .await;
        assert_matches!(result, Err(InteractError::InvalidArgument(_)));
    }
}

#[test_log::test(tokio::test)]
async fn test_stopped_when_queue_is_deleted() {
    let harness = BrokerHarness::new();
    harness.declare("articles").await;
    let (handler, _rx) = start(&harness, 2).await;
    let mut events = handler.subscribe();

    let channel = harness.connection().create_channel().await.unwrap();
    channel.queue_delete("articles").await.unwrap();

    next_matching(&mut events, |event| matches!(event, HandlerEvent::Stopped)).await;
    assert!(!handler.is_running());
}
