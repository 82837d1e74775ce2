use super::*;
use crate::envelope::Envelope;
use crate::test_utils::prelude::*;

use assert_matches::assert_matches;

fn announcement(id: &str) -> bytes::Bytes {
    Envelope::new(Pong::now(ActorIdentity::new(id, "test")))
        .to_bytes()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_tracks_announced_actors() {
    let harness = BrokerHarness::new();
    let watcher = LivenessWatcher::start(&harness.connection(), "observer", Duration::from_millis(200))
        .await
        .unwrap();
    let mut events = watcher.subscribe();

    harness.publish_raw(LIVENESS_EXCHANGE, "", &announcement("1")).await;
    harness.publish_raw(LIVENESS_EXCHANGE, "", &announcement("1")).await;
    harness.publish_raw(LIVENESS_EXCHANGE, "", &announcement("2")).await;

    let first = next_event(&mut events).await;
    assert_matches!(first, SetEvent::Appended(values) if values[0].id == "1");
    let second = next_event(&mut events).await;
    assert_matches!(second, SetEvent::Appended(values) if values[0].id == "2");
    assert_eq!(watcher.alive().len(), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!watcher.is_alive("1"));
    assert!(watcher.alive().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_ignores_invalid_announcements() {
    let harness = BrokerHarness::new();
    let watcher = LivenessWatcher::start(&harness.connection(), "observer", Duration::from_secs(1))
        .await
        .unwrap();

    harness.publish_raw(LIVENESS_EXCHANGE, "", &announcement("")).await;
    harness.publish_raw(LIVENESS_EXCHANGE, "", b"not json").await;
    harness.publish_raw(LIVENESS_EXCHANGE, "", &announcement("3")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(watcher.alive().len(), 1);
    assert!(watcher.is_alive("3"));

    watcher.dispose().await;
    assert!(!watcher.is_running());
}
