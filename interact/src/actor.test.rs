use super::*;
use crate::broker::MemoryBroker;
use crate::envelope::Envelope;
use crate::naming::{LIVENESS_EXCHANGE, broadcast_exchange};
use crate::test_utils::prelude::*;
use crate::ttl_set::SetEvent;

use std::sync::atomic::AtomicUsize;
use std::time::Instant;

use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;

#[test_log::test(tokio::test)]
async fn test_start_and_ping() {
    let harness = BrokerHarness::new();
    let started = Instant::now();
    let first = harness.actor("1").await;
    let config = harness.config("1");
    assert!(started.elapsed() >= config.probe_timeout + config.launch_window);
    assert_eq!(first.id(), "1");
    assert_eq!(first.identity().kind, "test");

    let second = harness.actor("2").await;
    assert!(second.ping("1", None).await.unwrap());
    assert!(first.ping("2", None).await.unwrap());
    assert!(
        !second
            .ping("3", Some(Duration::from_millis(100)))
            .await
            .unwrap()
    );
}

#[test_log::test(tokio::test)]
async fn test_generated_id() {
    let harness = BrokerHarness::new();
    let config = ActorConfig {
        id: None,
        ..harness.config("unused")
    };
    let actor = Actor::start(&harness.broker, config).await.unwrap();
    assert!(!actor.id().is_empty());
    assert_ne!(actor.id(), "unused");
}

#[test_log::test(tokio::test)]
async fn test_running_actor_rejects_duplicate() {
    let harness = BrokerHarness::new();
    let _running = harness.actor("1").await;

    let started = Instant::now();
    let duplicate = Actor::start(&harness.broker, harness.config("1")).await;
    assert_matches!(
        duplicate,
        Err(InteractError::AlreadyStarted { id, conflict: StartConflict::Running }) if id == "1"
    );
    // Fails on the probe without waiting out the launch window
    assert!(started.elapsed() < harness.config("1").launch_window);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_launches_leave_one_survivor() {
    let harness = BrokerHarness::new();
    let broker = harness.broker.clone();
    let config = harness.config("1");

    let first = Actor::start(&broker, config.clone());
    let second = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Actor::start(&broker, config.clone()).await
    };
    let (first, second) = tokio::join!(first, second);

    let successes = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1);
    let failure = [first, second].into_iter().find_map(Result::err);
    assert_matches!(failure, Some(InteractError::AlreadyStarted { .. }));
}

#[test_log::test(tokio::test)]
async fn test_earlier_launch_wins_the_race() {
    let harness = BrokerHarness::new();
    let config = harness.config("1");

    // A rival that started a second earlier keeps announcing itself
    let rival = Envelope::new(LaunchNotification {
        launch_id: Id::new(),
        started_at: Utc::now() - ChronoDuration::seconds(1),
    })
    .to_bytes()
    .unwrap();
    let announcer = harness.clone();
    let task = tokio::spawn(async move {
        loop {
            announcer
                .publish_raw(&broadcast_exchange("1"), "", &rival)
                .await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });

    let result = Actor::start(&harness.broker, config).await;
    task.abort();
    assert_matches!(
        result,
        Err(InteractError::AlreadyStarted { conflict: StartConflict::Launching, .. })
    );
    // The failed launch leaves nothing serving its id
    let observer = harness.actor("2").await;
    assert!(!observer.ping("1", Some(Duration::from_millis(100))).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_later_launch_is_ignored() {
    let harness = BrokerHarness::new();
    let rival = Envelope::new(LaunchNotification {
        launch_id: Id::new(),
        started_at: Utc::now() + ChronoDuration::seconds(60),
    })
    .to_bytes()
    .unwrap();
    let announcer = harness.clone();
    let task = tokio::spawn(async move {
        loop {
            announcer
                .publish_raw(&broadcast_exchange("1"), "", &rival)
                .await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });

    let result = Actor::start(&harness.broker, harness.config("1")).await;
    task.abort();
    assert!(result.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_call_between_actors() {
    let harness = BrokerHarness::new();
    let server = harness.actor("2").await;
    let client = harness.actor("1").await;

    server
        .register_rpc_handler(1, |numbers: Numbers| async move {
            Ok::<_, HandlerError>(Product {
                value: numbers.first * numbers.second,
            })
        })
        .await
        .unwrap();

    let product: Product = client.call("2", Numbers { first: 2, second: 3 }).await.unwrap();
    assert_eq!(product.value, 6);
}

#[test_log::test(tokio::test)]
async fn test_broadcast_between_actors() {
    let harness = BrokerHarness::new();
    let source = harness.actor("1").await;
    let first = harness.actor("2").await;
    let second = harness.actor("3").await;

    let received = Arc::new(AtomicUsize::new(0));
    let mut streams = Vec::new();
    for subscriber in [&first, &second] {
        let received = received.clone();
        let handler = subscriber
            .register_broadcast_handler("1", move |notify: Notify| {
                assert_eq!(notify.message, "1");
                received.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, HandlerError>(()) }
            })
            .await
            .unwrap();
        streams.push(handler.subscribe());
    }

    source.broadcast(Notify { message: "1".into() }).await.unwrap();
    for events in &mut streams {
        next_matching(events, |event| matches!(event, HandlerEvent::Handled { .. })).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn test_queue_roundtrip_and_count() {
    let harness = BrokerHarness::new();
    let actor = harness.actor("1").await;

    actor.declare_queue("articles", 0).await.unwrap();
    actor.enqueue("articles", Notify { message: "a".into() }).await.unwrap();
    actor.enqueue("articles", Notify { message: "b".into() }).await.unwrap();
    assert_eq!(actor.message_count("articles").await.unwrap(), 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = actor
        .register_queue_handler("articles", 1, move |notify: Notify| {
            let _ = tx.send(notify.message);
            async { Ok::<_, HandlerError>(()) }
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "a");
    assert_eq!(rx.recv().await.unwrap(), "b");

    assert!(actor.stop_handler(handler.id()).await);
    assert!(!actor.stop_handler(handler.id()).await);
    assert!(!handler.is_running());
}

#[test_log::test(tokio::test)]
async fn test_bounded_queue_rejects_overflow() {
    let harness = BrokerHarness::new();
    let actor = harness.actor("1").await;

    actor.declare_queue("bounded", 1).await.unwrap();
    actor.enqueue("bounded", Notify { message: "a".into() }).await.unwrap();
    assert_matches!(
        actor.enqueue("bounded", Notify { message: "b".into() }).await,
        Err(InteractError::Nack { queue }) if queue == "bounded"
    );
    assert_matches!(
        actor.enqueue("missing", Notify { message: "c".into() }).await,
        Err(InteractError::Routing { .. })
    );
}

#[test_log::test(tokio::test)]
async fn test_conflicting_schema_is_rejected() {
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Impostor {
        text: String,
    }

    impl Payload for Impostor {
        const TAG: &'static str = "Notify";
    }

    let harness = BrokerHarness::new();
    let actor = harness.actor("1").await;
    let result = actor
        .register_broadcast_handler("2", |_: Impostor| async { Ok::<_, HandlerError>(()) })
        .await;
    assert_matches!(result, Err(InteractError::Config(_)));
}

#[test_log::test(tokio::test)]
async fn test_liveness_announcements() {
    let harness = BrokerHarness::new();
    let observer = harness.actor("observer").await;
    let watcher = observer
        .watch_liveness(Some(Duration::from_millis(300)))
        .await
        .unwrap();
    let mut events = watcher.subscribe();

    let announcer = harness.actor("1").await;
    next_matching(&mut events, |event| {
        matches!(event, SetEvent::Appended(values) if values.iter().any(|v| v.id == "1"))
    })
    .await;
    assert!(watcher.is_alive("1"));
    assert!(harness.broker.exchange_exists(LIVENESS_EXCHANGE));

    announcer.dispose().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!watcher.is_alive("1"));
}

#[test_log::test(tokio::test)]
async fn test_dispose() {
    let harness = BrokerHarness::new();
    let actor = harness.actor("1").await;
    let handler = actor
        .register_rpc_handler(2, |numbers: Numbers| async move {
            Ok::<_, HandlerError>(Product {
                value: numbers.first,
            })
        })
        .await
        .unwrap();

    actor.dispose().await;
    actor.dispose().await;
    assert!(actor.is_disposed());
    assert!(!handler.is_running());
    assert_matches!(
        actor.broadcast(Notify { message: "1".into() }).await,
        Err(InteractError::ConnectionClosed(_))
    );

    // The id is free again
    let replacement = harness.actor("1").await;
    assert_eq!(replacement.id(), "1");
}

#[test_log::test(tokio::test)]
async fn test_invalid_config() {
    let broker = MemoryBroker::new();
    let config = ActorConfig {
        launch_period: Duration::from_secs(20),
        ..ActorConfig::new("test")
    };
    assert_matches!(
        Actor::start(&broker, config).await,
        Err(InteractError::Config(_))
    );
}

#[test_log::test(tokio::test)]
async fn test_failing_responder_still_occupies_id() {
    let harness = BrokerHarness::new();
    let _squatter = RpcHandler::start(&harness.connection(), "1", 1, |_: Ping| async move {
        Err::<Pong, HandlerError>("not ready".into())
    })
    .await
    .unwrap();

    let started = Instant::now();
    let result = Actor::start(&harness.broker, harness.config("1")).await;
    assert_matches!(
        result,
        Err(InteractError::AlreadyStarted { conflict: StartConflict::Running, .. })
    );
    assert!(started.elapsed() < harness.config("1").launch_window);
}

#[test_log::test(tokio::test)]
async fn test_inspect_known_envelopes() {
    let harness = BrokerHarness::new();
    let actor = harness.actor("1").await;

    let bytes = Envelope::new(Notify { message: "".into() }).to_bytes().unwrap();
    let inspection = actor.inspect(&bytes).unwrap();
    assert_eq!(inspection.tag, "Notify");
    assert!(!inspection.is_valid());

    assert_matches!(
        actor.inspect(br#"{"Type":"Unknown","Payload":{}}"#),
        Err(InteractError::Validation(_))
    );
}
