use super::*;
use crate::handler::Handler;
use crate::test_utils::prelude::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(1);

fn client(connection: Arc<dyn Connection>) -> RpcClient {
    RpcClient::new(connection, "1", TIMEOUT).unwrap()
}

async fn multiply(harness: &BrokerHarness, concurrency: usize) -> RpcHandler<Numbers, Product> {
    RpcHandler::start(&harness.connection(), "2", concurrency, |numbers: Numbers| async move {
        Ok::<_, HandlerError>(Product {
            value: numbers.first * numbers.second,
        })
    })
    .await
    .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_call_returns_response() {
    let harness = BrokerHarness::new();
    let handler = multiply(&harness, 1).await;
    assert_eq!(handler.queue(), "rpc_2_Numbers");
    assert!(harness.broker.queue_exists("rpc_2_Numbers"));
    let mut events = handler.subscribe();

    let product: Product = client(harness.connection())
        .call("2", Numbers { first: 2, second: 3 }, None, None)
        .await
        .unwrap();
    assert_eq!(product.value, 6);

    let incoming = next_event(&mut events).await;
    assert_matches!(incoming, HandlerEvent::Incoming { payload, .. } if payload.first == 2);
    let responded = next_event(&mut events).await;
    assert_matches!(responded, HandlerEvent::Responded { response, .. } if response.value == 6);
}

#[test_log::test(tokio::test)]
async fn test_call_without_handler_times_out() {
    let harness = BrokerHarness::new();
    let started = Instant::now();
    let result: Result<Product, _> = client(harness.connection())
        .call(
            "2",
            Numbers { first: 1, second: 1 },
            Some(Duration::from_millis(100)),
            None,
        )
        .await;
    assert_matches!(result, Err(InteractError::Timeout { target, .. }) if target == "2");
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test_log::test(tokio::test)]
async fn test_slow_handler_times_out() {
    let harness = BrokerHarness::new();
    let handler = RpcHandler::start(&harness.connection(), "2", 1, |numbers: Numbers| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, HandlerError>(Product {
            value: numbers.first,
        })
    })
    .await
    .unwrap();
    let mut events = handler.subscribe();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let result: Result<Product, _> = client(harness.connection())
        .call("2", Numbers { first: 1, second: 1 }, Some(timeout), None)
        .await;
    let elapsed = started.elapsed();
    assert_matches!(result, Err(InteractError::Timeout { after, .. }) if after == timeout);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(100));

    // The reply queue is gone before the handler answers
    assert_eq!(harness.broker.queues(), vec!["rpc_2_Numbers".to_string()]);

    // The late reply is published into the void without failing the handler
    let outcome = next_matching(&mut events, |event| {
        matches!(event, HandlerEvent::Responded { .. }) || event.failure().is_some()
    })
    .await;
    assert_matches!(outcome, HandlerEvent::Responded { response, .. } if response.value == 1);
    assert_eq!(harness.broker.queues(), vec!["rpc_2_Numbers".to_string()]);
    assert_eq!(harness.broker.ready_count("rpc_2_Numbers"), Some(0));
}

#[test_log::test(tokio::test)]
async fn test_concurrency_serves_requests_in_parallel() {
    let harness = BrokerHarness::new();
    let _handler = RpcHandler::start(&harness.connection(), "2", 2, |numbers: Numbers| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, HandlerError>(Product {
            value: numbers.first * numbers.second,
        })
    })
    .await
    .unwrap();

    let client = client(harness.connection());
    let started = Instant::now();
    let (a, b) = tokio::join!(
        client.call::<Numbers, Product>("2", Numbers { first: 2, second: 2 }, None, None),
        client.call::<Numbers, Product>("2", Numbers { first: 3, second: 3 }, None, None),
    );
    assert_eq!(a.unwrap().value, 4);
    assert_eq!(b.unwrap().value, 9);
    assert!(started.elapsed() < Duration::from_millis(550));
}

#[test_log::test(tokio::test)]
async fn test_single_consumer_serves_in_sequence() {
    let harness = BrokerHarness::new();
    let _handler = RpcHandler::start(&harness.connection(), "2", 1, |numbers: Numbers| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, HandlerError>(Product {
            value: numbers.first,
        })
    })
    .await
    .unwrap();

    let client = client(harness.connection());
    let started = Instant::now();
    let (a, b) = tokio::join!(
        client.call::<Numbers, Product>("2", Numbers { first: 1, second: 0 }, None, None),
        client.call::<Numbers, Product>("2", Numbers { first: 2, second: 0 }, None, None),
    );
    assert!(a.is_ok() && b.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[test_log::test(tokio::test)]
async fn test_handler_error_is_returned_to_caller() {
    let harness = BrokerHarness::new();
    let handler = RpcHandler::start(&harness.connection(), "2", 1, |_: Numbers| async move {
        Err::<Product, HandlerError>("division by zero".into())
    })
    .await
    .unwrap();
    let mut events = handler.subscribe();

    let result: Result<Product, _> = client(harness.connection())
        .call("2", Numbers { first: 1, second: 0 }, None, None)
        .await;
    assert_matches!(result, Err(InteractError::Handling(message)) if message == "division by zero");

    let failed = next_matching(&mut events, |event| event.failure().is_some()).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Handling);
}

#[test_log::test(tokio::test)]
async fn test_handler_panic_is_returned_to_caller() {
    let harness = BrokerHarness::new();
    let _handler = RpcHandler::start(&harness.connection(), "2", 1, |numbers: Numbers| async move {
        if numbers.second == 0 {
            panic!("boom");
        }
        Ok::<_, HandlerError>(Product { value: 0 })
    })
    .await
    .unwrap();

    let client = client(harness.connection());
    let result: Result<Product, _> = client
        .call("2", Numbers { first: 1, second: 0 }, None, None)
        .await;
    assert_matches!(result, Err(InteractError::Handling(message)) if message.contains("boom"));

    // The consumer survives the panic
    let product: Product = client
        .call("2", Numbers { first: 1, second: 1 }, None, None)
        .await
        .unwrap();
    assert_eq!(product.value, 0);
}

#[test_log::test(tokio::test)]
async fn test_invalid_request_is_rejected() {
    let harness = BrokerHarness::new();
    let handler = RpcHandler::start(&harness.connection(), "2", 1, |notify: Notify| async move {
        Ok::<_, HandlerError>(Product {
            value: notify.message.len() as i64,
        })
    })
    .await
    .unwrap();
    let mut events = handler.subscribe();

    let result: Result<Product, _> = client(harness.connection())
        .call("2", Notify { message: "".into() }, None, None)
        .await;
    assert_matches!(result, Err(InteractError::Handling(message)) if message.starts_with("invalid rpc request"));

    let failed = next_matching(&mut events, |event| event.failure().is_some()).await;
    assert_matches!(failed.failure(), Some(failure) if failure.stage == Stage::Validating);
}

#[test_log::test(tokio::test)]
async fn test_cancelled_call() {
    let harness = BrokerHarness::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result: Result<Product, _> = client(harness.connection())
        .call("2", Numbers { first: 1, second: 1 }, None, Some(&cancel))
        .await;
    assert_matches!(result, Err(InteractError::Cancelled));
}

#[test_log::test(tokio::test)]
async fn test_lost_connection_fails_pending_call() {
    let harness = BrokerHarness::new();
    let connection = harness.broker.open_connection();
    let client = client(connection.clone());

    let severed = connection.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        severed.sever("broker restarted");
    });

    let result: Result<Product, _> = client
        .call("2", Numbers { first: 1, second: 1 }, None, None)
        .await;
    assert_matches!(result, Err(InteractError::ConnectionClosed(reason)) if reason == "broker restarted");
}

#[test_log::test(tokio::test)]
async fn test_rejects_bad_arguments() {
    let harness = BrokerHarness::new();
    assert_matches!(
        RpcClient::new(harness.connection(), " ", TIMEOUT),
        Err(InteractError::InvalidArgument(_))
    );
    assert_matches!(
        RpcHandler::<Numbers, Product>::start(&harness.connection(), "2", 0, |_| async move {
            Ok::<_, HandlerError>(Product { value: 0 })
        })
        .await,
        Err(InteractError::InvalidArgument(_))
    );

    let result: Result<Product, _> = client(harness.connection())
        .call("", Numbers { first: 1, second: 1 }, None, None)
        .await;
    assert_matches!(result, Err(InteractError::InvalidArgument(_)));
}

#[test_log::test(tokio::test)]
async fn test_dispose_stops_handler() {
    let harness = BrokerHarness::new();
    let handler = multiply(&harness, 2).await;
    assert!(handler.is_running());

    handler.dispose().await;
    handler.dispose().await;
    assert!(!handler.is_running());

    let result: Result<Product, _> = client(harness.connection())
        .call(
            "2",
            Numbers { first: 1, second: 1 },
            Some(Duration::from_millis(100)),
            None,
        )
        .await;
    assert_matches!(result, Err(InteractError::Timeout { .. }));
}
