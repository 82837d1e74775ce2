use super::*;
use crate::actor::Actor;
use crate::error::StartConflict;
use crate::test_utils::prelude::*;

use assert_matches::assert_matches;
use std::time::Duration;

/// Broker reachable at `INTERACT_AMQP_URL`, or `None` to skip a live test.
fn live_broker() -> Option<AmqpConnector> {
    let connector = AmqpConnector::from_env();
    if connector.is_none() {
        tracing::info!("{AMQP_URL_ENV} not set, skipping live broker test");
    }
    connector
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Id::new().simple())
}

#[test]
fn test_bounded_arguments_become_amqp_fields() {
    let options = QueueOptions::durable().bounded(10);
    let table = field_table(&options.arguments);
    let fields = table.inner();
    assert_eq!(
        fields.get(&ShortString::from("x-max-length")),
        Some(&AMQPValue::LongInt(10))
    );
    assert_eq!(
        fields.get(&ShortString::from("x-overflow")),
        Some(&AMQPValue::LongString("reject-publish".to_string().into()))
    );

    let mut huge = FieldTable::new();
    huge.insert("x-max-length".to_string(), FieldValue::Long(i64::MAX));
    assert_eq!(
        field_table(&huge).inner().get(&ShortString::from("x-max-length")),
        Some(&AMQPValue::LongLongInt(i64::MAX))
    );
}

#[test]
fn test_properties_survive_conversion() {
    let properties = Properties::default()
        .with_correlation_id("c-1")
        .with_reply_to("amq.gen-1")
        .with_expiration("1500")
        .with_content_type("application/json");
    assert_eq!(properties_of(&basic_properties(&properties)), properties);
    assert_eq!(
        properties_of(&basic_properties(&Properties::default())),
        Properties::default()
    );
}

#[test]
fn test_confirmations_map_onto_outcomes() {
    assert_eq!(confirmation_of(LapinConfirmation::Ack(None)), Confirmation::Ack);
    assert_eq!(confirmation_of(LapinConfirmation::Nack(None)), Confirmation::Nack);
    assert_eq!(
        confirmation_of(LapinConfirmation::NotRequested),
        Confirmation::NotRequested
    );
    assert_eq!(
        map_error(lapin::Error::InvalidChannelState(lapin::ChannelState::Closed)),
        BrokerError::ChannelClosed
    );
}

#[test]
fn test_connector_name() {
    let connector = AmqpConnector::new("amqp://localhost:5672/%2f").with_name("indexer");
    assert_eq!(connector.uri, "amqp://localhost:5672/%2f");
    assert_eq!(connector.name.as_deref(), Some("indexer"));
}

#[test_log::test(tokio::test)]
async fn test_separate_connections_claim_one_id() {
    let Some(connector) = live_broker() else {
        return;
    };
    let config = fast_config(&unique("claim"));

    // Each start opens its own connection, as two processes would
    let first = Actor::start(&connector, config.clone());
    let second = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Actor::start(&connector, config.clone()).await
    };
    let (first, second) = tokio::join!(first, second);

    let failure = match (first, second) {
        (Ok(survivor), Err(err)) | (Err(err), Ok(survivor)) => {
            survivor.dispose().await;
            err
        }
        (first, second) => panic!(
            "expected exactly one survivor, got {:?} and {:?}",
            first.is_ok(),
            second.is_ok()
        ),
    };
    assert_matches!(
        failure,
        InteractError::AlreadyStarted {
            conflict: StartConflict::Running | StartConflict::Launching,
            ..
        }
    );
}

#[test_log::test(tokio::test)]
async fn test_messaging_over_live_broker() {
    let Some(connector) = live_broker() else {
        return;
    };
    let server_id = unique("server");
    let server = Actor::start(&connector, fast_config(&server_id)).await.unwrap();
    let client = Actor::start(&connector, fast_config(&unique("client")))
        .await
        .unwrap();

    server
        .register_rpc_handler(1, |numbers: Numbers| async move {
            Ok::<_, HandlerError>(Product {
                value: numbers.first * numbers.second,
            })
        })
        .await
        .unwrap();
    let product: Product = client
        .call(&server_id, Numbers { first: 4, second: 5 })
        .await
        .unwrap();
    assert_eq!(product.value, 20);

    let queue = unique("bounded");
    client.declare_queue(&queue, 1).await.unwrap();
    client.enqueue(&queue, Notify { message: "a".into() }).await.unwrap();
    assert_matches!(
        client.enqueue(&queue, Notify { message: "b".into() }).await,
        Err(InteractError::Nack { .. })
    );
    assert_matches!(
        client.enqueue(&unique("missing"), Notify { message: "c".into() }).await,
        Err(InteractError::Routing { .. })
    );
    assert_eq!(client.message_count(&queue).await.unwrap(), 1);

    let channel = connector
        .connect()
        .await
        .unwrap()
        .create_channel()
        .await
        .unwrap();
    assert_eq!(channel.queue_delete(&queue).await.unwrap(), 1);
    channel.close().await.unwrap();

    client.dispose().await;
    server.dispose().await;
}
