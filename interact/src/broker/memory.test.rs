use super::*;
use crate::broker::{Channel, Connection};

use assert_matches::assert_matches;
use std::time::Duration;

async fn channel(broker: &MemoryBroker) -> (Arc<MemoryConnection>, Arc<dyn Channel>) {
    let connection = broker.open_connection();
    let channel = connection.create_channel().await.unwrap();
    (connection, channel)
}

async fn publish(channel: &Arc<dyn Channel>, queue: &str, body: &'static str) -> Confirmation {
    channel
        .basic_publish("", queue, true, Properties::default(), Bytes::from_static(body.as_bytes()))
        .await
        .unwrap()
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_round_robin_between_consumers() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();

    let mut first = channel.basic_consume("work", true).await.unwrap();
    let mut second = channel.basic_consume("work", true).await.unwrap();

    for body in ["a", "b", "c", "d"] {
        publish(&channel, "work", body).await;
    }

    let a = first.next().await.unwrap();
    let b = second.next().await.unwrap();
    let c = first.next().await.unwrap();
    let d = second.next().await.unwrap();
    assert_eq!(a.body, "a");
    assert_eq!(b.body, "b");
    assert_eq!(c.body, "c");
    assert_eq!(d.body, "d");
}

#[test_log::test(tokio::test)]
async fn test_prefetch_holds_back_until_ack() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
    channel.basic_qos(1).await.unwrap();
    let mut consumer = channel.basic_consume("work", false).await.unwrap();

    publish(&channel, "work", "1").await;
    publish(&channel, "work", "2").await;

    let first = consumer.next().await.unwrap();
    assert_eq!(first.body, "1");
    assert_eq!(broker.ready_count("work"), Some(1));

    channel.basic_ack(first.delivery_tag).await.unwrap();
    let second = consumer.next().await.unwrap();
    assert_eq!(second.body, "2");
    assert_eq!(broker.ready_count("work"), Some(0));

    assert_matches!(
        channel.basic_ack(first.delivery_tag).await,
        Err(BrokerError::PreconditionFailed(_))
    );
}

#[test_log::test(tokio::test)]
async fn test_confirm_outcomes() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;

    // Without confirm mode nothing is reported
    assert_eq!(publish(&channel, "missing", "x").await, Confirmation::NotRequested);

    channel.confirm_select().await.unwrap();
    assert_eq!(publish(&channel, "missing", "x").await, Confirmation::Returned);

    channel
        .queue_declare("bounded", QueueOptions::durable().bounded(1))
        .await
        .unwrap();
    assert_eq!(publish(&channel, "bounded", "1").await, Confirmation::Ack);
    assert_eq!(publish(&channel, "bounded", "2").await, Confirmation::Nack);
    assert_eq!(broker.ready_count("bounded"), Some(1));

    let unroutable = channel
        .basic_publish("", "missing", false, Properties::default(), Bytes::new())
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(unroutable, Confirmation::Ack);
}

#[test_log::test(tokio::test)]
async fn test_fanout_reaches_every_bound_queue() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel
        .exchange_declare("broadcast_1", ExchangeKind::Fanout)
        .await
        .unwrap();

    let mut consumers = Vec::new();
    for _ in 0..2 {
        let queue = channel.queue_declare("", QueueOptions::private()).await.unwrap();
        assert!(queue.name.starts_with("amq.gen-"));
        channel.queue_bind(&queue.name, "broadcast_1", "").await.unwrap();
        consumers.push(channel.basic_consume(&queue.name, true).await.unwrap());
    }

    channel
        .basic_publish("broadcast_1", "", false, Properties::default(), Bytes::from_static(b"1"))
        .await
        .unwrap();

    for consumer in consumers.iter_mut() {
        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.body, "1");
        assert_eq!(delivery.exchange, "broadcast_1");
    }

    assert_matches!(
        channel
            .basic_publish("broadcast_2", "", false, Properties::default(), Bytes::new())
            .await,
        Err(BrokerError::NotFound { kind: "exchange", .. })
    );
}

#[test_log::test(tokio::test)]
async fn test_expired_messages_are_discarded() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("rpc", QueueOptions::default()).await.unwrap();

    channel
        .basic_publish(
            "",
            "rpc",
            false,
            Properties::default().with_expiration("50"),
            Bytes::from_static(b"stale"),
        )
        .await
        .unwrap();
    channel
        .basic_publish("", "rpc", false, Properties::default(), Bytes::from_static(b"fresh"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut consumer = channel.basic_consume("rpc", true).await.unwrap();
    assert_eq!(consumer.next().await.unwrap().body, "fresh");

    assert_matches!(
        channel
            .basic_publish("", "rpc", false, Properties::default().with_expiration("soon"), Bytes::new())
            .await,
        Err(BrokerError::PreconditionFailed(_))
    );
}

#[test_log::test(tokio::test)]
async fn test_cancel_requeues_unacked() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();

    let mut first = channel.basic_consume("work", false).await.unwrap();
    publish(&channel, "work", "1").await;
    let delivery = first.next().await.unwrap();
    assert!(!delivery.redelivered);

    channel.basic_cancel(first.tag()).await.unwrap();
    assert!(first.next().await.is_none());
    assert_eq!(broker.ready_count("work"), Some(1));

    let mut second = channel.basic_consume("work", false).await.unwrap();
    let again = second.next().await.unwrap();
    assert_eq!(again.body, "1");
    assert!(again.redelivered);
}

#[test_log::test(tokio::test)]
async fn test_auto_delete_and_exclusive_queues() {
    let broker = MemoryBroker::new();
    let (connection, channel) = channel(&broker).await;
    let private = channel.queue_declare("", QueueOptions::private()).await.unwrap();

    let (_other, foreign) = {
        let other = broker.open_connection();
        let foreign = other.create_channel().await.unwrap();
        (other, foreign)
    };
    assert_matches!(
        foreign.basic_consume(&private.name, true).await,
        Err(BrokerError::ResourceLocked(_))
    );

    let consumer = channel.basic_consume(&private.name, true).await.unwrap();
    channel.basic_cancel(consumer.tag()).await.unwrap();
    assert!(!broker.queue_exists(&private.name));

    // Exclusive queues die with their connection even without consumers
    let kept = channel
        .queue_declare("", QueueOptions { exclusive: true, ..Default::default() })
        .await
        .unwrap();
    assert!(broker.queue_exists(&kept.name));
    connection.close().await.unwrap();
    assert!(!broker.queue_exists(&kept.name));
}

#[test_log::test(tokio::test)]
async fn test_inequivalent_redeclare() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
    assert_matches!(
        channel.queue_declare("work", QueueOptions::durable().bounded(5)).await,
        Err(BrokerError::PreconditionFailed(_))
    );
    assert_matches!(
        channel.exchange_declare("work_exchange", ExchangeKind::Fanout).await,
        Ok(())
    );
    assert_matches!(
        channel.exchange_declare("work_exchange", ExchangeKind::Direct).await,
        Err(BrokerError::PreconditionFailed(_))
    );
}

#[test_log::test(tokio::test)]
async fn test_severed_connection_closes_everything() {
    let broker = MemoryBroker::new();
    let (connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
    let mut consumer = channel.basic_consume("work", false).await.unwrap();
    publish(&channel, "work", "1").await;
    consumer.next().await.unwrap();

    connection.sever("broker restarted");

    assert!(consumer.next().await.is_none());
    assert!(!channel.is_open());
    assert_eq!(channel.close_reason().as_deref(), Some("broker restarted"));
    assert_matches!(
        channel.queue_declare_passive("work").await,
        Err(BrokerError::ConnectionClosed(_))
    );
    assert_matches!(
        connection.create_channel().await.err(),
        Some(BrokerError::ConnectionClosed(_))
    );

    // Unacked work goes back to the durable queue
    let (_connection, channel) = {
        let connection = broker.open_connection();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    };
    let info = channel.queue_declare_passive("work").await.unwrap();
    assert_eq!(info.message_count, 1);
}

#[test_log::test(tokio::test)]
async fn test_consumer_wakes_on_publish() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
    let mut consumer = channel.basic_consume("work", true).await.unwrap();

    let mut next = tokio_test::task::spawn(consumer.next());
    tokio_test::assert_pending!(next.poll());

    publish(&channel, "work", "a").await;
    assert!(next.is_woken());
    let delivery = tokio_test::assert_ready!(next.poll()).unwrap();
    assert_eq!(delivery.body, "a");
}
