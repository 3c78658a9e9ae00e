use crate::helpers::{eventually, get_client, RETRY_INTERVAL};
use rabbit_warren::publishers::{DeliveryMode, Message, MIME_APPLICATION_JSON, MIME_TEXT_PLAIN};
use rabbit_warren::transport::in_memory::InMemoryBroker;
use rabbit_warren::Error;
use std::time::{Duration, Instant};

#[tokio::test]
async fn published_messages_are_routed_to_bound_queues() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client.declare_exchange("orders", "topic", true).await.unwrap();
    client
        .declare_queue("orders.created", true, 0, Duration::ZERO)
        .await
        .unwrap();
    client.bind_queue("orders.created", "orders").await.unwrap();

    client
        .publish(
            "orders",
            "orders.created",
            Message::new(r#"{"id": 1}"#)
                .with_content_type(MIME_APPLICATION_JSON)
                .persistent(),
        )
        .await
        .unwrap();
    client
        .publish("orders", "orders.deleted", Message::new(r#"{"id": 2}"#))
        .await
        .unwrap();

    assert_eq!(1, broker.ready_messages("orders.created"));
    let published = broker.published();
    assert_eq!(2, published.len());
    let first = &published[0].message;
    assert_eq!(MIME_APPLICATION_JSON, first.content_type);
    assert_eq!(DeliveryMode::Persistent, first.delivery_mode);
}

#[tokio::test]
async fn missing_message_properties_are_filled_in() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    client.publish("", "jobs", Message::new("job")).await.unwrap();

    let published = broker.published();
    let message = &published[0].message;
    assert_eq!(MIME_TEXT_PLAIN, message.content_type);
    assert!(message.message_id.is_some());
    assert!(message.timestamp.is_some());
}

#[tokio::test]
async fn rejected_publishes_are_retried_until_accepted() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    broker.fail_next_publishes(3);

    let start = Instant::now();
    client.publish("", "jobs", Message::new("job")).await.unwrap();

    assert!(start.elapsed() >= RETRY_INTERVAL * 3);
    assert_eq!(1, broker.published().len());
}

#[tokio::test]
async fn publishing_waits_for_the_broker_to_come_back() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    broker.refuse_connections(true);
    broker.drop_connections();

    let publisher = client.clone();
    let publish =
        tokio::spawn(async move { publisher.publish("", "jobs", Message::new("job")).await });
    tokio::time::sleep(RETRY_INTERVAL * 5).await;
    assert!(!publish.is_finished());
    assert!(broker.published().is_empty());

    broker.refuse_connections(false);
    tokio::time::timeout(Duration::from_secs(5), publish)
        .await
        .expect("the publish never completed")
        .unwrap()
        .unwrap();
    assert_eq!(1, broker.published().len());
}

#[tokio::test]
async fn messages_are_published_exactly_once_per_accepted_call() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    for i in 0..10 {
        if i % 3 == 0 {
            broker.fail_next_publishes(1);
        }
        client
            .publish("", "jobs", Message::new(format!("job-{i}")))
            .await
            .unwrap();
    }

    let bodies: Vec<Vec<u8>> = broker
        .published()
        .into_iter()
        .map(|p| p.message.body)
        .collect();
    let expected: Vec<Vec<u8>> = (0..10).map(|i| format!("job-{i}").into_bytes()).collect();
    assert_eq!(expected, bodies);
}

#[tokio::test]
async fn closing_the_client_interrupts_a_retrying_publish() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    broker.refuse_connections(true);
    broker.drop_connections();

    let publisher = client.clone();
    let publish =
        tokio::spawn(async move { publisher.publish("", "jobs", Message::new("job")).await });
    tokio::time::sleep(RETRY_INTERVAL * 3).await;
    client.close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), publish)
        .await
        .expect("the publish was not interrupted")
        .unwrap();
    assert!(matches!(outcome, Err(Error::Closed)));
    eventually("nothing is left open", || broker.open_connections() == 0).await;
}

#[tokio::test]
async fn oversized_routing_keys_are_rejected() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    let outcome = client
        .publish("", &"k".repeat(256), Message::new("job"))
        .await;

    assert!(matches!(outcome, Err(Error::InvalidArgument(_))));
    assert!(broker.published().is_empty());
}
