use crate::helpers::{count, eventually, get_client, RETRY_INTERVAL};
use rabbit_warren::consumers::ClosureHandler;
use rabbit_warren::publishers::{Message, MIME_APPLICATION_JSON};
use rabbit_warren::transport::in_memory::{BrokerEvent, InMemoryBroker};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn a_processed_order_is_delivered_and_acked_exactly_once() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client.declare_exchange("orders", "topic", true).await.unwrap();
    client
        .declare_queue("orders.created", true, 0, Duration::from_secs(60))
        .await
        .unwrap();
    client.bind_queue("orders.created", "orders").await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let consumer = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .consume(
                    "orders.created",
                    false,
                    1,
                    ClosureHandler(move |payload: Vec<u8>| {
                        let sender = sender.clone();
                        async move {
                            let _ = sender.send(payload);
                            Ok::<(), anyhow::Error>(())
                        }
                    }),
                )
                .await
        })
    };

    client
        .publish(
            "orders",
            "orders.created",
            Message::new("order-1").with_content_type(MIME_APPLICATION_JSON),
        )
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("the order was never delivered")
        .unwrap();
    assert_eq!(b"order-1".to_vec(), body);
    let published = broker.published();
    assert_eq!(1, published.len());
    assert_eq!(MIME_APPLICATION_JSON, published[0].message.content_type());

    // Give a redelivery every chance to show up.
    tokio::time::sleep(RETRY_INTERVAL * 10).await;
    assert!(received.try_recv().is_err(), "the order was processed twice");
    assert_eq!(
        1,
        count(&broker, |e| matches!(
            e,
            BrokerEvent::Delivered { body, redelivered: false, .. } if body.as_slice() == b"order-1"
        ))
    );
    assert_eq!(1, count(&broker, |e| matches!(e, BrokerEvent::Delivered { .. })));
    assert_eq!(1, count(&broker, |e| matches!(e, BrokerEvent::Acked { .. })));
    assert_eq!(0, count(&broker, |e| matches!(e, BrokerEvent::Nacked { .. })));
    assert_eq!(0, broker.ready_messages("orders.created"));
    assert_eq!(0, broker.unacked_messages("orders.created"));

    client.close().await;
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn orders_flow_through_an_outage() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client.declare_exchange("orders", "topic", true).await.unwrap();
    client
        .declare_queue("orders.created", true, 0, Duration::ZERO)
        .await
        .unwrap();
    client.bind_queue("orders.created", "orders").await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let consumer = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .consume(
                    "orders.created",
                    false,
                    5,
                    ClosureHandler(move |payload: Vec<u8>| {
                        let sender = sender.clone();
                        async move {
                            let order: Value = serde_json::from_slice(&payload)?;
                            let _ = sender.send(order);
                            Ok::<(), anyhow::Error>(())
                        }
                    }),
                )
                .await
        })
    };

    let mut expected = Vec::new();
    for id in 0..20 {
        let order = json!({ "id": id, "amount": id * 10 });
        expected.push(order.clone());
        client
            .publish(
                "orders",
                "orders.created",
                Message::new(order.to_string())
                    .with_content_type(MIME_APPLICATION_JSON)
                    .persistent(),
            )
            .await
            .unwrap();
        if id == 9 {
            broker.drop_connections();
        }
    }

    let mut orders = Vec::new();
    while orders.len() < expected.len() {
        let order = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("an order was lost")
            .expect("the handler was dropped");
        if !orders.contains(&order) {
            orders.push(order);
        }
    }
    // At-least-once: every order arrives, possibly more than once and out of order.
    for order in &expected {
        assert!(orders.contains(order), "{order} was never processed");
    }
    eventually("every order is acked", || {
        broker.ready_messages("orders.created") == 0
            && broker.unacked_messages("orders.created") == 0
    })
    .await;
    assert!(count(&broker, |e| matches!(e, BrokerEvent::Acked { .. })) >= expected.len());

    client.close().await;
    consumer.await.unwrap().unwrap();
}
