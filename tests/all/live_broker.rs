//! Tests against a RabbitMq broker listening on `localhost:5672`, e.g.
//! `docker run -p 5672:5672 rabbitmq:3`. Run them with `cargo test -- --ignored`.
use crate::helpers::init_tracing;
use rabbit_warren::amqp::configuration::RabbitMqSettings;
use rabbit_warren::consumers::ClosureHandler;
use rabbit_warren::publishers::Message;
use rabbit_warren::RabbitClient;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
#[ignore]
async fn publish_and_consume_against_a_real_broker() {
    init_tracing();
    let client = RabbitClient::connect(&RabbitMqSettings::default())
        .await
        .unwrap();
    assert!(client.is_connected());
    let queue = Uuid::new_v4().to_string();
    client
        .declare_queue(&queue, false, 5, Duration::from_secs(60))
        .await
        .unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let consumer = {
        let client = client.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            client
                .consume(
                    &queue,
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
        .publish("", &queue, Message::new("hello").with_priority(3))
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("the message was not consumed")
        .unwrap();
    assert_eq!(b"hello".to_vec(), payload);

    client.close().await;
    consumer.await.unwrap().unwrap();
}
