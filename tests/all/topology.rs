use crate::helpers::{get_client, RETRY_INTERVAL};
use amq_protocol_types::{AMQPValue, ShortString};
use rabbit_warren::topology::{
    ExchangeKind, QueueDeclaration, AMQP_ARGUMENT_MAX_PRIORITY, AMQP_ARGUMENT_MESSAGE_TTL,
};
use rabbit_warren::transport::in_memory::InMemoryBroker;
use rabbit_warren::Error;
use std::time::Duration;

#[tokio::test]
async fn queues_are_declared_with_their_arguments() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    client
        .declare_queue("jobs", true, 10, Duration::from_secs(60))
        .await
        .unwrap();

    let declaration = broker.queue_declaration("jobs").unwrap();
    assert!(declaration.durable);
    let arguments = broker.queue_arguments("jobs").unwrap();
    let arguments = arguments.inner();
    assert_eq!(
        Some(&AMQPValue::LongInt(10)),
        arguments.get(&ShortString::from(AMQP_ARGUMENT_MAX_PRIORITY))
    );
    assert_eq!(
        Some(&AMQPValue::LongLongInt(60_000)),
        arguments.get(&ShortString::from(AMQP_ARGUMENT_MESSAGE_TTL))
    );
}

#[tokio::test]
async fn zero_priority_and_ttl_leave_the_queue_unconstrained() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    client
        .declare_queue("jobs", false, 0, Duration::ZERO)
        .await
        .unwrap();

    assert!(broker.queue_arguments("jobs").unwrap().inner().is_empty());
    assert!(!broker.queue_declaration("jobs").unwrap().durable);
}

#[tokio::test]
async fn declarations_are_idempotent() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    let declaration = QueueDeclaration::new("jobs").durable().max_priority(5);

    for _ in 0..2 {
        client.declare_exchange("orders", "topic", true).await.unwrap();
        client.declare_queue_with(&declaration).await.unwrap();
        client.bind_queue("jobs", "orders").await.unwrap();
    }

    assert_eq!(Some(ExchangeKind::Topic), broker.exchange_kind("orders"));
    assert_eq!(
        vec![("orders".to_owned(), "jobs".to_owned())],
        broker.bindings("jobs")
    );
}

#[tokio::test]
async fn inequivalent_redeclarations_are_reported() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client
        .declare_queue("jobs", true, 0, Duration::ZERO)
        .await
        .unwrap();
    client.declare_exchange("orders", "topic", true).await.unwrap();

    let queue = client
        .declare_queue("jobs", false, 0, Duration::ZERO)
        .await;
    let exchange = client.declare_exchange("orders", "fanout", true).await;

    assert!(matches!(queue, Err(Error::DeclareQueue { name, .. }) if name == "jobs"));
    assert!(matches!(exchange, Err(Error::DeclareExchange { name, .. }) if name == "orders"));
}

#[tokio::test]
async fn binding_to_a_missing_exchange_fails() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client
        .declare_queue("jobs", false, 0, Duration::ZERO)
        .await
        .unwrap();

    let outcome = client.bind_queue("jobs", "missing").await;

    assert!(matches!(
        outcome,
        Err(Error::BindQueue { queue, exchange, .. }) if queue == "jobs" && exchange == "missing"
    ));
}

#[tokio::test]
async fn declaration_failures_carry_the_broker_error_and_are_not_retried() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client
        .declare_queue("jobs", false, 0, Duration::ZERO)
        .await
        .unwrap();

    let error = client.bind_queue("jobs", "missing").await.unwrap_err();

    let source = std::error::Error::source(&error).expect("the broker error was dropped");
    assert_eq!("NOT_FOUND - no exchange 'missing'", source.to_string());
    // A single attempt: the binding still fails once the exchange shows up.
    client.declare_exchange("missing", "direct", false).await.unwrap();
    tokio::time::sleep(RETRY_INTERVAL * 5).await;
    assert!(broker.bindings("jobs").is_empty());
}

#[tokio::test]
async fn invalid_exchange_declarations_are_rejected_locally() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    assert!(matches!(
        client.declare_exchange("", "topic", true).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.declare_exchange("orders", "", true).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client
            .declare_queue(&"q".repeat(300), false, 0, Duration::ZERO)
            .await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(None, broker.exchange_kind("orders"));
}

#[tokio::test]
async fn fanout_exchanges_copy_messages_to_every_bound_queue() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    client.declare_exchange("audit", "fanout", false).await.unwrap();
    for queue in ["audit.archive", "audit.alerts"] {
        client
            .declare_queue(queue, false, 0, Duration::ZERO)
            .await
            .unwrap();
        client.bind_queue(queue, "audit").await.unwrap();
    }

    client
        .publish("audit", "anything", rabbit_warren::publishers::Message::new("login"))
        .await
        .unwrap();

    assert_eq!(1, broker.ready_messages("audit.archive"));
    assert_eq!(1, broker.ready_messages("audit.alerts"));
}
