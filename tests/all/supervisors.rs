use crate::helpers::{count, eventually, get_client, init_tracing, retry_settings, RETRY_INTERVAL};
use rabbit_warren::publishers::Message;
use rabbit_warren::shutdown::Shutdown;
use rabbit_warren::supervisor::{ChannelSupervisor, ConnectionSupervisor};
use rabbit_warren::transport::in_memory::{BrokerEvent, InMemoryBroker};
use rabbit_warren::{Error, RabbitClient};
use std::time::Duration;

#[tokio::test]
async fn the_first_connection_failure_is_fatal() {
    init_tracing();
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);

    let outcome = RabbitClient::with_transport(broker.clone(), retry_settings()).await;

    assert!(matches!(outcome, Err(Error::Connect(_))));
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn the_first_channel_failure_is_fatal_and_releases_the_connection() {
    init_tracing();
    let broker = InMemoryBroker::new();
    broker.fail_next_channel_opens(1);

    let outcome = RabbitClient::with_transport(broker.clone(), retry_settings()).await;

    assert!(matches!(outcome, Err(Error::OpenChannel(_))));
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn a_dropped_connection_is_re_established() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    assert!(client.is_connected());

    broker.drop_connections();
    assert!(!client.is_connected());

    eventually("the client reconnects", || client.is_connected()).await;
    assert_eq!(1, broker.open_connections());
    assert_eq!(1, broker.open_channels());
    assert_eq!(
        2,
        count(&broker, |e| matches!(e, BrokerEvent::ConnectionOpened { .. }))
    );
}

#[tokio::test]
async fn reconnection_keeps_trying_while_the_broker_is_unreachable() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    broker.refuse_connections(true);
    broker.drop_connections();
    tokio::time::sleep(RETRY_INTERVAL * 5).await;
    assert!(!client.is_connected());

    broker.refuse_connections(false);
    eventually("the client reconnects", || client.is_connected()).await;
}

#[tokio::test]
async fn a_closed_channel_is_reopened_on_the_same_connection() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    broker.close_channels();

    eventually("the channel is reopened", || client.is_connected()).await;
    assert_eq!(
        1,
        count(&broker, |e| matches!(e, BrokerEvent::ConnectionOpened { .. }))
    );
    assert_eq!(
        2,
        count(&broker, |e| matches!(e, BrokerEvent::ChannelOpened { .. }))
    );
}

#[tokio::test]
async fn failed_channel_reopenings_are_retried() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    broker.fail_next_channel_opens(3);
    broker.close_channels();

    eventually("the channel is reopened", || client.is_connected()).await;
    assert_eq!(1, broker.open_channels());
}

#[tokio::test]
async fn channels_are_never_opened_on_a_closed_connection() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    for _ in 0..3 {
        broker.refuse_connections(true);
        broker.drop_connections();
        tokio::time::sleep(RETRY_INTERVAL * 3).await;
        broker.refuse_connections(false);
        eventually("the client reconnects", || client.is_connected()).await;
    }

    let mut connection_open = false;
    for event in broker.events() {
        match event {
            BrokerEvent::ConnectionOpened { .. } => connection_open = true,
            BrokerEvent::ConnectionClosed { .. } => connection_open = false,
            BrokerEvent::ChannelOpened { channel } => assert!(
                connection_open,
                "channel {channel} was opened while the connection was closed"
            ),
            _ => {}
        }
    }
}

#[tokio::test]
async fn closing_the_client_stops_the_supervisors() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;

    client.close().await;

    assert_eq!(0, broker.open_connections());
    assert_eq!(0, broker.open_channels());
    assert!(!client.is_connected());
    // An intentional close is never followed by a reconnection.
    tokio::time::sleep(RETRY_INTERVAL * 5).await;
    assert_eq!(
        1,
        count(&broker, |e| matches!(e, BrokerEvent::ConnectionOpened { .. }))
    );

    assert!(matches!(
        client.declare_exchange("orders", "topic", true).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        client.publish("", "jobs", Message::new("late")).await,
        Err(Error::Closed)
    ));
    // Idempotent.
    client.close().await;
}

#[tokio::test]
async fn dropping_the_last_client_shuts_everything_down() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker).await;
    let clone = client.clone();

    drop(client);
    tokio::time::sleep(RETRY_INTERVAL).await;
    assert_eq!(1, broker.open_connections());

    drop(clone);
    eventually("the connection is closed", || broker.open_connections() == 0).await;
    assert_eq!(0, broker.open_channels());
}

#[tokio::test]
async fn the_connection_handle_follows_reconnections() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let (shutdown, signal) = Shutdown::new();
    let supervisor = ConnectionSupervisor::start(broker.clone(), RETRY_INTERVAL, signal)
        .await
        .unwrap();
    let handle = supervisor.handle();
    let first = handle.current().id();

    broker.drop_connections();

    eventually("a new connection is handed out", || {
        handle.is_open() && handle.current().id() != first
    })
    .await;

    shutdown.trigger();
    supervisor.join().await;
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn a_recreated_channel_gets_a_new_correlation_id() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let (shutdown, signal) = Shutdown::new();
    let connections = ConnectionSupervisor::start(broker.clone(), RETRY_INTERVAL, signal.clone())
        .await
        .unwrap();
    let channels = ChannelSupervisor::start(connections.handle(), RETRY_INTERVAL, signal)
        .await
        .unwrap();
    let handle = channels.handle();
    let first = handle.current();

    broker.close_channels();

    eventually("a new channel is handed out", || handle.is_open()).await;
    let second = handle.current();
    assert_ne!(first.correlation_id, second.correlation_id);
    assert_ne!(first.channel.id(), second.channel.id());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), async {
        channels.join().await;
        connections.join().await;
    })
    .await
    .expect("the supervisors did not stop");
    assert_eq!(0, broker.open_connections());
}
