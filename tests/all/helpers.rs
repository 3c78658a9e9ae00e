use rabbit_warren::amqp::configuration::RetrySettings;
use rabbit_warren::transport::in_memory::{BrokerEvent, InMemoryBroker};
use rabbit_warren::RabbitClient;
use std::time::{Duration, Instant};

pub const RETRY_INTERVAL: Duration = Duration::from_millis(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn retry_settings() -> RetrySettings {
    RetrySettings::uniform(RETRY_INTERVAL)
}

pub async fn get_client(broker: &InMemoryBroker) -> RabbitClient<InMemoryBroker> {
    init_tracing();
    RabbitClient::with_transport(broker.clone(), retry_settings())
        .await
        .unwrap()
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count(broker: &InMemoryBroker, predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
    broker.events().iter().filter(|e| predicate(e)).count()
}
