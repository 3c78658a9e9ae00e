use rabbit_warren::amqp::configuration::RabbitMqSettings;
use rabbit_warren::consumers::ClosureHandler;
use rabbit_warren::publishers::{Message, MIME_APPLICATION_JSON};
use rabbit_warren::RabbitClient;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set `RUST_LOG=rabbit_warren=debug` to see the supervisors at work.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // First of all we build the configuration for our client.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();

    // Connecting is the only step that can fail because of the broker: from now on the client
    // recreates its connection and its channel on its own. Try restarting RabbitMq while the
    // demo is running.
    let client = RabbitClient::connect(&settings).await?;

    client.declare_exchange("orders", "topic", true).await?;
    // Up to 10 priority levels, messages expire after one minute.
    client
        .declare_queue("orders.created", true, 10, Duration::from_secs(60))
        .await?;
    // The queue name doubles as routing key.
    client.bind_queue("orders.created", "orders").await?;

    let consumer = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .consume(
                    "orders.created",
                    false,
                    10,
                    ClosureHandler(|payload: Vec<u8>| async move {
                        let order: serde_json::Value = serde_json::from_slice(&payload)?;
                        tracing::info!(%order, "order received");
                        // Returning an error would requeue the message.
                        Ok::<(), anyhow::Error>(())
                    }),
                )
                .await
        })
    };

    for id in 0..100 {
        let order = serde_json::json!({ "id": id, "amount": id * 100 });
        // Publishing blocks, retrying, while the broker is unreachable.
        client
            .publish(
                "orders",
                "orders.created",
                Message::new(order.to_string())
                    .with_content_type(MIME_APPLICATION_JSON)
                    .persistent(),
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    client.close().await;
    consumer.await??;
    Ok(())
}
