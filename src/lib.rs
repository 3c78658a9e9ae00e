//! `rabbit-warren` is a self-healing RabbitMq client, built on top of [`lapin`].
//!
//! A [`RabbitClient`] owns a single connection and a single channel to the broker.
//! Both are watched by background supervisors and recreated transparently when the network
//! or the broker misbehaves, so application code never has to deal with a transient outage:
//!
//! - publishing retries on a fixed interval until the broker accepts the message;
//! - consuming resubscribes whenever the subscription ends, and every delivery is acked or
//!   requeued according to the outcome of the handler (at-least-once).
//!
//! [`RabbitClient::connect`] is the best starting point.
//!
//! ```no_run
//! use rabbit_warren::amqp::configuration::RabbitMqSettings;
//! use rabbit_warren::publishers::Message;
//! use rabbit_warren::RabbitClient;
//!
//! async fn example() -> Result<(), rabbit_warren::Error> {
//!     let client = RabbitClient::connect(&RabbitMqSettings::default()).await?;
//!     client.declare_exchange("orders", "topic", true).await?;
//!     client
//!         .publish("orders", "orders.created", Message::new("order-1"))
//!         .await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod consumers;
pub mod publishers;
pub mod shutdown;
pub mod supervisor;
pub mod topology;
pub mod transport;

mod client;
mod error;

pub use client::RabbitClient;
pub use error::Error;
