//! The seam between the supervisors and the wire.
//!
//! [`Transport`], [`BrokerConnection`] and [`BrokerChannel`] describe the handful of broker
//! primitives the client relies on. [`ConnectionFactory`](crate::amqp::ConnectionFactory)
//! implements them on top of `lapin`; `in_memory::InMemoryBroker`, behind the `test-util`
//! feature, implements them in-process, with fault injection, for tests.
use crate::publishers::Message;
use crate::topology::{ExchangeKind, QueueDeclaration};
use futures_util::stream::BoxStream;
use std::fmt;

#[cfg(any(test, feature = "test-util"))]
pub mod in_memory;

/// Why a connection or channel stopped being usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The broker (or the network) reported an error.
    Error(String),
    /// The close notification ended without an error attached.
    Clean,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "{reason}"),
            Self::Clean => write!(f, "closed without error"),
        }
    }
}

/// Capable of dialing the broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a brand new connection.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A live transport connection.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is closed, for whatever reason.
    async fn closed(&self) -> CloseReason;

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A logical channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Resolves once the channel is closed, for whatever reason.
    async fn closed(&self) -> CloseReason;

    async fn close(&self) -> Result<(), anyhow::Error>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Set the prefetch count for consumers created on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// Publish a message. `Ok` means the broker accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), anyhow::Error>;

    /// Start a subscription on `queue`.
    ///
    /// The returned stream ends when the subscription ends (cancelled, channel closed, ...).
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;
    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

/// A message pushed by the broker to one of our subscriptions.
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel it was delivered on.
    pub delivery_tag: u64,
    /// Whether this message was delivered before and not acknowledged.
    pub redelivered: bool,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    // Consumed by `ack`/`nack`: a delivery is settled at most once.
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: impl Acknowledge,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> Result<(), anyhow::Error> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), anyhow::Error> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("data", &String::from_utf8_lossy(&self.data))
            .finish()
    }
}
