use crate::amqp::configuration::{RabbitMqSettings, RetrySettings};
use crate::amqp::ConnectionFactory;
use crate::consumers::{Consumer, Handler};
use crate::publishers::{Message, Publisher};
use crate::shutdown::Shutdown;
use crate::supervisor::{ChannelSupervisor, ConnectionSupervisor};
use crate::topology::{QueueDeclaration, Topology};
use crate::transport::{BrokerConnection, Transport};
use crate::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// A self-healing client for a RabbitMq broker.
///
/// `RabbitClient` owns a [`ConnectionSupervisor`] and a [`ChannelSupervisor`], and exposes
/// topology declarations, publishing and consuming on top of the channel they keep alive.
///
/// It is cheap to clone: all clones share the same connection and channel.
/// The background supervisors stop when [`RabbitClient::close`] is called or when the last
/// clone is dropped.
pub struct RabbitClient<T: Transport = ConnectionFactory> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for RabbitClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    connections: ConnectionSupervisor<T>,
    channels: ChannelSupervisor<T::Connection>,
    topology: Topology<ChannelOf<T>>,
    publisher: Publisher<ChannelOf<T>>,
    consumer: Consumer<ChannelOf<T>>,
    // Dropping it stops the supervisors.
    shutdown: Shutdown,
}

impl RabbitClient<ConnectionFactory> {
    /// Connect to the broker described by `settings`.
    ///
    /// Fails if the settings are invalid or if the first connection or channel cannot be
    /// established: there is no retry at this stage.
    #[tracing::instrument(name = "rabbit_client_connect", skip_all)]
    pub async fn connect(settings: &RabbitMqSettings) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(settings)?;
        Self::with_transport(factory, settings.retry.clone()).await
    }
}

impl<T: Transport> RabbitClient<T> {
    /// Build a client on top of an arbitrary [`Transport`].
    pub async fn with_transport(transport: T, retry: RetrySettings) -> Result<Self, Error> {
        let (shutdown, signal) = Shutdown::new();
        let reconnect_interval = retry.reconnect_interval();

        let connections =
            ConnectionSupervisor::start(transport, reconnect_interval, signal.clone()).await?;
        let channels = match ChannelSupervisor::start(
            connections.handle(),
            reconnect_interval,
            signal.clone(),
        )
        .await
        {
            Ok(channels) => channels,
            Err(e) => {
                shutdown.trigger();
                connections.join().await;
                return Err(e);
            }
        };

        let topology = Topology::new(channels.handle());
        let publisher = Publisher::new(
            channels.handle(),
            retry.publish_retry_interval(),
            signal.clone(),
        );
        let consumer = Consumer::new(channels.handle(), retry.consume_retry_interval(), signal);
        info!("RabbitMq client ready");

        Ok(Self {
            inner: Arc::new(Inner {
                connections,
                channels,
                topology,
                publisher,
                consumer,
                shutdown,
            }),
        })
    }

    /// Create an exchange if it does not exist yet.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        self.inner
            .topology
            .declare_exchange(name, kind, durable)
            .await
    }

    /// Create a queue if it does not exist yet.
    ///
    /// A zero `priority_ceiling` disables priorities, a zero `ttl` lets messages live forever.
    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        priority_ceiling: u8,
        ttl: Duration,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        self.inner
            .topology
            .declare_queue(name, durable, priority_ceiling, ttl)
            .await
    }

    pub async fn declare_queue_with(&self, declaration: &QueueDeclaration) -> Result<(), Error> {
        self.ensure_running()?;
        self.inner.topology.declare_queue_with(declaration).await
    }

    /// Bind `queue` to `exchange`, using the queue name as routing key.
    pub async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), Error> {
        self.ensure_running()?;
        self.inner.topology.bind_queue(queue, exchange).await
    }

    /// Publish `message`, retrying until the broker accepts it.
    ///
    /// See [`Publisher::publish`].
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), Error> {
        self.inner
            .publisher
            .publish(exchange, routing_key, message)
            .await
    }

    /// Process messages from `queue` with `handler` until the client is closed.
    ///
    /// See [`Consumer::consume`].
    pub async fn consume<H: Handler>(
        &self,
        queue: &str,
        auto_ack: bool,
        prefetch_count: u16,
        handler: H,
    ) -> Result<(), Error> {
        self.inner
            .consumer
            .consume(queue, auto_ack, prefetch_count, handler)
            .await
    }

    /// `true` if both the connection and the channel are currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connections.handle().is_open() && self.inner.channels.handle().is_open()
    }

    /// Stop the supervisors and close the channel and the connection.
    ///
    /// Pending `publish` calls return [`Error::Closed`], running `consume` calls return
    /// `Ok(())`. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.trigger();
        self.inner.channels.join().await;
        self.inner.connections.join().await;
        info!("RabbitMq client closed");
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.inner.shutdown.signal().is_triggered() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
