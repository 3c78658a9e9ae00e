//! [`BrokerConnection`] and [`BrokerChannel`] on top of `lapin`.
use crate::publishers::Message;
use crate::topology::{ExchangeKind, QueueDeclaration};
use crate::transport::{
    Acknowledge, BrokerChannel, BrokerConnection, CloseReason, Delivery, DeliveryStream,
};
use anyhow::bail;
use futures_util::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{acker::Acker, BasicProperties};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

// lapin only reports errors through callbacks: closes without an error are detected by
// polling the status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A `lapin` connection, with its error notifications bridged to [`BrokerConnection::closed`].
pub struct AmqpConnection {
    inner: lapin::Connection,
    errors: watch::Receiver<Option<CloseReason>>,
    publisher_confirms: bool,
}

impl AmqpConnection {
    pub(crate) fn new(connection: lapin::Connection, publisher_confirms: bool) -> Self {
        let (sender, errors) = watch::channel(None);
        // Register a callback to log connection errors.
        connection.on_error(move |e| {
            warn!(error = ?e, "RabbitMQ broken connection");
            sender.send_replace(Some(CloseReason::Error(e.to_string())));
        });
        Self {
            inner: connection,
            errors,
            publisher_confirms,
        }
    }
}

impl AsRef<lapin::Connection> for AmqpConnection {
    fn as_ref(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn closed(&self) -> CloseReason {
        wait_for_close(self.errors.clone(), || self.is_open()).await
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<AmqpChannel, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        if self.publisher_confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(AmqpChannel {
            inner: channel,
            connection_errors: self.errors.clone(),
        })
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.close(200, "Goodbye").await?;
        Ok(())
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    inner: lapin::Channel,
    // A channel dies with its connection.
    connection_errors: watch::Receiver<Option<CloseReason>>,
}

impl AsRef<lapin::Channel> for AmqpChannel {
    fn as_ref(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn closed(&self) -> CloseReason {
        wait_for_close(self.connection_errors.clone(), || self.is_open()).await
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.close(200, "Goodbye").await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            durable: declaration.durable,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(
                &declaration.name,
                options,
                declaration.arguments.to_field_table(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.inner
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(message),
            )
            .await?
            .await?;
        if let Confirmation::Nack(_) = confirm {
            bail!("The RabbitMq broker did not confirm the message");
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        let deliveries = consumer.map(|delivery| -> Result<Delivery, anyhow::Error> {
            let LapinDelivery {
                delivery_tag,
                redelivered,
                data,
                acker,
                ..
            } = delivery?;
            Ok(Delivery::new(
                delivery_tag,
                redelivered,
                data,
                LapinAcker(acker),
            ))
        });
        Ok(deliveries.boxed())
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(message.content_type().into())
        .with_delivery_mode(message.delivery_mode.as_amqp())
        .with_priority(message.priority);
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    properties
}

/// Resolve with the first error reported by `errors`, or as soon as `is_open` turns false.
async fn wait_for_close(
    mut errors: watch::Receiver<Option<CloseReason>>,
    is_open: impl Fn() -> bool,
) -> CloseReason {
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    let mut listening = true;
    loop {
        if let Some(reason) = errors.borrow_and_update().clone() {
            return reason;
        }
        if !is_open() {
            return CloseReason::Clean;
        }
        tokio::select! {
            changed = errors.changed(), if listening => {
                // lapin dropped the callback: keep polling.
                listening = changed.is_ok();
            }
            _ = poll.tick() => {}
        }
    }
}

struct LapinAcker(Acker);

#[async_trait::async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack(BasicAckOptions::default()).await.map(drop)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.0.nack(options).await.map(drop)?;
        Ok(())
    }
}
