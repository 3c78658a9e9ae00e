use crate::consumers::Handler;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{ChannelHandle, LiveChannel};
use crate::topology::check_short_string;
use crate::transport::{BrokerChannel, Delivery, DeliveryStream};
use crate::Error;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Pulls messages from a queue and feeds them, one at a time, to a [`Handler`].
///
/// # Delivery guarantees
///
/// Every delivery is acked when the handler succeeds and nacked with requeue when it fails,
/// so a message is only removed from the queue once it has been processed (at-least-once).
/// With `auto_ack` the broker considers messages settled as soon as they are sent and no
/// acknowledgement is performed.
///
/// # Fault tolerance
///
/// The subscription lives in a background relay task. When it ends, because the channel
/// or the connection went away, the relay subscribes again on whatever channel the
/// [`ChannelSupervisor`](crate::supervisor::ChannelSupervisor) holds, backing off by
/// `retry_interval` between failed attempts. The handler never notices.
pub struct Consumer<Ch> {
    channels: ChannelHandle<Ch>,
    retry_interval: Duration,
    shutdown: ShutdownSignal,
    // Disambiguates the consumer tags of subscriptions sharing a channel.
    subscriptions: AtomicU64,
}

impl<Ch: BrokerChannel> Consumer<Ch> {
    pub fn new(
        channels: ChannelHandle<Ch>,
        retry_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            channels,
            retry_interval,
            shutdown,
            subscriptions: AtomicU64::new(0),
        }
    }

    /// Process messages from `queue` until the client shuts down.
    ///
    /// At most `prefetch_count` messages are in flight between the broker and the handler;
    /// a prefetch count of zero is treated as one.
    ///
    /// Returns `Ok(())` once shutdown has been requested. Handler failures never stop the
    /// consumer.
    #[tracing::instrument(name = "consumer_run", skip(self, handler))]
    pub async fn consume<H: Handler>(
        &self,
        queue: &str,
        auto_ack: bool,
        prefetch_count: u16,
        handler: H,
    ) -> Result<(), Error> {
        if queue.is_empty() {
            return Err(Error::InvalidArgument("the queue name cannot be empty".into()));
        }
        check_short_string("queue name", queue)?;
        let prefetch_count = prefetch_count.max(1);

        let Some(qos_applied_on) = self.apply_qos(prefetch_count).await else {
            return Ok(());
        };

        let (sender, mut deliveries) = mpsc::channel(usize::from(prefetch_count));
        let relay = Relay {
            channels: self.channels.clone(),
            queue: queue.to_owned(),
            auto_ack,
            prefetch_count,
            subscription: self.subscriptions.fetch_add(1, Ordering::Relaxed) + 1,
            qos_applied_on,
            retry_interval: self.retry_interval,
            shutdown: self.shutdown.clone(),
            sender,
        };
        let relay = tokio::spawn(relay.run());

        let handler = Arc::new(handler);
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            process(delivery, Arc::clone(&handler), queue, auto_ack).await;
        }

        relay.abort();
        info!("consumer stopped");
        Ok(())
    }

    /// Returns the channel QoS was applied to, or `None` if shutdown was requested first.
    async fn apply_qos(&self, prefetch_count: u16) -> Option<Arc<Ch>> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            let live = self.channels.current();
            match live.channel.qos(prefetch_count).await {
                Ok(()) => return Some(live.channel),
                Err(e) => {
                    error!(error = ?e, prefetch_count, "failed to set QoS");
                    if self.shutdown.sleep(self.retry_interval).await {
                        return None;
                    }
                }
            }
        }
    }
}

/// Run the handler and settle the delivery according to its outcome.
///
/// The handler runs as its own task: a panic is treated as a failure.
async fn process<H: Handler>(
    mut delivery: Delivery,
    handler: Arc<H>,
    queue: &str,
    auto_ack: bool,
) {
    let payload = std::mem::take(&mut delivery.data);
    let outcome = tokio::spawn(async move { handler.handle(&payload).await }).await;
    if auto_ack {
        return;
    }
    let delivery_tag = delivery.delivery_tag;
    let settled = match outcome {
        Ok(Ok(())) => delivery.ack().await,
        Ok(Err(_)) => delivery.nack(true).await,
        Err(e) => {
            error!(error = ?e, queue, delivery_tag, "message handler panicked");
            delivery.nack(true).await
        }
    };
    if let Err(e) = settled {
        warn!(
            error = ?e,
            queue,
            delivery_tag,
            "failed to settle the delivery, the broker will redeliver it"
        );
    }
}

/// Owns the subscription and forwards deliveries to the processing loop.
struct Relay<Ch> {
    channels: ChannelHandle<Ch>,
    queue: String,
    auto_ack: bool,
    prefetch_count: u16,
    subscription: u64,
    qos_applied_on: Arc<Ch>,
    retry_interval: Duration,
    shutdown: ShutdownSignal,
    sender: mpsc::Sender<Delivery>,
}

impl<Ch: BrokerChannel> Relay<Ch> {
    async fn run(mut self) {
        while let Some(subscription) = self.subscribe().await {
            if !self.forward(subscription).await {
                break;
            }
            debug!(queue = %self.queue, "subscription ended, subscribing again");
        }
        debug!(queue = %self.queue, "relay stopped");
    }

    /// Returns `None` if shutdown was requested before the subscription succeeded.
    async fn subscribe(&mut self) -> Option<DeliveryStream> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            let live = self.channels.current();
            match self.try_subscribe(&live).await {
                Ok(subscription) => return Some(subscription),
                Err(e) => {
                    error!(error = ?e, queue = %self.queue, "failed to subscribe");
                    if self.shutdown.sleep(self.retry_interval).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_subscribe(
        &mut self,
        live: &LiveChannel<Ch>,
    ) -> Result<DeliveryStream, anyhow::Error> {
        // QoS is a channel setting: a recreated channel starts without it.
        if !Arc::ptr_eq(&live.channel, &self.qos_applied_on) {
            live.channel.qos(self.prefetch_count).await?;
            self.qos_applied_on = Arc::clone(&live.channel);
        }
        let consumer_tag = format!("{}-{}", live.correlation_id, self.subscription);
        let subscription = live
            .channel
            .consume(&self.queue, &consumer_tag, self.auto_ack)
            .await?;
        info!(queue = %self.queue, %consumer_tag, "subscribed");
        Ok(subscription)
    }

    /// Returns `false` when there is nobody left to forward deliveries to.
    async fn forward(&self, mut subscription: DeliveryStream) -> bool {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return false,
                next = subscription.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    if self.sender.send(delivery).await.is_err() {
                        return false;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = ?e, queue = %self.queue, "subscription failed");
                    return true;
                }
                None => return true,
            }
        }
    }
}
