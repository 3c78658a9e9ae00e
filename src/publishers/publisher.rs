use crate::publishers::Message;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::ChannelHandle;
use crate::topology::check_short_string;
use crate::transport::BrokerChannel;
use crate::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};
use uuid::Uuid;

/// Publishes messages on the channel currently held by the
/// [`ChannelSupervisor`](crate::supervisor::ChannelSupervisor).
///
/// # Fault tolerance
///
/// A publish that fails is logged and attempted again after `retry_interval`, on whatever
/// channel is live at that point, until the broker accepts the message.
/// Publishing never drops a message, but it can block for as long as the broker is
/// unreachable: wrap the call in [`tokio::time::timeout`] if you need a deadline.
pub struct Publisher<Ch> {
    channels: ChannelHandle<Ch>,
    retry_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<Ch: BrokerChannel> Publisher<Ch> {
    pub fn new(
        channels: ChannelHandle<Ch>,
        retry_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            channels,
            retry_interval,
            shutdown,
        }
    }

    /// Publish a message to `exchange` with `routing_key`.
    ///
    /// Only caller mistakes ([`Error::InvalidArgument`]) and shutting the client down while
    /// retrying ([`Error::Closed`]) are reported; broker failures are retried.
    #[tracing::instrument(name = "publish", level = "debug", skip(self, message))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), Error> {
        check_short_string("exchange name", exchange)?;
        check_short_string("routing key", routing_key)?;
        let message = inject_amqp_properties(message);

        loop {
            if self.shutdown.is_triggered() {
                return Err(Error::Closed);
            }
            let live = self.channels.current();
            match live.channel.publish(exchange, routing_key, &message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(error = ?e, exchange, routing_key, "publish failed");
                    if self.shutdown.sleep(self.retry_interval).await {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }
}

/// Fill in the content type, a message id and the current timestamp when missing.
fn inject_amqp_properties(mut message: Message) -> Message {
    if message.content_type.is_empty() {
        message.content_type = message.content_type().to_owned();
    }
    if message.message_id.is_none() {
        message.message_id = Some(Uuid::new_v4().to_string());
    }
    if message.timestamp.is_none() {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => message.timestamp = Some(now.as_secs()),
            Err(_) => warn!("System time is before 1970"),
        }
    }
    message
}
