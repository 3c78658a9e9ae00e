use super::ConnectionHandle;
use crate::shutdown::ShutdownSignal;
use crate::transport::{BrokerChannel, BrokerConnection, CloseReason};
use crate::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The channel currently in use, together with the correlation identifier generated when it
/// was opened.
///
/// The correlation identifier tags the consumer registrations made on this channel.
pub struct LiveChannel<Ch> {
    pub channel: Arc<Ch>,
    pub correlation_id: Uuid,
}

impl<Ch> LiveChannel<Ch> {
    fn new(channel: Ch) -> Self {
        Self {
            channel: Arc::new(channel),
            correlation_id: Uuid::new_v4(),
        }
    }
}

impl<Ch> Clone for LiveChannel<Ch> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            correlation_id: self.correlation_id,
        }
    }
}

/// Read access to the channel currently owned by a [`ChannelSupervisor`].
pub struct ChannelHandle<Ch> {
    slot: watch::Receiver<LiveChannel<Ch>>,
}

impl<Ch> Clone for ChannelHandle<Ch> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<Ch: BrokerChannel> ChannelHandle<Ch> {
    /// The live channel, or the last one if it is being replaced.
    pub fn current(&self) -> LiveChannel<Ch> {
        self.slot.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.slot.borrow().channel.is_open()
    }
}

/// Owns the channel used by publishing, consuming and topology declarations, and re-opens it
/// whenever it closes.
///
/// A channel can only be opened on an open connection: after a close, every reopening attempt
/// first checks the connection currently held by the [`ConnectionSupervisor`] and, while it is
/// closed, simply waits another `reconnect_interval`.
/// Replacing the connection always replaces the channel too.
///
/// [`ConnectionSupervisor`]: super::ConnectionSupervisor
pub struct ChannelSupervisor<C: BrokerConnection> {
    handle: ChannelHandle<C::Channel>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<C: BrokerConnection> ChannelSupervisor<C> {
    #[tracing::instrument(name = "channel_supervisor_start", skip_all)]
    pub async fn start(
        connections: ConnectionHandle<C>,
        reconnect_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<Self, Error> {
        let channel = connections
            .current()
            .create_channel()
            .await
            .map_err(Error::OpenChannel)?;
        let live = LiveChannel::new(channel);
        info!(correlation_id = %live.correlation_id, "channel opened");

        let (slot, receiver) = watch::channel(live);
        let watcher = ChannelWatcher {
            connections: connections.slot,
            slot,
            reconnect_interval,
            shutdown,
        };
        Ok(Self {
            handle: ChannelHandle { slot: receiver },
            watcher: Mutex::new(Some(tokio::spawn(watcher.run()))),
        })
    }

    pub fn handle(&self) -> ChannelHandle<C::Channel> {
        self.handle.clone()
    }

    /// Wait for the background watcher to exit.
    ///
    /// It only exits after shutdown has been requested.
    pub async fn join(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(error = ?e, "channel watcher terminated abnormally");
            }
        }
    }
}

struct ChannelWatcher<C: BrokerConnection> {
    connections: watch::Receiver<Arc<C>>,
    slot: watch::Sender<LiveChannel<C::Channel>>,
    reconnect_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<C: BrokerConnection> ChannelWatcher<C> {
    async fn run(mut self) {
        loop {
            let live = self.slot.borrow().clone();
            self.connections.borrow_and_update();
            let reason = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                reason = live.channel.closed() => reason,
                replaced = self.connections.changed() => match replaced {
                    Ok(()) => CloseReason::Error("the connection was replaced".into()),
                    // The connection supervisor is gone, we are shutting down.
                    Err(_) => break,
                },
            };
            if self.shutdown.is_triggered() {
                break;
            }
            match reason {
                CloseReason::Error(reason) => info!(%reason, "channel closed"),
                CloseReason::Clean => info!("channel closed"),
            }
            if !self.reopen().await {
                break;
            }
        }
        self.teardown().await;
    }

    /// Returns `false` if shutdown was requested before a new channel was opened.
    async fn reopen(&self) -> bool {
        loop {
            if self.shutdown.sleep(self.reconnect_interval).await {
                return false;
            }
            let connection = Arc::clone(&*self.connections.borrow());
            if !connection.is_open() {
                debug!("connection is not open, postponing channel recreation");
                continue;
            }
            match connection.create_channel().await {
                Ok(channel) => {
                    let live = LiveChannel::new(channel);
                    info!(correlation_id = %live.correlation_id, "recreate channel success");
                    self.slot.send_replace(live);
                    return true;
                }
                Err(e) => error!(error = ?e, "recreate channel failed"),
            }
        }
    }

    async fn teardown(&self) {
        let live = self.slot.borrow().clone();
        if live.channel.is_open() {
            if let Err(e) = live.channel.close().await {
                debug!(error = ?e, "failed to close the channel during shutdown");
            }
        }
        info!("channel supervisor stopped");
    }
}
