use crate::shutdown::ShutdownSignal;
use crate::transport::{BrokerConnection, CloseReason, Transport};
use crate::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Read access to the connection currently owned by a [`ConnectionSupervisor`].
pub struct ConnectionHandle<C> {
    pub(super) slot: watch::Receiver<Arc<C>>,
}

impl<C> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<C: BrokerConnection> ConnectionHandle<C> {
    /// The live connection, or the last one if it is being replaced.
    pub fn current(&self) -> Arc<C> {
        Arc::clone(&*self.slot.borrow())
    }

    pub fn is_open(&self) -> bool {
        self.current().is_open()
    }
}

/// Owns the transport connection to the broker and re-establishes it, forever, whenever it
/// closes.
///
/// # Lifecycle
///
/// [`ConnectionSupervisor::start`] dials once: if that fails there is nothing to supervise
/// and the error is returned to the caller.
/// From then on a background watcher waits for the connection to close, sleeps
/// `reconnect_interval`, dials again and keeps doing so until it succeeds.
///
/// The watcher stops when the [`ShutdownSignal`] fires: a close observed after shutdown
/// was requested is ours and is never followed by a reconnection attempt. The live
/// connection is closed on the way out.
pub struct ConnectionSupervisor<T: Transport> {
    handle: ConnectionHandle<T::Connection>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    #[tracing::instrument(name = "connection_supervisor_start", skip_all)]
    pub async fn start(
        transport: T,
        reconnect_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<Self, Error> {
        let connection = transport.connect().await.map_err(Error::Connect)?;
        info!("connection established");

        let (slot, receiver) = watch::channel(Arc::new(connection));
        let watcher = ConnectionWatcher {
            transport,
            slot,
            reconnect_interval,
            shutdown,
        };
        Ok(Self {
            handle: ConnectionHandle { slot: receiver },
            watcher: Mutex::new(Some(tokio::spawn(watcher.run()))),
        })
    }

    pub fn handle(&self) -> ConnectionHandle<T::Connection> {
        self.handle.clone()
    }

    /// Wait for the background watcher to exit.
    ///
    /// It only exits after shutdown has been requested.
    pub async fn join(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(error = ?e, "connection watcher terminated abnormally");
            }
        }
    }
}

struct ConnectionWatcher<T: Transport> {
    transport: T,
    slot: watch::Sender<Arc<T::Connection>>,
    reconnect_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<T: Transport> ConnectionWatcher<T> {
    async fn run(self) {
        loop {
            let connection = Arc::clone(&*self.slot.borrow());
            let reason = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                reason = connection.closed() => reason,
            };
            if self.shutdown.is_triggered() {
                break;
            }
            match reason {
                CloseReason::Error(reason) => info!(%reason, "connection closed"),
                CloseReason::Clean => info!("connection closed"),
            }
            if !self.reconnect().await {
                break;
            }
        }
        self.teardown().await;
    }

    /// Returns `false` if shutdown was requested before a new connection was established.
    async fn reconnect(&self) -> bool {
        loop {
            if self.shutdown.sleep(self.reconnect_interval).await {
                return false;
            }
            match self.transport.connect().await {
                Ok(connection) => {
                    self.slot.send_replace(Arc::new(connection));
                    info!("recreate connection success");
                    return true;
                }
                Err(e) => error!(error = ?e, "recreate connection failed"),
            }
        }
    }

    async fn teardown(&self) {
        let connection = Arc::clone(&*self.slot.borrow());
        if connection.is_open() {
            if let Err(e) = connection.close().await {
                debug!(error = ?e, "failed to close the connection during shutdown");
            }
        }
        info!("connection supervisor stopped");
    }
}
