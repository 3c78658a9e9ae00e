//! An in-process broker implementing the [`Transport`] seam.
//!
//! [`InMemoryBroker`] routes, queues and dispatches messages the way RabbitMq does for the
//! features the client relies on (direct, fanout and topic routing, the default exchange,
//! prefetch limits, acks and requeues, redelivery flags) and lets tests inject faults:
//! refused connections, failed channel openings, failed publishes, connections and channels
//! closed by the broker.
//!
//! Every interaction is recorded as a [`BrokerEvent`], in order.
//!
//! Queue arguments are recorded as declared. Only the priority ceiling is honoured when
//! enqueueing, messages never expire.
use super::{
    Acknowledge, BrokerChannel, BrokerConnection, CloseReason, Delivery, DeliveryStream,
    Transport,
};
use crate::publishers::Message;
use crate::topology::{ExchangeKind, QueueDeclaration};
use amq_protocol_types::FieldTable;
use anyhow::{anyhow, bail};
use futures_util::StreamExt;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

/// Something that happened on the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionOpened {
        connection: u64,
    },
    ConnectionClosed {
        connection: u64,
    },
    ChannelOpened {
        channel: u64,
    },
    ChannelClosed {
        channel: u64,
    },
    QosSet {
        channel: u64,
        prefetch_count: u16,
    },
    Subscribed {
        queue: String,
        consumer_tag: String,
    },
    Published {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
    },
    Delivered {
        queue: String,
        consumer_tag: String,
        body: Vec<u8>,
        redelivered: bool,
    },
    Acked {
        queue: String,
        body: Vec<u8>,
    },
    Nacked {
        queue: String,
        body: Vec<u8>,
        requeue: bool,
    },
}

/// A message accepted by the broker, as it was published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// A cheaply cloneable handle to a broker living in this process.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    refuse_connections: bool,
    failing_connects: usize,
    failing_channel_opens: usize,
    failing_publishes: usize,
    exchanges: HashMap<String, DeclaredExchange>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, watch::Sender<Option<CloseReason>>>,
    channels: HashMap<u64, ChannelState>,
    published: Vec<PublishedMessage>,
    events: Vec<BrokerEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct DeclaredExchange {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct QueueState {
    declaration: QueueDeclaration,
    messages: VecDeque<StoredMessage>,
    // Round-robin order: the next consumer to receive a message is at the front.
    consumers: VecDeque<ConsumerState>,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    priority: u8,
    redelivered: bool,
}

struct ConsumerState {
    tag: String,
    channel: u64,
    auto_ack: bool,
    prefetch_count: u16,
    sender: mpsc::UnboundedSender<Result<Delivery, anyhow::Error>>,
}

struct ChannelState {
    connection: u64,
    closed: watch::Sender<Option<CloseReason>>,
    prefetch_count: u16,
    last_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every connection attempt fails.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Fail the next `n` channel openings.
    pub fn fail_next_channel_opens(&self, n: usize) {
        self.lock().failing_channel_opens = n;
    }

    /// Reject the next `n` publishes, as a broker nack would.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    /// Close every open connection, and their channels, with an error.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(
                &self.weak(),
                id,
                CloseReason::Error("CONNECTION_FORCED - broker forced connection closure".into()),
            );
        }
    }

    /// Close every open channel with an error, leaving the connections untouched.
    pub fn close_channels(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(
                &self.weak(),
                id,
                CloseReason::Error("CHANNEL_ERROR - channel closed by the broker".into()),
            );
        }
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind.clone())
    }

    pub fn queue_declaration(&self, name: &str) -> Option<QueueDeclaration> {
        self.lock().queues.get(name).map(|q| q.declaration.clone())
    }

    /// The arguments table the queue was declared with.
    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.declaration.arguments.to_field_table())
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Messages waiting in `queue`, excluding those delivered but not yet settled.
    pub fn ready_messages(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_messages(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Consumers currently subscribed to `queue`.
    pub fn consumers(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn weak(&self) -> Weak<Mutex<State>> {
        Arc::downgrade(&self.state)
    }

    fn open_connection(&self) -> Result<InMemoryConnection, anyhow::Error> {
        let mut state = self.lock();
        if state.refuse_connections {
            bail!("Connection refused (os error 111)");
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("Connection refused (os error 111)");
        }
        let id = state.next_id();
        let (closed, receiver) = watch::channel(None);
        state.connections.insert(id, closed);
        state
            .events
            .push(BrokerEvent::ConnectionOpened { connection: id });
        Ok(InMemoryConnection {
            id,
            broker: self.clone(),
            closed: receiver,
        })
    }

    fn open_channel(&self, connection: u64) -> Result<InMemoryChannel, anyhow::Error> {
        let mut state = self.lock();
        if !state.connections.contains_key(&connection) {
            bail!("the connection is closed");
        }
        if state.failing_channel_opens > 0 {
            state.failing_channel_opens -= 1;
            bail!("CHANNEL_ERROR - failed to open the channel");
        }
        let id = state.next_id();
        let (closed, receiver) = watch::channel(None);
        state.channels.insert(
            id,
            ChannelState {
                connection,
                closed,
                prefetch_count: 0,
                last_delivery_tag: 0,
                unacked: HashMap::new(),
            },
        );
        state.events.push(BrokerEvent::ChannelOpened { channel: id });
        Ok(InMemoryChannel {
            id,
            broker: self.clone(),
            closed: receiver,
        })
    }

    fn declare_exchange(
        &self,
        channel: u64,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let declared = DeclaredExchange {
            kind: kind.clone(),
            durable,
        };
        match state.exchanges.get(name) {
            Some(existing) if *existing != declared => bail!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': \
                 received '{kind}' but current is '{}'",
                existing.kind
            ),
            Some(_) => {}
            None => {
                state.exchanges.insert(name.to_owned(), declared);
            }
        }
        Ok(())
    }

    fn declare_queue(
        &self,
        channel: u64,
        declaration: &QueueDeclaration,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        match state.queues.get(&declaration.name) {
            Some(existing) => {
                let current = &existing.declaration;
                if current.durable != declaration.durable
                    || current.arguments.to_field_table() != declaration.arguments.to_field_table()
                {
                    bail!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        declaration.name
                    );
                }
            }
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        messages: VecDeque::new(),
                        consumers: VecDeque::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn bind_queue(
        &self,
        channel: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        if exchange.is_empty() {
            bail!("ACCESS_REFUSED - operation not permitted on the default exchange");
        }
        if !state.exchanges.contains_key(exchange) {
            bail!("NOT_FOUND - no exchange '{exchange}'");
        }
        if !state.queues.contains_key(queue) {
            bail!("NOT_FOUND - no queue '{queue}'");
        }
        let binding = Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn qos(&self, channel: u64, prefetch_count: u16) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        if let Some(c) = state.channels.get_mut(&channel) {
            c.prefetch_count = prefetch_count;
        }
        state.events.push(BrokerEvent::QosSet {
            channel,
            prefetch_count,
        });
        Ok(())
    }

    fn publish(
        &self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            bail!("the broker did not confirm the message");
        }
        let queues = state.route(exchange, routing_key)?;
        state.events.push(BrokerEvent::Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: message.body.clone(),
        });
        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });
        for name in &queues {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.enqueue(StoredMessage {
                    body: message.body.clone(),
                    priority: message.priority,
                    redelivered: false,
                });
            }
        }
        let weak = self.weak();
        for name in &queues {
            state.dispatch(&weak, name);
        }
        Ok(())
    }

    fn consume(
        &self,
        channel: u64,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let mut state = self.lock();
        let prefetch_count = state.ensure_channel(channel)?.prefetch_count;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            bail!("NOT_FOUND - no queue '{queue}'");
        };
        if queue_state
            .consumers
            .iter()
            .any(|c| c.channel == channel && c.tag == consumer_tag)
        {
            bail!("NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'");
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push_back(ConsumerState {
            tag: consumer_tag.to_owned(),
            channel,
            auto_ack,
            prefetch_count,
            sender,
        });
        state.events.push(BrokerEvent::Subscribed {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        });
        state.dispatch(&self.weak(), queue);

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(stream.boxed())
    }

    fn close_channel(&self, channel: u64) {
        self.lock()
            .close_channel(&self.weak(), channel, CloseReason::Clean);
    }

    fn close_connection(&self, connection: u64) {
        self.lock()
            .close_connection(&self.weak(), connection, CloseReason::Clean);
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> Result<&ChannelState, anyhow::Error> {
        self.channels
            .get(&channel)
            .ok_or_else(|| anyhow!("the channel is closed"))
    }

    /// The queues a message published to `exchange` with `routing_key` ends up in.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, anyhow::Error> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }
        let Some(declared) = self.exchanges.get(exchange) else {
            bail!("NOT_FOUND - no exchange '{exchange}'");
        };
        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match &declared.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(
                    &binding.routing_key.split('.').collect::<Vec<_>>(),
                    &routing_key.split('.').collect::<Vec<_>>(),
                ),
                ExchangeKind::Fanout | ExchangeKind::Headers | ExchangeKind::Custom(_) => true,
            };
            if matches && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    /// Push ready messages of `queue` to its consumers, round-robin, within their prefetch
    /// limits.
    fn dispatch(&mut self, broker: &Weak<Mutex<State>>, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| !c.sender.is_closed());
        let channels = &mut self.channels;
        let events = &mut self.events;

        while !queue.messages.is_empty() {
            let available = queue.consumers.iter().position(|consumer| {
                consumer.auto_ack
                    || consumer.prefetch_count == 0
                    || channels.get(&consumer.channel).is_some_and(|channel| {
                        channel
                            .unacked
                            .values()
                            .filter(|u| u.consumer_tag == consumer.tag)
                            .count()
                            < usize::from(consumer.prefetch_count)
                    })
            });
            let Some(consumer) = available.and_then(|i| queue.consumers.remove(i)) else {
                return;
            };
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                continue;
            };
            let Some(message) = queue.messages.pop_front() else {
                queue.consumers.push_back(consumer);
                return;
            };

            channel.last_delivery_tag += 1;
            let delivery_tag = channel.last_delivery_tag;
            if !consumer.auto_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        consumer_tag: consumer.tag.clone(),
                        message: message.clone(),
                    },
                );
            }
            let delivery = Delivery::new(
                delivery_tag,
                message.redelivered,
                message.body.clone(),
                InMemoryAcker {
                    broker: broker.clone(),
                    channel: consumer.channel,
                    delivery_tag,
                },
            );
            if consumer.sender.send(Ok(delivery)).is_err() {
                // The subscriber went away in the meantime.
                channel.unacked.remove(&delivery_tag);
                queue.messages.push_front(message);
                continue;
            }
            events.push(BrokerEvent::Delivered {
                queue: queue_name.to_owned(),
                consumer_tag: consumer.tag.clone(),
                body: message.body,
                redelivered: message.redelivered,
            });
            queue.consumers.push_back(consumer);
        }
    }

    fn settle(
        &mut self,
        broker: &Weak<Mutex<State>>,
        channel: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), anyhow::Error> {
        let unacked = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("the channel is closed"))?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| anyhow!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))?;
        let Unacked { queue, message, .. } = unacked;
        match settlement {
            Settlement::Ack => self.events.push(BrokerEvent::Acked {
                queue: queue.clone(),
                body: message.body,
            }),
            Settlement::Nack { requeue } => {
                self.events.push(BrokerEvent::Nacked {
                    queue: queue.clone(),
                    body: message.body.clone(),
                    requeue,
                });
                if requeue {
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.messages.push_front(StoredMessage {
                            redelivered: true,
                            ..message
                        });
                    }
                }
            }
        }
        self.dispatch(broker, &queue);
        Ok(())
    }

    /// Drop the consumers of `channel` and requeue its unsettled deliveries.
    fn close_channel(&mut self, broker: &Weak<Mutex<State>>, channel: u64, reason: CloseReason) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
        let mut unacked: Vec<(u64, Unacked)> = state.unacked.into_iter().collect();
        // Highest tags first, so that pushing to the front restores delivery order.
        unacked.sort_by_key(|(tag, _)| Reverse(*tag));
        let mut touched: Vec<String> = Vec::new();
        for (_, Unacked { queue, message, .. }) in unacked {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        state.closed.send_replace(Some(reason));
        self.events.push(BrokerEvent::ChannelClosed { channel });
        for queue in touched {
            self.dispatch(broker, &queue);
        }
    }

    fn close_connection(
        &mut self,
        broker: &Weak<Mutex<State>>,
        connection: u64,
        reason: CloseReason,
    ) {
        let Some(closed) = self.connections.remove(&connection) else {
            return;
        };
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(broker, channel, reason.clone());
        }
        closed.send_replace(Some(reason));
        self.events
            .push(BrokerEvent::ConnectionClosed { connection });
    }
}

impl QueueState {
    fn enqueue(&mut self, message: StoredMessage) {
        let ceiling = self.declaration.arguments.max_priority.unwrap_or(0);
        if ceiling == 0 {
            self.messages.push_back(message);
            return;
        }
        let priority = message.priority.min(ceiling);
        let message = StoredMessage { priority, ..message };
        match self.messages.iter().position(|m| m.priority < priority) {
            Some(index) => self.messages.insert(index, message),
            None => self.messages.push_back(message),
        }
    }
}

/// `*` matches exactly one word, `#` matches zero or more words.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key)
                || key
                    .split_first()
                    .is_some_and(|(_, key_rest)| topic_matches(pattern, key_rest))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((other, key_rest))) => {
            word == other && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

async fn wait_for_close(mut closed: watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        if let Some(reason) = closed.borrow_and_update().clone() {
            return reason;
        }
        if closed.changed().await.is_err() {
            return CloseReason::Clean;
        }
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, anyhow::Error> {
        self.open_connection()
    }
}

pub struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }

    async fn closed(&self) -> CloseReason {
        wait_for_close(self.closed.clone()).await
    }

    async fn create_channel(&self) -> Result<InMemoryChannel, anyhow::Error> {
        self.broker.open_channel(self.id)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.broker.close_connection(self.id);
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl InMemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }

    async fn closed(&self) -> CloseReason {
        wait_for_close(self.closed.clone()).await
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.broker.close_channel(self.id);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        self.broker.declare_exchange(self.id, name, kind, durable)
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error> {
        self.broker.declare_queue(self.id, declaration)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.broker.bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.broker.qos(self.id, prefetch_count)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        self.broker.publish(self.id, exchange, routing_key, message)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error> {
        self.broker.consume(self.id, queue, consumer_tag, auto_ack)
    }
}

struct InMemoryAcker {
    broker: Weak<Mutex<State>>,
    channel: u64,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), anyhow::Error> {
        let state = self
            .broker
            .upgrade()
            .ok_or_else(|| anyhow!("the broker is gone"))?;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.settle(&self.broker, self.channel, self.delivery_tag, settlement)
    }
}

#[async_trait::async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Nack { requeue })
    }
}
