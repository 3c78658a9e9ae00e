//! Idempotent declaration of exchanges, queues and bindings.
//!
//! Declarations are setup-time operations: they run against the current channel, once, and
//! failures are returned to the caller as they are - no retry policy is applied here.
use crate::supervisor::ChannelHandle;
use crate::transport::BrokerChannel;
use crate::Error;
use amq_protocol_types::{AMQPValue, FieldTable, LongInt, LongLongInt, ShortString};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Queue argument used to enable priorities, up to the given ceiling.
pub const AMQP_ARGUMENT_MAX_PRIORITY: &str = "x-max-priority";
/// Queue argument used to expire messages after the given number of milliseconds.
pub const AMQP_ARGUMENT_MESSAGE_TTL: &str = "x-message-ttl";

/// The routing behaviour of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Exchange types provided by broker plugins, e.g. `x-delayed-message`.
    Custom(String),
}

impl FromStr for ExchangeKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self, Error> {
        match kind {
            "" => Err(Error::InvalidArgument(
                "the exchange kind cannot be empty".into(),
            )),
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            custom => Ok(Self::Custom(custom.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Fanout => write!(f, "fanout"),
            Self::Topic => write!(f, "topic"),
            Self::Headers => write!(f, "headers"),
            Self::Custom(kind) => write!(f, "{kind}"),
        }
    }
}

/// Optional features of a queue.
///
/// A default `QueueArguments` produces an empty arguments table, leaving the queue
/// unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// Highest message priority honoured by the queue.
    pub max_priority: Option<u8>,
    /// How long a message can sit in the queue before being discarded.
    pub message_ttl: Option<Duration>,
}

impl QueueArguments {
    /// Build the broker arguments table.
    ///
    /// Zero priorities and TTLs below one millisecond are treated as unset.
    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        if let Some(priority) = self.max_priority.filter(|p| *p > 0) {
            table.insert(
                ShortString::from(AMQP_ARGUMENT_MAX_PRIORITY),
                AMQPValue::LongInt(LongInt::from(priority)),
            );
        }
        if let Some(ttl) = self.message_ttl {
            // The broker rejects TTLs that do not fit an unsigned 32-bit integer.
            let millis = ttl.as_millis().min(u128::from(u32::MAX));
            if millis > 0 {
                table.insert(
                    ShortString::from(AMQP_ARGUMENT_MESSAGE_TTL),
                    AMQPValue::LongLongInt(millis as LongLongInt),
                );
            }
        }
        table
    }
}

/// Everything needed to declare a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    /// Durable queues survive a broker restart.
    pub durable: bool,
    pub arguments: QueueArguments,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            arguments: QueueArguments::default(),
        }
    }

    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    #[must_use]
    pub fn max_priority(mut self, priority: u8) -> Self {
        self.arguments.max_priority = Some(priority);
        self
    }

    #[must_use]
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.arguments.message_ttl = Some(ttl);
        self
    }
}

/// Declares exchanges, queues and bindings on the channel currently held by the
/// [`ChannelSupervisor`](crate::supervisor::ChannelSupervisor).
///
/// Each declaration is attempted once. A broker rejection comes back as the matching
/// [`Error`] variant, with the broker's error untouched as its `source`.
pub struct Topology<Ch> {
    channels: ChannelHandle<Ch>,
}

impl<Ch: BrokerChannel> Topology<Ch> {
    pub fn new(channels: ChannelHandle<Ch>) -> Self {
        Self { channels }
    }

    /// Create an exchange if it does not exist yet.
    ///
    /// `kind` is one of `direct`, `fanout`, `topic`, `headers` or a plugin-provided type.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "the default exchange cannot be declared".into(),
            ));
        }
        check_short_string("exchange name", name)?;
        let kind: ExchangeKind = kind.parse()?;

        self.channels
            .current()
            .channel
            .declare_exchange(name, &kind, durable)
            .await
            .map_err(|source| Error::DeclareExchange {
                name: name.to_owned(),
                source,
            })?;
        tracing::debug!(exchange = name, %kind, durable, "exchange declared");
        Ok(())
    }

    /// Create a queue if it does not exist yet.
    ///
    /// Priority and TTL arguments are only sent when `priority_ceiling > 0` or `ttl > 0`.
    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        priority_ceiling: u8,
        ttl: Duration,
    ) -> Result<(), Error> {
        let declaration = QueueDeclaration {
            name: name.to_owned(),
            durable,
            arguments: QueueArguments {
                max_priority: Some(priority_ceiling),
                message_ttl: Some(ttl),
            },
        };
        self.declare_queue_with(&declaration).await
    }

    pub async fn declare_queue_with(&self, declaration: &QueueDeclaration) -> Result<(), Error> {
        check_short_string("queue name", &declaration.name)?;

        self.channels
            .current()
            .channel
            .declare_queue(declaration)
            .await
            .map_err(|source| Error::DeclareQueue {
                name: declaration.name.clone(),
                source,
            })?;
        tracing::debug!(queue = %declaration.name, "queue declared");
        Ok(())
    }

    /// Bind `queue` to `exchange`, using the queue name as routing key.
    pub async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), Error> {
        check_short_string("queue name", queue)?;
        check_short_string("exchange name", exchange)?;

        self.channels
            .current()
            .channel
            .bind_queue(queue, exchange, queue)
            .await
            .map_err(|source| Error::BindQueue {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                source,
            })?;
        tracing::debug!(queue, exchange, "queue bound");
        Ok(())
    }
}

/// Names and routing keys travel as AMQP short strings.
pub(crate) fn check_short_string(what: &str, value: &str) -> Result<(), Error> {
    if value.len() > u8::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "the {what} is {} bytes long, the maximum is 255",
            value.len()
        )));
    }
    Ok(())
}
