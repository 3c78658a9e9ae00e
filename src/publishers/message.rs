pub const MIME_TEXT_PLAIN: &str = "text/plain";
pub const MIME_APPLICATION_JSON: &str = "application/json";

/// Persistence hint for a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory by the broker.
    #[default]
    Transient,
    /// Written to disk when routed to a durable queue.
    Persistent,
}

impl DeliveryMode {
    /// The AMQP encoding of the delivery mode: non-persistent (1) or persistent (2).
    pub fn as_amqp(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// A message to be published via [`Publisher`](super::Publisher).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    // The body of the message - as a sequence of bytes.
    pub body: Vec<u8>,
    // Defaults to `text/plain` when left empty.
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    // Generated by the publisher when missing.
    pub message_id: Option<String>,
    // Seconds since the UNIX epoch, set by the publisher when missing.
    pub timestamp: Option<u64>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = value.into();
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, value: DeliveryMode) -> Self {
        self.delivery_mode = value;
        self
    }

    #[must_use]
    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    #[must_use]
    pub fn with_priority(mut self, value: u8) -> Self {
        self.priority = value;
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, value: u64) -> Self {
        self.timestamp = Some(value);
        self
    }

    /// The content type that goes on the wire.
    pub fn content_type(&self) -> &str {
        if self.content_type.is_empty() {
            MIME_TEXT_PLAIN
        } else {
            &self.content_type
        }
    }
}
