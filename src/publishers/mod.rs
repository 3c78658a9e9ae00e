//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod message;
mod publisher;

pub use message::{DeliveryMode, Message, MIME_APPLICATION_JSON, MIME_TEXT_PLAIN};
pub use publisher::Publisher;
