//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a starting point.
mod consumer;
mod handler;

pub use consumer::Consumer;
pub use handler::{AsyncClosure, ClosureHandler, Handler};
