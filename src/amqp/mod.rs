//! Helpers for connecting to a rabbitmq broker

mod broker;
pub mod configuration;
mod factory;

pub use broker::{AmqpChannel, AmqpConnection};
pub use factory::ConnectionFactory;
