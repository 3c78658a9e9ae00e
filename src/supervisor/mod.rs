//! Supervisors keep a connection and a channel to the broker alive.
//!
//! - [`ConnectionSupervisor`] owns the transport connection and re-dials forever when it drops.
//! - [`ChannelSupervisor`] owns the channel and re-opens it, but only once the connection
//!   it depends on is open again.
//!
//! Both publish their current handle through a `watch` slot: readers always observe either the
//! old or the new handle, never a half-built one.
mod channel;
mod connection;

pub use channel::{ChannelHandle, ChannelSupervisor, LiveChannel};
pub use connection::{ConnectionHandle, ConnectionSupervisor};
