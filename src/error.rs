/// Errors surfaced by [`RabbitClient`](crate::RabbitClient).
///
/// Transient infrastructure failures (a dropped connection, a failed publish, a failed
/// subscription) never show up here: they are logged and retried by the client itself.
/// What is left are failures the caller can act upon.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to establish the initial connection to the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
    #[error("Failed to open the initial channel on the RabbitMq connection")]
    OpenChannel(#[source] anyhow::Error),
    #[error("The RabbitMq settings are not valid: {0}")]
    InvalidSettings(String),
    #[error("Failed to build the TLS configuration for the RabbitMq connection")]
    Tls(#[source] anyhow::Error),
    #[error("Failed to declare exchange `{name}`")]
    DeclareExchange {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to declare queue `{name}`")]
    DeclareQueue {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to bind queue `{queue}` to exchange `{exchange}`")]
    BindQueue {
        queue: String,
        exchange: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("The client has been shut down")]
    Closed,
}
