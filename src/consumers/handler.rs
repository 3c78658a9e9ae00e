//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use std::future::Future;
use std::sync::Arc;

/// Implementers of the `Handler` trait process the payload of the messages pulled from a queue
/// by [`Consumer`](super::Consumer).
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The consumer takes care of acking/nacking the message with the broker according to the
/// outcome of processing:
///
/// - `Ok(())` acks the message;
/// - `Err(_)` nacks the message and asks the broker to requeue it.
///
/// Errors are not logged by the consumer: logging them is up to the handler.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on [`ClosureHandler`], which turns any async function of the form
/// `Fn(Vec<u8>) -> impl Future<Output = Result<(), E>>` into a handler.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Result<(), anyhow::Error>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), anyhow::Error> {
        H::handle(self, payload).await
    }
}

#[async_trait::async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), anyhow::Error> {
        H::handle(self, payload).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(payload: Vec<u8>) -> Result<(), impl Into<anyhow::Error>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`].
pub trait AsyncClosure: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'static;
    type Err: Into<anyhow::Error> + 'static;
    fn call(&self, payload: Vec<u8>) -> Self::Output;
}

/// Implement `AsyncClosure` for all functions that match the required signature.
impl<F, Fut, Err> AsyncClosure for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Err>> + Send + 'static,
    Err: Into<anyhow::Error> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&self, payload: Vec<u8>) -> Self::Output {
        (self)(payload)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> Handler for ClosureHandler<F>
where
    F: AsyncClosure,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), anyhow::Error> {
        self.0.call(payload.to_vec()).await.map_err(Into::into)
    }
}
