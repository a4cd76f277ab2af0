//! Delivery target contract for bus subscriptions.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::protocol::Message;

/// Receives messages drained from one subscription queue.
///
/// Returning an error (or panicking) counts as a handler failure: the bus
/// logs it, dead-letters the message and keeps draining.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, message: Message) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn deliver(&self, message: Message) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shareable subscriber.
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber { f })
}
