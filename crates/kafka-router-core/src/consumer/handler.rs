//! Callback contract between the consumer engine and business logic.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CallbackError;
use crate::trace::TraceContext;

/// Business logic invoked once per consumed message.
///
/// Delivery is at-least-once: a message can be handed to the handler again
/// after a rebalance, a retry or a recovered panic, so implementations must
/// be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message payload.
    ///
    /// # Errors
    ///
    /// An error is logged by the engine and handled per the group's
    /// [`ErrorPolicy`](super::ErrorPolicy); it never stops the worker.
    async fn handle(&self, ctx: TraceContext, payload: Bytes) -> Result<(), CallbackError>;
}

/// [`MessageHandler`] backed by an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TraceContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(TraceContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn handle(&self, ctx: TraceContext, payload: Bytes) -> Result<(), CallbackError> {
        (self.f)(ctx, payload).await
    }
}
