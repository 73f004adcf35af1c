use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Errors surfaced by a [`Receiver`] invocation.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The cancellation token passed to the receiver was already cancelled,
    /// or fired while the caller was waiting for completion.
    ///
    /// Decorators check the token before doing work and short-circuit with
    /// this error; servers treat it like any other failure.
    #[error("receive cancelled")]
    Cancelled,

    /// Cooperative backpressure: the receiver asks the server to pause for
    /// the given duration.
    ///
    /// The delivery is treated as successful - the message is not retried.
    /// This is the only form of in-band backpressure a receiver can exert.
    #[error("receiver throttled for {0:?}")]
    Throttled(Duration),

    /// The message was submitted to a weighted-fair scheduler that has been
    /// closed, or the scheduler shut down while the message was still
    /// queued.
    #[error("scheduler closed")]
    SchedulerClosed,

    /// Reading the message body failed.
    #[error("message body: {0}")]
    Body(#[from] std::io::Error),

    /// The user handler failed. The server nacks the delivery and the
    /// backend decides whether to redeliver.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Processes one message.
///
/// Returning signals that the message has been handled; the body must not
/// be read after the call returns. `Ok(())` acks the delivery. A
/// [`ReceiveError::Throttled`] return asks the server to pause and counts
/// as an ack. Any other error nacks the delivery and, depending on the
/// backend, puts the message back on the queue.
///
/// The `ctx` token is the receiver-side cancellation signal: it fires only
/// when a graceful shutdown's grace deadline expires. Long-running
/// receivers should observe it.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(&self, ctx: CancellationToken, msg: Message) -> Result<(), ReceiveError>;
}

#[async_trait]
impl<R> Receiver for Arc<R>
where
    R: Receiver + ?Sized,
{
    async fn receive(&self, ctx: CancellationToken, msg: Message) -> Result<(), ReceiveError> {
        self.as_ref().receive(ctx, msg).await
    }
}

/// Adapter allowing an ordinary async closure to be used as a [`Receiver`].
pub struct ReceiverFn<F>(F);

/// Wraps `f` so it satisfies the [`Receiver`] contract.
///
/// ```
/// use fairway::{Message, receiver_fn};
///
/// let r = receiver_fn(|_ctx, mut msg: Message| async move {
///     let body = fairway::dump_body(&mut msg)?;
///     println!("{} bytes", body.len());
///     Ok(())
/// });
/// # let _ = r;
/// ```
pub fn receiver_fn<F, Fut>(f: F) -> ReceiverFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReceiveError>> + Send,
{
    ReceiverFn(f)
}

#[async_trait]
impl<F, Fut> Receiver for ReceiverFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReceiveError>> + Send,
{
    async fn receive(&self, ctx: CancellationToken, msg: Message) -> Result<(), ReceiveError> {
        (self.0)(ctx, msg).await
    }
}
