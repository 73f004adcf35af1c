use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Attributes;

/// Errors returned by [`MessageWriter`] operations.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The writer has already been closed.
    ///
    /// A writer publishes exactly one message; every `write` or `close`
    /// after the first successful `close` fails with this error.
    #[error("message writer closed")]
    Closed,

    /// The topic's backend is gone and can no longer accept messages.
    #[error("topic closed")]
    TopicClosed,

    /// An I/O failure while buffering or publishing.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A decorator-level transform failed (encryption, serialization).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Optional capability of a [`MessageWriter`]: scheduling a delivery delay.
///
/// Backends that support deferred delivery expose it through
/// [`MessageWriter::as_delayed`]; callers probe for the capability instead
/// of assuming it.
pub trait DelayedWriter {
    fn set_delay(&mut self, delay: Duration);
}

/// A single-use handle that streams bytes into one message.
///
/// Sequential `write` calls append to an internal buffer; `close` publishes
/// exactly one message containing the accumulated bytes and attributes.
/// Exclusive `&mut` access makes interleaved use from several tasks
/// impossible by construction; the closed flag guards the sequential
/// double-close case.
#[async_trait]
pub trait MessageWriter: Send {
    /// Appends `buf` to the pending message body.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError>;

    /// Publishes the accumulated message.
    ///
    /// Attributes that describe a transform applied to the payload must be
    /// set before `close` forwards to the next writer or persists to the
    /// backend. After a successful close the writer is spent.
    async fn close(&mut self) -> Result<(), WriteError>;

    /// The attributes the published message will carry. Shared down a
    /// decorator chain: every layer mutates the same mapping.
    fn attributes(&mut self) -> &mut Attributes;

    /// Probes for delivery-delay support.
    fn as_delayed(&mut self) -> Option<&mut dyn DelayedWriter> {
        None
    }
}

/// A destination for messages in a messaging system.
#[async_trait]
pub trait Topic: Send + Sync {
    /// Returns a fresh single-use writer.
    ///
    /// `ctx` is the publication context: decorators may derive spans from
    /// it and backends may use it to abort an in-flight publish.
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter>;
}

#[async_trait]
impl<T> Topic for Arc<T>
where
    T: Topic + ?Sized,
{
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter> {
        self.as_ref().new_writer(ctx).await
    }
}
