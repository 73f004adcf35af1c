//! In-memory channel backend.
//!
//! [`channel`] creates a bounded message queue; the [`Topic`] half publishes
//! into it and the [`Server`] half consumes from it with a bounded worker
//! pool. This backend implements the illustrative retry policy: a failed
//! delivery is re-appended to the queue, and a throttled delivery pauses
//! the worker for the requested duration and counts as success.

use std::{io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{WorkerPool, drain};
use crate::{
    api::{DelayedWriter, MessageWriter, ReceiveError, Receiver, ServeError, WriteError},
    message::{Attributes, Message, dump_body},
};

/// How often [`Server::shutdown`] polls for worker-pool quiescence.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Creates a bounded in-memory message channel.
///
/// The [`Topic`] half is cheaply cloneable and publishes into the channel;
/// the [`Queue`] half is handed to a [`Server`] for consumption.
pub fn channel(capacity: usize) -> (Topic, Queue) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Topic { tx: tx.clone() },
        Queue {
            tx,
            rx: Mutex::new(rx),
        },
    )
}

/// Publishing half of an in-memory channel.
#[derive(Clone)]
pub struct Topic {
    tx: mpsc::Sender<Message>,
}

impl Topic {
    /// Enqueues an already-built message, bypassing the writer interface.
    pub async fn send(&self, msg: Message) -> Result<(), WriteError> {
        self.tx.send(msg).await.map_err(|_| WriteError::TopicClosed)
    }
}

#[async_trait]
impl crate::api::Topic for Topic {
    async fn new_writer(&self, _ctx: CancellationToken) -> Box<dyn MessageWriter> {
        Box::new(Writer {
            tx: self.tx.clone(),
            attributes: Attributes::new(),
            buf: Vec::new(),
            closed: false,
        })
    }
}

/// Consuming half of an in-memory channel.
pub struct Queue {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl Queue {
    /// Pops the next message, bypassing the server interface. Used by tests
    /// and tools that want to inspect the wire form directly.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }
}

/// Publishes a single message to the channel.
///
/// Once all data has been written and the writer closed, it may not be used
/// again. Closing with an empty buffer suppresses publication.
struct Writer {
    tx: mpsc::Sender<Message>,
    attributes: Attributes,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl MessageWriter for Writer {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.closed = true;

        if self.buf.is_empty() {
            return Ok(());
        }

        let msg = Message::new(
            std::mem::take(&mut self.attributes),
            Box::new(Cursor::new(std::mem::take(&mut self.buf))),
        );
        self.tx.send(msg).await.map_err(|_| WriteError::TopicClosed)
    }

    fn attributes(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    fn as_delayed(&mut self) -> Option<&mut dyn DelayedWriter> {
        Some(self)
    }
}

impl DelayedWriter for Writer {
    // The channel delivers immediately; the delay capability is accepted
    // and ignored.
    fn set_delay(&mut self, _delay: Duration) {}
}

/// Consumes a [`Queue`] and dispatches each message to a receiver on a
/// bounded worker pool.
pub struct Server {
    queue: Queue,
    pool: WorkerPool,
    intake: CancellationToken,
    receivers: CancellationToken,
}

impl Server {
    /// Creates a server draining `queue` with at most `concurrency`
    /// concurrent receiver invocations.
    pub fn new(queue: Queue, concurrency: usize) -> Self {
        Self {
            queue,
            pool: WorkerPool::new(concurrency),
            intake: CancellationToken::new(),
            receivers: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl crate::api::Server for Server {
    async fn serve(&self, receiver: Arc<dyn Receiver>) -> Result<(), ServeError> {
        let mut rx = self.queue.rx.lock().await;

        loop {
            let msg = tokio::select! {
                // Intake cancellation stops new dispatch; in-flight workers
                // keep running on the receiver token.
                _ = self.intake.cancelled() => {
                    debug!("intake cancelled, server exiting");
                    return Err(ServeError::Closed);
                }
                msg = rx.recv() => msg,
            };
            let Some(mut msg) = msg else {
                // The queue holds its own sender, so the channel can only
                // close once the server itself is dropped.
                continue;
            };

            let Some(permit) = self.pool.acquire().await else {
                return Err(ServeError::Closed);
            };

            let receiver = receiver.clone();
            let ctx = self.receivers.clone();
            let retry = self.queue.tx.clone();
            tokio::spawn(async move {
                let _permit = permit;

                // Snapshot for the retry path: the receiver consumes the
                // message, so a failed delivery is re-enqueued from here.
                let attributes = msg.attributes.clone();
                let body = match dump_body(&mut msg) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "dropping message with unreadable body");
                        return;
                    }
                };

                match receiver.receive(ctx, msg).await {
                    Ok(()) => {}
                    Err(ReceiveError::Throttled(pause)) => {
                        debug!(?pause, "receiver throttled");
                        tokio::time::sleep(pause).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "receiver error, retrying");
                        let msg = Message::new(attributes, Box::new(Cursor::new(body)));
                        let _ = retry.send(msg).await;
                    }
                }
            });
        }
    }

    async fn shutdown(&self, deadline: CancellationToken) -> Result<(), ServeError> {
        self.intake.cancel();
        Err(drain(&self.pool, SHUTDOWN_POLL_INTERVAL, &deadline, &self.receivers).await)
    }
}
