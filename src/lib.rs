//! Fairway: a message-processing framework with a weighted-fair
//! multi-source scheduler at its core.
//!
//! Fairway gives services a uniform abstraction over heterogeneous pub/sub
//! and queue systems - in-memory channels, file directories, or anything
//! implementing the backend contracts - for consuming and producing opaque
//! byte-payload messages with attached metadata. Work is dispatched on
//! bounded worker pools with two-phase graceful shutdown, deliveries are
//! at-least-once, and both directions of the pipe compose through
//! decorators (encoding, compression, tracing, encryption).
//!
//! # Overview
//!
//! ```text
//!  [Backend] ──► Server ──► decorator chain ──► Receiver (user code)
//!
//!  (user code) Publisher ──► decorator chain ──► Topic ──► [Backend]
//!
//!  Multi-source:
//!  Server_1 ─┐
//!  Server_2 ─┼──► WeightedFairScheduler ──► Receiver (user code)
//!  Server_N ─┘         weights w[i]
//! ```
//!
//! A [`Server`] sources messages from a backend and invokes a [`Receiver`]
//! for each one, never exceeding its configured concurrency. Shutdown is
//! two-phase: intake stops immediately, in-flight work drains, and only
//! when a caller-supplied grace deadline expires are the remaining
//! receivers hard-cancelled.
//!
//! A [`Topic`] hands out single-use [`MessageWriter`]s: bytes stream in,
//! `close` publishes exactly one message, and a closed writer refuses all
//! further use. Single-use writers compose safely with streaming
//! transforms that must flush trailer bytes on close.
//!
//! The [`sched`] module multiplexes several independent sources into one
//! receiver with Weighted Fair Queuing: each class receives a share of
//! throughput proportional to its weight, adaptively to per-message
//! service cost. [`sched::MultiServer`] packages N servers plus the
//! scheduler behind the plain [`Server`] contract.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use fairway::{MessageWriter as _, Server as _, Topic as _, backend::mem, receiver_fn};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (topic, queue) = mem::channel(64);
//!     let server = Arc::new(mem::Server::new(queue, 8));
//!
//!     // Publish a message
//!     let mut w = topic.new_writer(CancellationToken::new()).await;
//!     w.write(b"hello world").await?;
//!     w.close().await?;
//!
//!     // Consume until shutdown
//!     let receiver = Arc::new(receiver_fn(|_ctx, mut msg| async move {
//!         let body = fairway::dump_body(&mut msg)?;
//!         println!("{}", String::from_utf8_lossy(&body));
//!         Ok(())
//!     }));
//!     let worker = {
//!         let server = server.clone();
//!         tokio::spawn(async move { server.serve(receiver).await })
//!     };
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     server.shutdown(CancellationToken::new()).await.ok();
//!     worker.await?.ok();
//!     Ok(())
//! }
//! ```
//!
//! # Delivery semantics
//!
//! Returning `Ok(())` from a receiver acks the message. Returning
//! [`ReceiveError::Throttled`] pauses the worker for the carried duration
//! and counts as an ack - the only in-band backpressure. Any other error
//! nacks, and the backend decides how to redeliver (the channel backend
//! re-enqueues; others lean on their pending-delivery machinery). Delivery
//! is at-least-once; exactly-once and cross-source ordering are
//! deliberately out of scope.

pub mod backend;
pub mod decorate;
pub mod message;
pub mod sched;

mod api;

pub use api::{
    DelayedWriter, MessageWriter, ReceiveError, Receiver, ReceiverFn, ServeError, Server, Topic,
    WriteError, receiver_fn,
};
pub use message::{Attributes, Body, Message, clone_body, dump_body};
pub use sched::{ConfigError, MultiServer, ServerWeight, WeightedFairScheduler};
