//! Composable middleware for both directions of the message pipe.
//!
//! A receiver decorator wraps a [`Receiver`](crate::Receiver) in another
//! receiver; a topic decorator wraps a [`Topic`](crate::Topic) in another
//! topic. Stacking order matters. On publish, the outermost writer's
//! `close` runs first, so its transform is the innermost on the wire; on
//! receive, the outermost decorator strips the wire's outermost transform.
//! The stacks therefore mirror each other:
//! `lz4::compressor(base64::encoder(topic))` puts `base64(lz4(payload))` on
//! the wire, and `base64::decoder(lz4::decoder(receiver))` unwraps it.
//!
//! Receiver decorators observe the intake context before doing work and
//! abort with [`ReceiveError::Cancelled`](crate::ReceiveError::Cancelled)
//! when it has already fired. Topic decorators buffer writes and apply
//! their transform on `close`, setting the describing attribute before the
//! inner writer's `close` runs.

pub mod base64;
pub mod crypto;
pub mod lz4;
pub mod trace;
