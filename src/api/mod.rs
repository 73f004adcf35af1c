//! The contracts connecting backends, decorators, and user code.
//!
//! A [`Server`](server::Server) sources messages from a backend and drives a
//! [`Receiver`](receiver::Receiver); a [`Topic`](topic::Topic) hands out
//! single-use [`MessageWriter`](topic::MessageWriter)s that publish back to a
//! backend. Decorators wrap either side without changing the contract.

pub(crate) mod receiver;
pub(crate) mod server;
pub(crate) mod topic;

pub use receiver::{ReceiveError, Receiver, ReceiverFn, receiver_fn};
pub use server::{ServeError, Server};
pub use topic::{DelayedWriter, MessageWriter, Topic, WriteError};
