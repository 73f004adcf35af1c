//! Base64 codec decorators, for backends that cannot carry binary payloads.
//!
//! The topic side encodes the whole payload on close and marks the message
//! with `Content-Transfer-Encoding: base64`; the receiver side installs a
//! streaming decoder over the body when that attribute is present, so
//! decoding happens during the downstream read.

use async_trait::async_trait;
use base64::{
    Engine as _,
    engine::{GeneralPurpose, general_purpose},
    read::DecoderReader,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{MessageWriter, ReceiveError, Receiver, Topic, WriteError},
    message::{Attributes, Message},
};

const TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
const ENCODING: &str = "base64";

static ENGINE: GeneralPurpose = general_purpose::STANDARD;

/// Wraps `next` with base64 decoding.
///
/// The body is only decoded when `Content-Transfer-Encoding` is set to
/// `base64`; other messages pass through untouched.
pub fn decoder<R>(next: R) -> Decoder<R>
where
    R: Receiver,
{
    Decoder { next }
}

pub struct Decoder<R> {
    next: R,
}

#[async_trait]
impl<R> Receiver for Decoder<R>
where
    R: Receiver,
{
    async fn receive(&self, ctx: CancellationToken, mut msg: Message) -> Result<(), ReceiveError> {
        if ctx.is_cancelled() {
            return Err(ReceiveError::Cancelled);
        }

        if msg.attributes.get(TRANSFER_ENCODING) == ENCODING {
            let body = std::mem::replace(&mut msg.body, Message::empty_body());
            msg.body = Box::new(DecoderReader::new(body, &ENGINE));
        }

        self.next.receive(ctx, msg).await
    }
}

/// Wraps `next` with a topic that base64-encodes every message.
pub fn encoder<T>(next: T) -> Encoder<T>
where
    T: Topic,
{
    Encoder { next }
}

pub struct Encoder<T> {
    next: T,
}

#[async_trait]
impl<T> Topic for Encoder<T>
where
    T: Topic,
{
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter> {
        Box::new(EncodeWriter {
            next: self.next.new_writer(ctx).await,
            buf: Vec::new(),
            closed: false,
        })
    }
}

struct EncodeWriter {
    next: Box<dyn MessageWriter>,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl MessageWriter for EncodeWriter {
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

        self.next.attributes().set(TRANSFER_ENCODING, ENCODING);
        let encoded = ENGINE.encode(&self.buf);
        self.next.write(encoded.as_bytes()).await?;
        self.next.close().await
    }

    fn attributes(&mut self) -> &mut Attributes {
        self.next.attributes()
    }
}
