//! LZ4 frame compression decorators, suited to high-throughput streams.
//!
//! The topic side compresses the payload on close and marks the message
//! with `Content-Encoding: lz4`. The receiver side installs a streaming
//! frame decoder over the body when that attribute matches, keeping memory
//! constant for large payloads; messages with any other encoding value pass
//! through with their raw bytes. When a queue cannot carry binary data,
//! pair with the base64 decorators: `base64::decoder` outside this decoder
//! on the receive side, `base64::encoder` inside the compressor on the
//! topic side.

use std::io::Write as _;

use async_trait::async_trait;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{MessageWriter, ReceiveError, Receiver, Topic, WriteError},
    message::{Attributes, Message},
};

const CONTENT_ENCODING: &str = "Content-Encoding";
const ENCODING: &str = "lz4";

/// Wraps `next` with lz4 decompression, applied only when
/// `Content-Encoding` is set to `lz4`.
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

        if msg.attributes.get(CONTENT_ENCODING) == ENCODING {
            let body = std::mem::replace(&mut msg.body, Message::empty_body());
            msg.body = Box::new(FrameDecoder::new(body));
        }

        self.next.receive(ctx, msg).await
    }
}

/// Wraps `next` with a topic that lz4-compresses every message.
pub fn compressor<T>(next: T) -> Compressor<T>
where
    T: Topic,
{
    Compressor { next }
}

pub struct Compressor<T> {
    next: T,
}

#[async_trait]
impl<T> Topic for Compressor<T>
where
    T: Topic,
{
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter> {
        Box::new(CompressWriter {
            next: self.next.new_writer(ctx).await,
            buf: Vec::new(),
            closed: false,
        })
    }
}

struct CompressWriter {
    next: Box<dyn MessageWriter>,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl MessageWriter for CompressWriter {
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

        self.next.attributes().set(CONTENT_ENCODING, ENCODING);

        let mut encoder = FrameEncoder::new(Vec::new());
        encoder.write_all(&self.buf)?;
        let compressed = encoder
            .finish()
            .map_err(|e| WriteError::Io(std::io::Error::other(e)))?;

        self.next.write(&compressed).await?;
        self.next.close().await
    }

    fn attributes(&mut self) -> &mut Attributes {
        self.next.attributes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::mem, message::dump_body, receiver_fn};

    fn compress(payload: &[u8]) -> Vec<u8> {
        let mut encoder = FrameEncoder::new(Vec::new());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_compressor_sets_attribute() {
        let (topic, queue) = mem::channel(1);

        let compressed_topic = compressor(topic);
        let mut w = compressed_topic.new_writer(CancellationToken::new()).await;
        w.write(b"hello, world!").await.unwrap();
        w.close().await.unwrap();

        let mut m = queue.recv().await.unwrap();
        assert_eq!(m.attributes.get("Content-Encoding"), "lz4");
        assert_eq!(dump_body(&mut m).unwrap(), compress(b"hello, world!"));
    }

    #[tokio::test]
    async fn test_decoder_roundtrip() {
        let payload = b"hello, world! ".repeat(100);
        let mut wire = Message::from_bytes(compress(&payload));
        wire.attributes.set("Content-Encoding", "lz4");

        let want = payload.clone();
        let next = receiver_fn(move |_ctx, mut msg: Message| {
            let want = want.clone();
            async move {
                assert_eq!(dump_body(&mut msg)?, want);
                Ok(())
            }
        });
        decoder(next)
            .receive(CancellationToken::new(), wire)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_encoding_passes_raw_bytes() {
        let compressed = compress(b"hello, world!");
        let mut wire = Message::from_bytes(compressed.clone());
        wire.attributes.set("Content-Encoding", "gzip");

        let next = receiver_fn(move |_ctx, mut msg: Message| {
            let compressed = compressed.clone();
            async move {
                // The decoder must not touch the body: the receiver sees the
                // compressed bytes, not the original text.
                let body = dump_body(&mut msg)?;
                assert_eq!(body, compressed);
                assert_ne!(body, b"hello, world!");
                Ok(())
            }
        });
        decoder(next)
            .receive(CancellationToken::new(), wire)
            .await
            .unwrap();
    }
}
