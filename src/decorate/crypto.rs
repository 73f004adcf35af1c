//! Envelope encryption decorators over a pluggable cipher backend.
//!
//! The topic side encrypts the buffered payload through a [`Cipher`]
//! (typically a transit-encryption service client) and publishes a JSON
//! envelope naming the key; the receiver side opens the envelope, decrypts,
//! and hands the plaintext body downstream. A failure to read the incoming
//! body is reported as an error, never swallowed.

use std::{io::Cursor, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{MessageWriter, ReceiveError, Receiver, Topic, WriteError},
    message::{Attributes, Message, dump_body},
};

/// Encrypts and decrypts opaque payloads under a named key.
///
/// The ciphertext is an opaque token: whatever string the backing service
/// returns (Vault Transit produces `vault:v1:...`-style tokens).
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> anyhow::Result<String>;
    async fn decrypt(&self, key_id: &str, ciphertext: &str) -> anyhow::Result<Vec<u8>>;
}

/// Wire form of an encrypted message body.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key_id: String,
    ciphertext: String,
}

/// Wraps `next` with a receiver that opens the envelope and decrypts the
/// payload before delivery.
pub fn decrypter<R>(next: R, cipher: Arc<dyn Cipher>) -> Decrypter<R>
where
    R: Receiver,
{
    Decrypter { next, cipher }
}

pub struct Decrypter<R> {
    next: R,
    cipher: Arc<dyn Cipher>,
}

#[async_trait]
impl<R> Receiver for Decrypter<R>
where
    R: Receiver,
{
    async fn receive(&self, ctx: CancellationToken, mut msg: Message) -> Result<(), ReceiveError> {
        if ctx.is_cancelled() {
            return Err(ReceiveError::Cancelled);
        }

        let raw = dump_body(&mut msg)?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| ReceiveError::Handler(anyhow::anyhow!("invalid envelope: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(&envelope.key_id, &envelope.ciphertext)
            .await?;
        msg.body = Box::new(Cursor::new(plaintext));

        self.next.receive(ctx, msg).await
    }
}

/// Wraps `next` with a topic that encrypts every payload under `key_id`.
pub fn encrypter<T>(next: T, cipher: Arc<dyn Cipher>, key_id: impl Into<String>) -> Encrypter<T>
where
    T: Topic,
{
    Encrypter {
        next,
        cipher,
        key_id: key_id.into(),
    }
}

pub struct Encrypter<T> {
    next: T,
    cipher: Arc<dyn Cipher>,
    key_id: String,
}

#[async_trait]
impl<T> Topic for Encrypter<T>
where
    T: Topic,
{
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter> {
        Box::new(EncryptWriter {
            next: self.next.new_writer(ctx).await,
            cipher: self.cipher.clone(),
            key_id: self.key_id.clone(),
            buf: Vec::new(),
            closed: false,
        })
    }
}

struct EncryptWriter {
    next: Box<dyn MessageWriter>,
    cipher: Arc<dyn Cipher>,
    key_id: String,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl MessageWriter for EncryptWriter {
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

        let ciphertext = self.cipher.encrypt(&self.key_id, &self.buf).await?;
        let envelope = Envelope {
            key_id: self.key_id.clone(),
            ciphertext,
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| WriteError::Other(anyhow::anyhow!("envelope serialization: {e}")))?;

        self.next.write(&body).await?;
        self.next.close().await
    }

    fn attributes(&mut self) -> &mut Attributes {
        self.next.attributes()
    }
}
