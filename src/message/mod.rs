//! The message data model: attribute metadata plus a read-once byte-stream
//! body.

use std::{
    fmt,
    io::{self, Cursor, Read},
};

mod attributes;

pub use attributes::Attributes;

/// A message body: an opaque byte stream read exactly once by downstream
/// code.
///
/// The body is not restartable. [`dump_body`] and [`clone_body`] buffer it
/// fully and replace it with a rewindable cursor when repeated reads are
/// needed.
pub type Body = Box<dyn Read + Send>;

/// A discrete unit of work in a messaging system.
///
/// Ownership of the body moves with the message: whichever decorator or
/// receiver currently holds the message holds exclusive access to the byte
/// stream. Once a receiver returns, the body must not be read again.
pub struct Message {
    pub attributes: Attributes,
    pub body: Body,
}

impl Message {
    pub fn new(attributes: Attributes, body: Body) -> Self {
        Self { attributes, body }
    }

    /// Creates a message with empty attributes and an in-memory body.
    pub fn from_bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            attributes: Attributes::new(),
            body: Box::new(Cursor::new(body.into())),
        }
    }

    /// Creates a new message carrying a deep copy of `parent`'s attributes
    /// and the given body.
    ///
    /// Attribute mutations on parent and child are independent afterwards.
    pub fn with_body(parent: &Message, body: Body) -> Self {
        Self {
            attributes: parent.attributes.clone(),
            body,
        }
    }

    /// A body with no bytes, used as a placeholder when the real body is
    /// moved out for wrapping.
    pub fn empty_body() -> Body {
        Box::new(io::empty())
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            attributes: Attributes::new(),
            body: Self::empty_body(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("attributes", &self.attributes)
            .field("body", &"<stream>")
            .finish()
    }
}

/// Drains the message body into a buffer and returns its contents.
///
/// The body is replaced with a cursor over the buffered bytes, so it can be
/// read again afterwards. Calling `dump_body` repeatedly returns identical
/// bytes.
pub fn dump_body(m: &mut Message) -> io::Result<Vec<u8>> {
    let mut body = std::mem::replace(&mut m.body, Message::empty_body());
    let mut buf = Vec::new();
    body.read_to_end(&mut buf)?;
    m.body = Box::new(Cursor::new(buf.clone()));
    Ok(buf)
}

/// Returns a fresh reader over the message body's contents.
///
/// The message body itself is reset as in [`dump_body`], so both the
/// returned reader and the message remain readable.
pub fn clone_body(m: &mut Message) -> io::Result<Body> {
    let buf = dump_body(m)?;
    Ok(Box::new(Cursor::new(buf)))
}
