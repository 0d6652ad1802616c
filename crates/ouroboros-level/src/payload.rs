//! Values handed back to the caller

use bytes::Bytes;
use std::fmt;

/// A key or value in the representation the caller asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes
    Buffer(Bytes),
    /// Lossy UTF-8 decoding of the bytes
    Text(String),
}

impl Payload {
    pub fn from_bytes(bytes: Bytes, as_buffer: bool) -> Self {
        if as_buffer {
            Payload::Buffer(bytes)
        } else {
            Payload::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Buffer(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Buffer(bytes) => bytes,
            Payload::Text(text) => Bytes::from(text),
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Payload::Buffer(_))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Buffer(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Payload::Text(text) => f.write_str(text),
        }
    }
}
