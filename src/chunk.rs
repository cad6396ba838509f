use std::fmt;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Result, StreamError};

/// Process-unique (per [Context](crate::context::Context)) stream sequence id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    /// Raw sequence number
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of data moving through a chain
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Contiguous bytes (byte mode)
    Data(Bytes),
    /// A discrete structured value (object mode)
    Object(Value),
}

impl Chunk {
    /// Size used for high-water mark accounting
    pub fn size(&self, object_mode: bool) -> usize {
        match self {
            _ if object_mode => 1,
            Chunk::Data(bytes) => bytes.len(),
            Chunk::Object(_) => 1,
        }
    }

    /// Byte view, if this is data
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Data(bytes) => Some(bytes),
            Chunk::Object(_) => None,
        }
    }

    /// Object view, if this is an object
    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Chunk::Object(value) => Some(value),
            Chunk::Data(_) => None,
        }
    }

    /// Convert into a JSON value; data becomes a (lossy) UTF-8 string
    pub fn into_value(self) -> Value {
        match self {
            Chunk::Object(value) => value,
            Chunk::Data(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Text form: strings verbatim, data as UTF-8, other values as JSON
    pub fn to_text(&self) -> String {
        match self {
            Chunk::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Chunk::Object(Value::String(s)) => s.clone(),
            Chunk::Object(value) => value.to_string(),
        }
    }

    /// Normalize a chunk for a byte-mode side
    pub(crate) fn into_data(self) -> Result<Chunk> {
        match self {
            Chunk::Data(_) => Ok(self),
            Chunk::Object(Value::String(s)) => Ok(Chunk::Data(Bytes::from(s))),
            Chunk::Object(other) => Err(StreamError::InvalidChunk(format!(
                "expected bytes or string, got {}",
                other
            ))),
        }
    }

    /// Split a data chunk at `at`, returning the head
    pub(crate) fn split_data(&mut self, at: usize) -> Option<Chunk> {
        match self {
            Chunk::Data(bytes) if at < bytes.len() => Some(Chunk::Data(bytes.split_to(at))),
            _ => None,
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Data(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Data(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(bytes: &'static [u8]) -> Self {
        Chunk::Data(Bytes::from_static(bytes))
    }
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Chunk::Object(value)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Object(Value::String(s.to_owned()))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Object(Value::String(s))
    }
}

impl From<i64> for Chunk {
    fn from(n: i64) -> Self {
        Chunk::Object(Value::from(n))
    }
}

/// Result of pulling from a readable side
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// A buffered chunk
    Data(Chunk),
    /// Nothing buffered yet; a `readable` event follows when there is
    Pending,
    /// End-of-stream
    End,
}
