use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde_json::Value;

use crate::chunk::Chunk;
use crate::error::{Result, StreamError};
use crate::stage::{Done, Output, Transform};

pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// The three ways a through function can deliver its result
pub enum ThroughFn {
    /// Returns the mapped chunk directly
    Sync(Box<dyn FnMut(Chunk) -> Result<Chunk>>),
    /// Answers through a [Reply], possibly later
    Callback(Box<dyn FnMut(Chunk, Reply)>),
    /// Returns a future resolving to the mapped chunk
    Future(Box<dyn FnMut(Chunk) -> LocalBoxFuture<Result<Chunk>>>),
}

impl ThroughFn {
    pub fn sync(f: impl FnMut(Chunk) -> Result<Chunk> + 'static) -> Self {
        ThroughFn::Sync(Box::new(f))
    }

    pub fn callback(f: impl FnMut(Chunk, Reply) + 'static) -> Self {
        ThroughFn::Callback(Box::new(f))
    }

    pub fn future<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(Chunk) -> Fut + 'static,
        Fut: Future<Output = Result<Chunk>> + 'static,
    {
        ThroughFn::Future(Box::new(move |chunk| Box::pin(f(chunk))))
    }
}

/// Completion handle for a callback-style through function
pub struct Reply {
    out: Output,
    done: Done,
}

impl Reply {
    /// Emit an extra chunk before completing
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        self.out.push(chunk)
    }

    /// Emit `result`'s chunk, or fail
    pub fn send(self, result: Result<Chunk>) {
        match result {
            Ok(chunk) => {
                self.out.push(chunk);
                self.done.ok()
            }
            Err(err) => self.done.fail(err),
        }
    }

    /// Complete without emitting anything further
    pub fn finish(self, result: Result<()>) {
        self.done.finish(result)
    }
}

/// Maps each chunk through a user function
pub struct Through {
    f: ThroughFn,
}

impl Through {
    pub fn new(f: ThroughFn) -> Self {
        Through { f }
    }
}

impl Transform for Through {
    fn name(&self) -> &str {
        "through"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        match &mut self.f {
            ThroughFn::Sync(f) => match f(chunk) {
                Ok(mapped) => {
                    out.push(mapped);
                    done.ok()
                }
                Err(err) => done.fail(err),
            },
            ThroughFn::Callback(f) => f(
                chunk,
                Reply {
                    out: out.clone(),
                    done,
                },
            ),
            ThroughFn::Future(f) => {
                let pending = f(chunk);
                let out = out.clone();
                let ctx = out.node().context().clone();
                ctx.spawn(async move {
                    match pending.await {
                        Ok(mapped) => {
                            out.push(mapped);
                            done.ok()
                        }
                        Err(err) => done.fail(err),
                    }
                });
            }
        }
    }
}

/// Keeps chunks matching a predicate
pub struct Filter {
    predicate: Box<dyn FnMut(&Chunk) -> bool>,
}

impl Filter {
    pub fn new(predicate: impl FnMut(&Chunk) -> bool + 'static) -> Self {
        Filter {
            predicate: Box::new(predicate),
        }
    }
}

impl Transform for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        if (self.predicate)(&chunk) {
            out.push(chunk);
        }
        done.ok()
    }
}

/// Groups objects into arrays of `size`; a final short batch is flushed
pub struct Batch {
    size: usize,
    pending: Vec<Value>,
}

impl Batch {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Batch {
            size,
            pending: Vec::with_capacity(size),
        }
    }
}

impl Transform for Batch {
    fn name(&self) -> &str {
        "batch"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        self.pending.push(chunk.into_value());
        if self.pending.len() >= self.size {
            let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.size));
            out.push(Value::Array(batch));
        }
        done.ok()
    }

    fn flush(&mut self, out: &Output, done: Done) {
        if !self.pending.is_empty() {
            out.push(Value::Array(std::mem::take(&mut self.pending)));
        }
        done.ok()
    }
}

/// Splits bytes into string objects on a delimiter.
///
/// Without an explicit delimiter, splits lines on `\n` or `\r\n`.
pub struct Split {
    delimiter: Option<Vec<u8>>,
    buffer: Vec<u8>,
}

impl Split {
    pub fn lines() -> Self {
        Split {
            delimiter: None,
            buffer: Vec::new(),
        }
    }

    pub fn on(delimiter: impl Into<String>) -> Self {
        let delimiter: String = delimiter.into();
        Split {
            delimiter: (!delimiter.is_empty()).then(|| delimiter.into_bytes()),
            buffer: Vec::new(),
        }
    }

    fn delimiter(&self) -> &[u8] {
        self.delimiter.as_deref().unwrap_or(b"\n")
    }

    fn segment(&self, bytes: &[u8]) -> String {
        let bytes = match (&self.delimiter, bytes.last()) {
            (None, Some(b'\r')) => &bytes[..bytes.len() - 1],
            _ => bytes,
        };
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Transform for Split {
    fn name(&self) -> &str {
        "split"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        match chunk {
            Chunk::Data(bytes) => self.buffer.extend_from_slice(&bytes),
            other => self.buffer.extend_from_slice(other.to_text().as_bytes()),
        }

        let delimiter = self.delimiter().to_vec();
        let mut segments = Vec::new();
        let mut start = 0;
        while let Some(at) = find(&self.buffer[start..], &delimiter) {
            segments.push(self.segment(&self.buffer[start..start + at]));
            start += at + delimiter.len();
        }
        self.buffer.drain(..start);

        if segments.first().is_some_and(|s| s.is_empty()) {
            segments.remove(0);
        }
        for segment in segments {
            out.push(segment);
        }
        done.ok()
    }

    fn flush(&mut self, out: &Output, done: Done) {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            out.push(self.segment(&rest));
        }
        done.ok()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Emits a separator between consecutive chunks
pub struct Intersperse {
    separator: Chunk,
    first: bool,
}

impl Intersperse {
    pub fn new(separator: impl Into<Chunk>) -> Self {
        Intersperse {
            separator: separator.into(),
            first: true,
        }
    }
}

impl Transform for Intersperse {
    fn name(&self) -> &str {
        "intersperse"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        if !self.first {
            out.push(self.separator.clone());
        }
        self.first = false;
        out.push(chunk);
        done.ok()
    }
}

/// Passes at most `limit` objects (or bytes), then ends
pub struct Limit {
    limit: usize,
    seen: usize,
}

impl Limit {
    pub fn new(limit: usize) -> Self {
        Limit { limit, seen: 0 }
    }
}

impl Transform for Limit {
    fn name(&self) -> &str {
        "limit"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        if self.seen >= self.limit {
            out.node().push(None);
            return done.ok();
        }
        let object_mode = out.node().is_writable_object_mode();
        match chunk {
            Chunk::Data(bytes) if !object_mode => {
                let room = self.limit - self.seen;
                let take = bytes.len().min(room);
                self.seen += take;
                out.push(bytes.slice(..take));
            }
            other => {
                self.seen += 1;
                out.push(other);
            }
        }
        if self.seen >= self.limit {
            out.node().push(None);
        }
        done.ok()
    }
}

/// Drops the first `count` objects (or bytes)
pub struct Skip {
    count: usize,
    skipped: usize,
}

impl Skip {
    pub fn new(count: usize) -> Self {
        Skip { count, skipped: 0 }
    }
}

impl Transform for Skip {
    fn name(&self) -> &str {
        "skip"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        let remaining = self.count - self.skipped;
        let object_mode = out.node().is_writable_object_mode();
        match chunk {
            _ if remaining == 0 => {
                out.push(chunk);
            }
            Chunk::Data(bytes) if !object_mode => {
                let drop = bytes.len().min(remaining);
                self.skipped += drop;
                if drop < bytes.len() {
                    out.push(bytes.slice(drop..));
                }
            }
            _ => self.skipped += 1,
        }
        done.ok()
    }
}

/// Replaces each object with one of its fields (`null` when missing)
pub struct Pluck {
    field: String,
}

impl Pluck {
    pub fn new(field: impl Into<String>) -> Self {
        Pluck {
            field: field.into(),
        }
    }
}

impl Transform for Pluck {
    fn name(&self) -> &str {
        "pluck"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        match chunk {
            Chunk::Object(value) => {
                out.push(value.get(&self.field).cloned().unwrap_or(Value::Null));
                done.ok()
            }
            Chunk::Data(_) => done.fail(StreamError::InvalidChunk(format!(
                "cannot pluck {:?} from bytes",
                self.field
            ))),
        }
    }
}

/// Parses a byte stream of concatenated JSON documents into objects.
///
/// Only complete top-level values are emitted. A bare number or literal
/// touching the end of the buffer is held back, since the next chunk may
/// extend it.
#[derive(Debug, Default)]
pub struct JsonParse {
    buffer: Vec<u8>,
}

impl JsonParse {
    pub fn new() -> Self {
        JsonParse::default()
    }

    fn drain_values(&mut self, out: &Output, at_end: bool) -> Result<()> {
        let mut consumed = 0;
        let mut failure = None;
        let mut values = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        loop {
            match values.next() {
                Some(Ok(value)) => {
                    let offset = values.byte_offset();
                    let open_ended = !matches!(
                        value,
                        Value::Object(_) | Value::Array(_) | Value::String(_)
                    );
                    if open_ended && offset == self.buffer.len() && !at_end {
                        break;
                    }
                    consumed = offset;
                    out.push(value);
                }
                Some(Err(err)) if err.is_eof() && !at_end => break,
                Some(Err(err)) => {
                    failure = Some(StreamError::InvalidChunk(format!("bad JSON: {}", err)));
                    break;
                }
                None => {
                    consumed = self.buffer.len();
                    break;
                }
            }
        }
        drop(values);
        match failure {
            // the rest of the buffer cannot be resynchronized
            Some(err) => {
                self.buffer.clear();
                Err(err)
            }
            None => {
                self.buffer.drain(..consumed);
                Ok(())
            }
        }
    }
}

impl Transform for JsonParse {
    fn name(&self) -> &str {
        "json-parse"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        match chunk {
            Chunk::Data(bytes) => self.buffer.extend_from_slice(&bytes),
            other => self.buffer.extend_from_slice(other.to_text().as_bytes()),
        }
        done.finish(self.drain_values(out, false))
    }

    fn flush(&mut self, out: &Output, done: Done) {
        done.finish(self.drain_values(out, true))
    }
}

/// Parses separated numbers out of a byte stream.
///
/// Commas and whitespace separate; integral values come out as integers.
#[derive(Debug, Default)]
pub struct NumberParse {
    partial: String,
}

impl NumberParse {
    pub fn new() -> Self {
        NumberParse::default()
    }

    fn is_separator(c: char) -> bool {
        c == ',' || c.is_whitespace()
    }
}

fn parse_number(token: &str) -> Result<Value> {
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Value::from(n));
    }
    token
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StreamError::InvalidChunk(format!("not a number: {:?}", token)))
}

impl Transform for NumberParse {
    fn name(&self) -> &str {
        "number-parse"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        self.partial.push_str(&chunk.to_text());
        let Some(last) = self.partial.rfind(NumberParse::is_separator) else {
            return done.ok();
        };
        let rest = self.partial.split_off(last + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        for token in complete.split(NumberParse::is_separator).filter(|t| !t.is_empty()) {
            match parse_number(token) {
                Ok(value) => {
                    out.push(value);
                }
                Err(err) => return done.fail(err),
            }
        }
        done.ok()
    }

    fn flush(&mut self, out: &Output, done: Done) {
        let token = std::mem::take(&mut self.partial);
        let token = token.trim();
        if token.is_empty() {
            return done.ok();
        }
        match parse_number(token) {
            Ok(value) => {
                out.push(value);
                done.ok()
            }
            Err(err) => done.fail(err),
        }
    }
}

/// Turns objects into bytes: strings verbatim, other values as JSON text
#[derive(Debug, Default)]
pub struct Join;

impl Transform for Join {
    fn name(&self) -> &str {
        "join"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        match chunk {
            Chunk::Data(bytes) => {
                out.push(bytes);
            }
            other => {
                out.push(Bytes::from(other.to_text()));
            }
        }
        done.ok()
    }
}
