//! Adapting foreign async I/O objects into chain nodes.
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::chain::Member;
use crate::chunk::Chunk;
use crate::config::StreamOptions;
use crate::context::Context;
use crate::error::StreamError;
use crate::event::{EventKind, StreamEvent};
use crate::node::{Node, WeakNode};
use crate::stage::{Done, Stage};

pub type BoxReader = Box<dyn AsyncRead + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Unpin>;

/// Something a node can be piped into or built from
pub enum Endpoint {
    Native(Node),
    ForeignReadable(BoxReader),
    ForeignWritable(BoxWriter),
    ForeignDuplex(BoxReader, BoxWriter),
}

/// Classification of an [Endpoint]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Native,
    ForeignReadable,
    ForeignWritable,
    ForeignDuplex,
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Native(_) => EndpointKind::Native,
            Endpoint::ForeignReadable(_) => EndpointKind::ForeignReadable,
            Endpoint::ForeignWritable(_) => EndpointKind::ForeignWritable,
            Endpoint::ForeignDuplex(_, _) => EndpointKind::ForeignDuplex,
        }
    }

    pub fn reader(reader: impl AsyncRead + Unpin + 'static) -> Self {
        Endpoint::ForeignReadable(Box::new(reader))
    }

    pub fn writer(writer: impl AsyncWrite + Unpin + 'static) -> Self {
        Endpoint::ForeignWritable(Box::new(writer))
    }

    /// Split a bidirectional stream into its two halves
    pub fn duplex<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Endpoint::ForeignDuplex(Box::new(reader), Box::new(writer))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Native(node) => write!(f, "Endpoint::Native({})", node),
            other => write!(f, "Endpoint::{:?}", other.kind()),
        }
    }
}

impl From<Node> for Endpoint {
    fn from(node: Node) -> Self {
        Endpoint::Native(node)
    }
}

impl From<&Node> for Endpoint {
    fn from(node: &Node) -> Self {
        Endpoint::Native(node.clone())
    }
}

/// Wrap an endpoint as a byte-mode node; native nodes pass through
pub fn into_node(ctx: &Context, endpoint: Endpoint) -> Node {
    let kind = endpoint.kind();
    let (reader, writer) = match endpoint {
        Endpoint::Native(node) => return node,
        Endpoint::ForeignReadable(reader) => (Some(reader), None),
        Endpoint::ForeignWritable(writer) => (None, Some(writer)),
        Endpoint::ForeignDuplex(reader, writer) => (Some(reader), Some(writer)),
    };
    debug!(?kind, "wrapping foreign endpoint");

    let options = StreamOptions::new().with_name("foreign");
    let stage = ForeignStage {
        reader: reader.map(|r| Rc::new(RefCell::new(Some(r)))),
        writer: writer.map(|w| Rc::new(RefCell::new(Some(w)))),
        reading: Rc::new(Cell::new(false)),
        read_size: ctx.config().foreign_read_size,
    };
    match kind {
        EndpointKind::ForeignReadable => Node::readable(ctx, options, stage),
        EndpointKind::ForeignWritable => Node::writable(ctx, options, stage),
        _ => Node::duplex(ctx, options, stage),
    }
}

type Shared<T> = Rc<RefCell<Option<T>>>;

/// Drives a foreign reader and/or writer from node hooks.
///
/// The I/O object is taken out of its slot for the duration of each
/// operation and put back afterwards.
struct ForeignStage {
    reader: Option<Shared<BoxReader>>,
    writer: Option<Shared<BoxWriter>>,
    reading: Rc<Cell<bool>>,
    read_size: usize,
}

impl Stage for ForeignStage {
    fn name(&self) -> &str {
        "foreign"
    }

    fn read(&mut self, node: &Node, _size: usize) {
        let Some(slot) = &self.reader else {
            return;
        };
        if self.reading.get() {
            return;
        }
        let Some(mut reader) = slot.borrow_mut().take() else {
            return;
        };
        self.reading.set(true);

        let slot = Rc::clone(slot);
        let reading = Rc::clone(&self.reading);
        let node = node.clone();
        let size = self.read_size.max(1);
        let ctx = node.context().clone();
        ctx.spawn(async move {
            let mut buf = vec![0u8; size];
            let result = reader.read(&mut buf).await;
            reading.set(false);
            match result {
                Ok(0) => {
                    trace!(node = %node, "foreign reader reached eof");
                    node.push(None);
                }
                Ok(n) => {
                    *slot.borrow_mut() = Some(reader);
                    buf.truncate(n);
                    node.push(Some(Chunk::Data(Bytes::from(buf))));
                }
                Err(err) => node.emit_error(err.into()),
            }
        });
    }

    fn write(&mut self, node: &Node, chunk: Chunk, done: Done) {
        let Some(slot) = &self.writer else {
            return done.fail(StreamError::stage("foreign", "not writable"));
        };
        let Some(mut writer) = slot.borrow_mut().take() else {
            return done.fail(StreamError::stage("foreign", "writer closed"));
        };
        let slot = Rc::clone(slot);
        let data = match chunk {
            Chunk::Data(bytes) => bytes,
            other => Bytes::from(other.to_text()),
        };
        node.context().spawn(async move {
            let result = async {
                writer.write_all(&data).await?;
                writer.flush().await
            }
            .await;
            *slot.borrow_mut() = Some(writer);
            done.finish(result.map_err(Into::into));
        });
    }

    fn flush(&mut self, node: &Node, done: Done) {
        let Some(mut writer) = self.writer.as_ref().and_then(|slot| slot.borrow_mut().take()) else {
            return done.ok();
        };
        debug!(node = %node, "shutting down foreign writer");
        node.context().spawn(async move {
            done.finish(writer.shutdown().await.map_err(Into::into));
        });
    }

    fn abort(&mut self, _node: &Node) {
        if let Some(slot) = &self.reader {
            slot.borrow_mut().take();
        }
        if let Some(slot) = &self.writer {
            slot.borrow_mut().take();
        }
    }
}

/// A foreign reader feeding a native node directly.
///
/// Appears in the destination's chain as a [Member::Foreign] at the very
/// top. Unpiping stops the pump.
pub struct ForeignSource {
    label: String,
    dest: WeakNode,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl ForeignSource {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop pumping and detach from the destination
    pub fn unpipe(self: &Rc<Self>) {
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
        if let Some(dest) = self.dest.upgrade() {
            let me = Member::Foreign(Rc::clone(self));
            if dest.upstream_nodes().iter().any(|m| m.same(&me)) {
                dest.remove_upstream(&me);
                dest.mark_chain_dirty();
                debug!(source = %self.label, dest = %dest, "unpipe");
                dest.emit(StreamEvent::Unpipe(me));
            }
        }
    }
}

impl fmt::Debug for ForeignSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignSource")
            .field("label", &self.label)
            .finish()
    }
}

impl Node {
    /// Pump a foreign reader into this node without wrapping it.
    ///
    /// Honors this node's backpressure and ends it at EOF.
    pub fn pipe_from_foreign(
        &self,
        label: impl Into<String>,
        reader: impl AsyncRead + Unpin + 'static,
    ) -> Rc<ForeignSource> {
        let source = Rc::new(ForeignSource {
            label: label.into(),
            dest: self.downgrade(),
            task: RefCell::new(None),
        });
        let member = Member::Foreign(Rc::clone(&source));
        self.add_upstream(member.clone());
        self.mark_chain_dirty();
        debug!(source = %source.label, dest = %self, "pipe");
        self.emit(StreamEvent::Pipe(member));

        let drained = Arc::new(Notify::new());
        let wake = Arc::clone(&drained);
        let on_drain = self.on(EventKind::Drain, move |_, _| wake.notify_one());

        let dest = self.clone();
        let weak_source = Rc::downgrade(&source);
        let size = self.context().config().foreign_read_size.max(1);
        let mut reader = reader;
        let task = self.context().spawn(async move {
            let mut buf = vec![0u8; size];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        dest.end();
                        break;
                    }
                    Ok(n) => {
                        let chunk = Chunk::Data(Bytes::copy_from_slice(&buf[..n]));
                        if !dest.write(chunk, Done::noop()) {
                            drained.notified().await;
                        }
                    }
                    Err(err) => {
                        dest.emit_error(err.into());
                        break;
                    }
                }
            }
            dest.off(on_drain);
            if let Some(source) = weak_source.upgrade() {
                source.task.borrow_mut().take();
                source.unpipe();
            }
        });
        *source.task.borrow_mut() = Some(task);
        source
    }
}
