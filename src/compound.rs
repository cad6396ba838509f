//! Presenting a sub-chain as a single duplex node.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::chain::Member;
use crate::chunk::{Chunk, Pull};
use crate::config::StreamOptions;
use crate::context::Context;
use crate::conversion::{into_node, Endpoint};
use crate::error::{Result, StreamError};
use crate::event::EventKind;
use crate::node::{Node, WeakNode};
use crate::stage::{Done, PassThrough, Stage};

/// Handle passed to a compound's flush hook.
///
/// Chunks pushed here are emitted after everything the internal readable
/// produces.
pub struct Flush {
    shared: Rc<CompoundShared>,
    done: Done,
}

impl Flush {
    pub fn push(&self, chunk: impl Into<Chunk>) {
        self.shared.flush_output.borrow_mut().push(chunk.into());
    }

    /// Complete the hook; the internal writable is ended on success
    pub fn finish(self, result: Result<()>) {
        self.done.finish(result)
    }
}

pub type FlushHook = Box<dyn FnOnce(Flush)>;

struct CompoundShared {
    outer: RefCell<WeakNode>,
    writable: Node,
    readable: Node,
    /// The last pull came back empty; resume on `readable`
    waiting: Cell<bool>,
    flushed: Cell<bool>,
    ended: Cell<bool>,
    flush_hook: RefCell<Option<FlushHook>>,
    flush_output: RefCell<Vec<Chunk>>,
}

impl CompoundShared {
    fn outer(&self) -> Option<Node> {
        self.outer.borrow().upgrade()
    }

    /// Relay internal output until it runs dry or the outside pushes back
    fn read_some(&self) {
        let Some(outer) = self.outer() else {
            return;
        };
        loop {
            match self.readable.read(None) {
                Pull::Data(chunk) => {
                    if !outer.push(Some(chunk)) {
                        break;
                    }
                }
                Pull::Pending => {
                    self.waiting.set(true);
                    break;
                }
                Pull::End => {
                    self.finish_outward(&outer);
                    break;
                }
            }
        }
    }

    fn finish_outward(&self, outer: &Node) {
        if self.ended.replace(true) {
            return;
        }
        let trailing = self.flush_output.take();
        for chunk in trailing {
            outer.push(Some(chunk));
        }
        outer.push(None);
    }

    /// Runs the flush hook at most once, then ends the internal writable
    fn run_flush(self: &Rc<Self>, done: Done) {
        if self.flushed.replace(true) {
            return done.ok();
        }
        let writable = self.writable.clone();
        let completion = Done::new(move |result: Result<()>| {
            if result.is_ok() {
                writable.end();
            }
            done.finish(result);
        });
        let hook = self.flush_hook.borrow_mut().take();
        match hook {
            Some(hook) => hook(Flush {
                shared: Rc::clone(self),
                done: completion,
            }),
            None => completion.ok(),
        }
    }
}

/// Mark chain errors reaching `inner` as ignored and re-raise them on the
/// outer node at the next tick
fn forward_chain_errors(inner: &Node, shared: &Rc<CompoundShared>) {
    let weak = Rc::downgrade(shared);
    inner.on_chain_error(move |inner, err| {
        inner.ignore_error();
        if let Some(outer) = weak.upgrade().and_then(|shared| shared.outer()) {
            debug!(compound = %outer, error = %err, "forwarding internal error");
            let err = err.clone();
            let target = outer.clone();
            outer.context().next_tick(move || target.emit_error(err));
        }
    });
}

struct CompoundStage {
    shared: Rc<CompoundShared>,
}

impl Stage for CompoundStage {
    fn name(&self) -> &str {
        "compound"
    }

    fn read(&mut self, _node: &Node, _size: usize) {
        self.shared.read_some();
    }

    fn write(&mut self, _node: &Node, chunk: Chunk, done: Done) {
        self.shared.writable.write(chunk, done);
    }

    fn flush(&mut self, _node: &Node, done: Done) {
        self.shared.run_flush(done);
    }

    fn abort(&mut self, _node: &Node) {
        let writable = self.shared.writable.clone();
        let readable = self.shared.readable.clone();
        let same_chain = writable
            .get_stream_chain()
            .ptr_eq(&readable.get_stream_chain());
        writable.abort_chain();
        if !same_chain {
            readable.abort_chain();
        }
    }
}

/// Builder for [CompoundDuplex]
pub struct CompoundDuplexBuilder {
    ctx: Context,
    writable: Option<Endpoint>,
    readable: Option<Endpoint>,
    wrapped: Option<Endpoint>,
    options: StreamOptions,
    flush: Option<FlushHook>,
}

impl CompoundDuplexBuilder {
    /// Internal entry point that external writes go to
    pub fn writable(mut self, writable: impl Into<Endpoint>) -> Self {
        self.writable = Some(writable.into());
        self
    }

    /// Internal exit point whose output is relayed outward
    pub fn readable(mut self, readable: impl Into<Endpoint>) -> Self {
        self.readable = Some(readable.into());
        self
    }

    /// Use one duplex stream as both entry and exit point.
    ///
    /// Foreign duplexes are converted; their errors surface on the
    /// compound node like any internal error.
    pub fn wrap(mut self, stream: impl Into<Endpoint>) -> Self {
        self.wrapped = Some(stream.into());
        self
    }

    /// Options for the outer node; object modes come from the endpoints
    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Hook run once the outer writable side is done, before the
    /// internal writable is ended
    pub fn flush(mut self, hook: impl FnOnce(Flush) + 'static) -> Self {
        self.flush = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<CompoundDuplex> {
        let ctx = self.ctx;
        let (writable, readable) = match (self.wrapped, self.writable, self.readable) {
            (Some(stream), None, None) => {
                let inner = into_node(&ctx, stream);
                if !(inner.is_readable() && inner.is_writable()) {
                    return Err(StreamError::Config(
                        "a wrapped compound stream must be duplex".into(),
                    ));
                }
                (inner.clone(), inner)
            }
            (Some(_), _, _) => {
                return Err(StreamError::Config(
                    "wrap excludes separate entry and exit points".into(),
                ))
            }
            (None, Some(writable), Some(readable)) => {
                (into_node(&ctx, writable), into_node(&ctx, readable))
            }
            (None, None, Some(exit)) | (None, Some(exit), None) => {
                let readable = into_node(&ctx, exit);
                if !readable.is_readable() {
                    return Err(StreamError::Config(
                        "compound exit point must be readable".into(),
                    ));
                }
                let head = readable.get_stream_chain().members().into_iter().next();
                match head {
                    Some(Member::Native(entry)) if entry.is_writable() => (entry, readable),
                    _ => {
                        return Err(StreamError::Config(
                            "compound shorthand needs a native, writable chain head".into(),
                        ))
                    }
                }
            }
            (None, None, None) => {
                let entry = Node::transform(&ctx, StreamOptions::new(), PassThrough);
                let exit = entry.pipe(Node::transform(&ctx, StreamOptions::new(), PassThrough));
                (entry, exit)
            }
        };

        let mut options = self
            .options
            .with_readable_object_mode(readable.is_readable_object_mode())
            .with_writable_object_mode(writable.is_writable_object_mode());
        if options.name.is_none() {
            options = options.with_name("compound");
        }

        let shared = Rc::new(CompoundShared {
            outer: RefCell::new(WeakNode::default()),
            writable: writable.clone(),
            readable: readable.clone(),
            waiting: Cell::new(false),
            flushed: Cell::new(false),
            ended: Cell::new(false),
            flush_hook: RefCell::new(self.flush),
            flush_output: RefCell::new(Vec::new()),
        });
        let node = Node::duplex(
            &ctx,
            options,
            CompoundStage {
                shared: Rc::clone(&shared),
            },
        );
        *shared.outer.borrow_mut() = node.downgrade();

        forward_chain_errors(&writable, &shared);
        if !writable
            .get_stream_chain()
            .ptr_eq(&readable.get_stream_chain())
        {
            forward_chain_errors(&readable, &shared);
        }

        let weak = Rc::downgrade(&shared);
        readable.on(EventKind::Readable, move |_, _| {
            if let Some(shared) = weak.upgrade() {
                if shared.waiting.replace(false) {
                    shared.read_some();
                }
            }
        });

        let weak = Rc::downgrade(&shared);
        node.on(EventKind::Finish, move |_, _| {
            if let Some(shared) = weak.upgrade() {
                shared.run_flush(Done::noop());
            }
        });

        debug!(compound = %node, entry = %writable, exit = %readable, "compound built");
        Ok(CompoundDuplex { node, shared })
    }
}

/// A duplex node wrapping an internal sub-chain.
///
/// Writes go to the internal entry point; the internal exit point's output
/// is pulled on demand and pushed outward. Internal chain errors are
/// marked ignored inside and re-raised on this node, so only the outer
/// chain decides whether to abort.
pub struct CompoundDuplex {
    node: Node,
    shared: Rc<CompoundShared>,
}

impl CompoundDuplex {
    pub fn builder(ctx: &Context) -> CompoundDuplexBuilder {
        CompoundDuplexBuilder {
            ctx: ctx.clone(),
            writable: None,
            readable: None,
            wrapped: None,
            options: StreamOptions::new(),
            flush: None,
        }
    }

    /// Wrap `entry` .. `exit`
    pub fn new(
        ctx: &Context,
        entry: impl Into<Endpoint>,
        exit: impl Into<Endpoint>,
    ) -> Result<Self> {
        Self::builder(ctx).writable(entry).readable(exit).build()
    }

    /// Wrap the chain ending in `exit`, entering at its head
    pub fn from_readable(ctx: &Context, exit: impl Into<Endpoint>) -> Result<Self> {
        Self::builder(ctx).readable(exit).build()
    }

    /// Wrap a single duplex stream
    pub fn wrap(ctx: &Context, stream: impl Into<Endpoint>) -> Result<Self> {
        Self::builder(ctx).wrap(stream).build()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    /// Internal entry point
    pub fn entry(&self) -> &Node {
        &self.shared.writable
    }

    /// Internal exit point
    pub fn exit(&self) -> &Node {
        &self.shared.readable
    }
}

impl From<CompoundDuplex> for Node {
    fn from(compound: CompoundDuplex) -> Self {
        compound.node
    }
}

impl From<CompoundDuplex> for Endpoint {
    fn from(compound: CompoundDuplex) -> Self {
        Endpoint::Native(compound.node)
    }
}
