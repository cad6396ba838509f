use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::chain::{ChainErrorOutcome, Member, StreamChain};
use crate::chunk::StreamId;
use crate::config::StreamOptions;
use crate::context::Context;
use crate::error::{Result, StreamError};
use crate::event::{once_callback, EventKind, ListenerId, Listeners, StreamEvent};
use crate::metrics::NodeMetrics;
use crate::readable::ReadableState;
use crate::stage::{Stage, Transform, TransformStage};
use crate::writable::WritableState;

/// Handle to a chain-aware stream node.
///
/// A node pairs a [Stage] with the engine that buffers chunks, applies
/// backpressure, emits events and tracks topology. Handles are cheap to
/// clone and compare by identity.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Rc<NodeInner>,
}

/// Non-owning node handle
#[derive(Clone)]
pub struct WeakNode {
    inner: Weak<NodeInner>,
}

impl Default for WeakNode {
    fn default() -> Self {
        WeakNode { inner: Weak::new() }
    }
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

#[derive(Default)]
struct Terminal {
    finished: bool,
    last_error: Option<StreamError>,
}

pub(crate) struct NodeInner {
    id: StreamId,
    name: String,
    pub(crate) ctx: Context,
    pub(crate) readable: Option<RefCell<ReadableState>>,
    pub(crate) writable: Option<RefCell<WritableState>>,
    pub(crate) upstream: RefCell<Vec<Member>>,
    stage: RefCell<Box<dyn Stage>>,
    chain: RefCell<StreamChain>,
    listeners: RefCell<Listeners>,
    ignore_error: Cell<bool>,
    no_abort: Cell<bool>,
    aborted: Cell<bool>,
    terminal: RefCell<Terminal>,
    pub(crate) metrics: NodeMetrics,
}

impl Node {
    /// Create a source node driven by `stage.read`
    pub fn readable(ctx: &Context, options: StreamOptions, stage: impl Stage) -> Node {
        Self::build(ctx, options, true, false, Box::new(stage))
    }

    /// Create a sink node driven by `stage.write`
    pub fn writable(ctx: &Context, options: StreamOptions, stage: impl Stage) -> Node {
        Self::build(ctx, options, false, true, Box::new(stage))
    }

    /// Create a node with independent readable and writable sides
    pub fn duplex(ctx: &Context, options: StreamOptions, stage: impl Stage) -> Node {
        Self::build(ctx, options, true, true, Box::new(stage))
    }

    /// Create a duplex node from a [Transform]
    pub fn transform(ctx: &Context, options: StreamOptions, transform: impl Transform) -> Node {
        Self::build(
            ctx,
            options,
            true,
            true,
            Box::new(TransformStage::new(transform)),
        )
    }

    fn build(
        ctx: &Context,
        options: StreamOptions,
        readable: bool,
        writable: bool,
        stage: Box<dyn Stage>,
    ) -> Node {
        let config = ctx.config();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| stage.name().to_string());

        let readable = readable.then(|| {
            let object_mode = options.readable_mode();
            let limit = options
                .readable_high_water_mark
                .unwrap_or_else(|| config.high_water_mark(object_mode));
            RefCell::new(ReadableState::new(object_mode, limit))
        });
        let writable = writable.then(|| {
            let object_mode = options.writable_mode();
            let limit = options
                .writable_high_water_mark
                .unwrap_or_else(|| config.high_water_mark(object_mode));
            RefCell::new(WritableState::new(object_mode, limit))
        });

        let node = Node {
            inner: Rc::new(NodeInner {
                id: ctx.next_stream_id(),
                name,
                ctx: ctx.clone(),
                readable,
                writable,
                upstream: RefCell::new(Vec::new()),
                stage: RefCell::new(stage),
                chain: RefCell::new(StreamChain::new()),
                listeners: RefCell::new(Listeners::default()),
                ignore_error: Cell::new(false),
                no_abort: Cell::new(false),
                aborted: Cell::new(false),
                terminal: RefCell::new(Terminal::default()),
                metrics: NodeMetrics::new(),
            }),
        };
        trace!(node = %node, "created");
        node
    }

    /// Sequence id, unique within the node's context
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    pub fn is_readable(&self) -> bool {
        self.inner.readable.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.is_some()
    }

    pub fn is_readable_object_mode(&self) -> bool {
        self.inner
            .readable
            .as_ref()
            .is_some_and(|state| state.borrow().object_mode)
    }

    pub fn is_writable_object_mode(&self) -> bool {
        self.inner
            .writable
            .as_ref()
            .is_some_and(|state| state.borrow().object_mode)
    }

    /// Whether the node has finished (or, for a source, ended)
    pub fn is_ended(&self) -> bool {
        self.inner.terminal.borrow().finished
    }

    /// The first unignored chain error this node saw
    pub fn last_error(&self) -> Option<StreamError> {
        self.inner.terminal.borrow().last_error.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to every future `kind` event
    pub fn on(&self, kind: EventKind, f: impl Fn(&Node, &StreamEvent) + 'static) -> ListenerId {
        self.inner
            .listeners
            .borrow_mut()
            .add(kind, false, Rc::new(f))
    }

    /// Subscribe to the next `kind` event only
    pub fn once(
        &self,
        kind: EventKind,
        f: impl FnOnce(&Node, &StreamEvent) + 'static,
    ) -> ListenerId {
        self.inner
            .listeners
            .borrow_mut()
            .add(kind, true, once_callback(f))
    }

    /// Remove a listener; false if it was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.borrow_mut().remove(id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.borrow().count(kind)
    }

    /// Observe direct errors on this node.
    ///
    /// A node with its own error listener keeps its errors out of the
    /// chain.
    pub fn on_error(&self, f: impl Fn(&Node, &StreamError) + 'static) -> ListenerId {
        self.on(EventKind::Error, move |node, event| {
            if let Some(err) = event.error() {
                f(node, err)
            }
        })
    }

    /// Observe every error raised anywhere in this node's chain
    pub fn on_chain_error(&self, f: impl Fn(&Node, &StreamError) + 'static) -> ListenerId {
        self.on(EventKind::ChainError, move |node, event| {
            if let Some(err) = event.error() {
                f(node, err)
            }
        })
    }

    /// Call `handler` with the first chain error reaching this node.
    ///
    /// The listener stays attached for later errors but ignores them.
    pub fn first_error(
        &self,
        handler: impl FnOnce(&Node, &StreamError) + 'static,
    ) -> ListenerId {
        let handler = RefCell::new(Some(handler));
        self.on_chain_error(move |node, err| {
            let pending = handler.borrow_mut().take();
            if let Some(handler) = pending {
                handler(node, err)
            }
        })
    }

    /// Observe chain errors that no member ignored
    pub fn on_unignored_error(&self, f: impl Fn(&Node, &StreamError) + 'static) -> ListenerId {
        self.on(EventKind::UnignoredError, move |node, event| {
            if let Some(err) = event.error() {
                f(node, err)
            }
        })
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let callbacks = self.inner.listeners.borrow_mut().take_for(event.kind());
        for callback in callbacks {
            callback(self, &event);
        }
    }

    /// Raise an error from this node.
    ///
    /// Delivered to the node's own error listeners if it has any,
    /// otherwise escalated to the whole chain. Errors raised after the
    /// node was aborted are only logged.
    pub fn emit_error(&self, err: StreamError) {
        if self.listener_count(EventKind::Error) > 0 {
            self.emit(StreamEvent::Error(err));
        } else if self.inner.aborted.get() {
            debug!(node = %self, error = %err, "error after abort dropped");
        } else {
            self.trigger_chain_error(err);
        }
    }

    /// Deliver `err` to every member of the chain.
    ///
    /// See [StreamChain] for the ignore and abort rules.
    pub fn trigger_chain_error(&self, err: StreamError) -> ChainErrorOutcome {
        self.get_stream_chain().trigger_chain_error(err)
    }

    /// Mark the chain error currently being delivered as ignored.
    ///
    /// Only meaningful from inside a chain-error listener.
    pub fn ignore_error(&self) {
        self.inner.ignore_error.set(true);
    }

    pub(crate) fn take_ignore_flag(&self) -> bool {
        self.inner.ignore_error.replace(false)
    }

    /// Opt this node out of abort hooks and the closing `end()` when its
    /// chain aborts
    pub fn set_no_abort(&self, no_abort: bool) {
        self.inner.no_abort.set(no_abort);
    }

    pub fn no_abort(&self) -> bool {
        self.inner.no_abort.get()
    }

    /// Tear down every member of this node's chain
    pub fn abort_chain(&self) {
        self.get_stream_chain().abort_chain();
    }

    pub(crate) fn mark_aborted(&self) {
        self.inner.aborted.set(true);
    }

    pub(crate) fn abort_stream(&self) {
        debug!(node = %self, "aborting stream");
        self.with_stage(|stage, node| stage.abort(node));
        self.emit(StreamEvent::AbortStream);
    }

    pub(crate) fn emit_unignored(&self, err: StreamError) {
        {
            let mut terminal = self.inner.terminal.borrow_mut();
            if terminal.last_error.is_none() {
                terminal.last_error = Some(err.clone());
            }
        }
        self.emit(StreamEvent::UnignoredError(err));
    }

    /// Members feeding this node's writable side
    pub fn upstream_nodes(&self) -> Vec<Member> {
        self.inner.upstream.borrow().clone()
    }

    pub(crate) fn add_upstream(&self, member: Member) {
        let mut upstream = self.inner.upstream.borrow_mut();
        if !upstream.iter().any(|m| m.same(&member)) {
            upstream.push(member);
        }
    }

    pub(crate) fn remove_upstream(&self, member: &Member) {
        self.inner.upstream.borrow_mut().retain(|m| !m.same(member));
    }

    /// The node's chain, rebuilt from the current topology if stale
    pub fn get_stream_chain(&self) -> StreamChain {
        let current = self.inner.chain.borrow().clone();
        if !current.is_dirty() {
            return current;
        }

        let chain = StreamChain::new();
        chain.add_member(Member::Native(self.clone()));
        let mut pending = vec![self.clone()];
        while let Some(node) = pending.pop() {
            *node.inner.chain.borrow_mut() = chain.clone();
            let neighbors = node
                .upstream_nodes()
                .into_iter()
                .chain(node.downstream_nodes().into_iter().map(Member::Native));
            for neighbor in neighbors {
                if chain.add_member(neighbor.clone()) {
                    if let Member::Native(next) = neighbor {
                        pending.push(next);
                    }
                }
            }
        }
        chain.recompute_ranks();
        trace!(node = %self, members = chain.len(), "chain rebuilt");
        chain
    }

    pub(crate) fn mark_chain_dirty(&self) {
        self.inner.chain.borrow().mark_dirty();
    }

    /// Run `f` against the stage, or on the next tick if a hook is
    /// already running
    pub(crate) fn with_stage<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn Stage, &Node) + 'static,
    {
        match self.inner.stage.try_borrow_mut() {
            Ok(mut stage) => f(&mut **stage, self),
            Err(_) => {
                let node = self.clone();
                self.inner.ctx.next_tick(move || node.with_stage(f));
            }
        }
    }

    pub(crate) fn settle_finish(&self) {
        {
            let mut terminal = self.inner.terminal.borrow_mut();
            if terminal.finished {
                return;
            }
            terminal.finished = true;
        }
        debug!(node = %self, "finished");
        self.emit(StreamEvent::Finish);
    }

    /// Call `handler` once the node finishes; immediately if it has
    pub fn first_finish(&self, handler: impl FnOnce(&Node) + 'static) {
        if self.is_ended() {
            handler(self);
        } else {
            self.once(EventKind::Finish, move |node, _| handler(node));
        }
    }

    /// Call `handler` with the first unignored chain error; immediately
    /// if one was already seen
    pub fn first_unignored_error(&self, handler: impl FnOnce(&Node, &StreamError) + 'static) {
        match self.last_error() {
            Some(err) => handler(self, &err),
            None => {
                self.once(EventKind::UnignoredError, move |node, event| {
                    if let Some(err) = event.error() {
                        handler(node, err)
                    }
                });
            }
        }
    }

    /// Report completion through `callback`: `Ok` on finish, `Err` on
    /// the first unignored chain error. Called exactly once, even when
    /// the node has already settled.
    pub fn into_callback(&self, callback: impl FnOnce(Result<()>) + 'static) -> Node {
        let callback: Box<dyn FnOnce(Result<()>)> = Box::new(callback);
        let slot = Rc::new(Cell::new(Some(callback)));

        let settled = {
            let terminal = self.inner.terminal.borrow();
            match (&terminal.last_error, terminal.finished) {
                (Some(err), _) => Some(Err(err.clone())),
                (None, true) => Some(Ok(())),
                (None, false) => None,
            }
        };
        if let Some(result) = settled {
            self.inner.ctx.next_tick(move || {
                if let Some(callback) = slot.take() {
                    callback(result)
                }
            });
            return self.clone();
        }

        let on_error = Rc::clone(&slot);
        self.once(EventKind::UnignoredError, move |_, event| {
            let err = event.error().cloned().unwrap_or(StreamError::Abandoned);
            if let Some(callback) = on_error.take() {
                callback(Err(err))
            }
        });
        self.once(EventKind::Finish, move |_, _| {
            if let Some(callback) = slot.take() {
                callback(Ok(()))
            }
        });
        self.clone()
    }

    /// Future form of [Node::into_callback]
    pub fn into_future(&self) -> impl Future<Output = Result<()>> + 'static {
        let (tx, rx) = oneshot::channel();
        self.into_callback(move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.unwrap_or(Err(StreamError::Abandoned)) }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.inner.name, self.inner.id)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Debug for WeakNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(node) => write!(f, "WeakNode({})", node),
            None => f.write_str("WeakNode(dropped)"),
        }
    }
}
