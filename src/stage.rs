use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{Result, StreamError};
use crate::node::Node;

/// Completion callback handed to a stage hook.
///
/// Consuming the callback makes "call it at most once" a type-level
/// guarantee.
pub struct Done {
    callback: Box<dyn FnOnce(Result<()>)>,
}

impl Done {
    /// Wrap a completion closure
    pub fn new(callback: impl FnOnce(Result<()>) + 'static) -> Self {
        Done {
            callback: Box::new(callback),
        }
    }

    /// A completion nobody waits on
    pub fn noop() -> Self {
        Done::new(|_| {})
    }

    /// Complete with `result`
    pub fn finish(self, result: Result<()>) {
        (self.callback)(result)
    }

    /// Complete successfully
    pub fn ok(self) {
        self.finish(Ok(()))
    }

    /// Complete with an error
    pub fn fail(self, err: StreamError) {
        self.finish(Err(err))
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Done")
    }
}

/// Behavior plugged into a [Node].
///
/// The node owns buffering, events and topology; a stage only produces
/// and consumes chunks. Hooks are never re-entered: if a hook is already
/// running on the node, the next call is deferred to the next tick.
pub trait Stage: 'static {
    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }

    /// Produce up to `size` more output via [Node::push]
    fn read(&mut self, node: &Node, size: usize) {
        let _ = (node, size);
    }

    /// Consume one chunk, then call `done`
    fn write(&mut self, node: &Node, chunk: Chunk, done: Done) {
        let _ = (node, chunk);
        done.fail(StreamError::stage(self.name(), "write is not supported"));
    }

    /// Called once after the last write, before `finish`
    fn flush(&mut self, node: &Node, done: Done) {
        let _ = node;
        done.ok()
    }

    /// Called when the node's chain is aborted
    fn abort(&mut self, node: &Node) {
        let _ = node;
    }
}

/// Push handle given to a [Transform]
#[derive(Clone)]
pub struct Output {
    node: Node,
}

impl Output {
    pub(crate) fn new(node: &Node) -> Self {
        Output { node: node.clone() }
    }

    /// Emit a chunk; false means the readable side is saturated
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        self.node.push(Some(chunk.into()))
    }

    /// The transform's node
    pub fn node(&self) -> &Node {
        &self.node
    }
}

/// Duplex stage mapping written chunks to pushed chunks
pub trait Transform: 'static {
    /// Get a human-readable name for this transform
    fn name(&self) -> &str {
        "transform"
    }

    /// Handle one chunk, pushing any output through `out`
    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done);

    /// Push any trailing output once the input has ended
    fn flush(&mut self, out: &Output, done: Done) {
        let _ = out;
        done.ok()
    }
}

/// Adapts a [Transform] to a [Stage].
///
/// A write completes only once its output has room, so a saturated
/// readable side holds back the writer until the next read.
pub(crate) struct TransformStage<T> {
    inner: T,
    held: Rc<RefCell<Option<Done>>>,
}

impl<T: Transform> TransformStage<T> {
    pub(crate) fn new(inner: T) -> Self {
        TransformStage {
            inner,
            held: Rc::new(RefCell::new(None)),
        }
    }
}

impl<T: Transform> Stage for TransformStage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read(&mut self, _node: &Node, _size: usize) {
        let held = self.held.borrow_mut().take();
        if let Some(done) = held {
            done.ok();
        }
    }

    fn write(&mut self, node: &Node, chunk: Chunk, done: Done) {
        let held = Rc::clone(&self.held);
        let owner = node.clone();
        let completion = Done::new(move |result| match result {
            Ok(()) if !owner.readable_has_room() => {
                *held.borrow_mut() = Some(done);
            }
            other => done.finish(other),
        });
        self.inner.transform(chunk, &Output::new(node), completion);
    }

    fn flush(&mut self, node: &Node, done: Done) {
        let owner = node.clone();
        let completion = Done::new(move |result| {
            if result.is_ok() {
                owner.push(None);
            }
            done.finish(result);
        });
        self.inner.flush(&Output::new(node), completion);
    }
}

/// Forwards every chunk unchanged
#[derive(Debug, Default)]
pub struct PassThrough;

impl Transform for PassThrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        out.push(chunk);
        done.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_done_runs_callback_once_with_result() {
        let seen = Rc::new(Cell::new(None));
        let sink = seen.clone();
        let done = Done::new(move |result: Result<()>| sink.set(Some(result.is_ok())));
        done.fail(StreamError::stage("test", "boom"));
        assert_eq!(seen.get(), Some(false));
    }

    #[test]
    fn test_default_names() {
        struct Silent;
        impl Stage for Silent {}
        assert_eq!(Silent.name(), "stage");
        assert_eq!(PassThrough.name(), "passthrough");
    }
}
