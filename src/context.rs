use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use tokio::task::{JoinHandle, LocalSet};
use tracing::{error, trace};

use crate::chunk::StreamId;
use crate::config::{ContextConfig, UnhandledErrorPolicy};
use crate::error::StreamError;

type Task = Box<dyn FnOnce()>;

/// Shared scheduling and identity context for a family of nodes.
///
/// Every node is created from a context, which hands out stream ids and
/// owns the next-tick queue. Nodes from different contexts never share
/// ids, which keeps tests hermetic.
///
/// A context must be used from inside a [LocalSet]; see [run_local].
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    config: ContextConfig,
    next_id: Cell<u64>,
    ticks: RefCell<VecDeque<Task>>,
    draining: Cell<bool>,
}

impl Context {
    /// Create a context with the default configuration
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    /// Create a context with an explicit configuration
    pub fn with_config(config: ContextConfig) -> Self {
        Context {
            inner: Rc::new(ContextInner {
                config,
                next_id: Cell::new(1),
                ticks: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
            }),
        }
    }

    /// The resolved configuration
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub(crate) fn next_stream_id(&self) -> StreamId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        StreamId(id)
    }

    /// Run `task` after the current callback stack unwinds.
    ///
    /// Tasks run in FIFO order.
    pub fn next_tick(&self, task: impl FnOnce() + 'static) {
        self.inner.ticks.borrow_mut().push_back(Box::new(task));
        if !self.inner.draining.replace(true) {
            self.schedule_drain();
        }
    }

    /// Spawn a future on the local task set
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    /// Number of callbacks waiting for the next tick
    pub fn pending_ticks(&self) -> usize {
        self.inner.ticks.borrow().len()
    }

    fn schedule_drain(&self) {
        let ctx = self.clone();
        tokio::task::spawn_local(async move { ctx.drain_ticks() });
    }

    fn drain_ticks(&self) {
        let _guard = DrainGuard { ctx: self };
        for _ in 0..self.inner.config.tick_budget.max(1) {
            let task = self.inner.ticks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
        trace!(pending = self.pending_ticks(), "tick budget exhausted, yielding");
    }

    /// Surface an error nothing in its chain observed
    pub(crate) fn report_unhandled(&self, err: &StreamError) {
        match self.inner.config.unhandled_error {
            UnhandledErrorPolicy::Log => error!(error = %err, "unhandled stream error"),
            UnhandledErrorPolicy::Panic => panic!("unhandled stream error: {}", err),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands the queue to a fresh drainer if work remains, including after a
/// panicking task.
struct DrainGuard<'a> {
    ctx: &'a Context,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.ctx.inner.ticks.borrow().is_empty() {
            self.ctx.inner.draining.set(false);
        } else {
            self.ctx.schedule_drain();
        }
    }
}

/// Run a future inside a fresh [LocalSet].
pub async fn run_local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}
