use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::time::Instant;

use tracing::{debug, trace};

use crate::backpressure::Watermarks;
use crate::chunk::Chunk;
use crate::error::{Result, StreamError};
use crate::event::StreamEvent;
use crate::node::Node;
use crate::stage::Done;

pub(crate) struct WritableState {
    pub(crate) object_mode: bool,
    marks: Watermarks,
    queue: VecDeque<(Chunk, Done)>,
    /// Queued plus in-flight size
    length: usize,
    writing: bool,
    ending: bool,
    flushing: bool,
    end_callbacks: Vec<Done>,
}

impl WritableState {
    pub(crate) fn new(object_mode: bool, high_water_mark: usize) -> Self {
        WritableState {
            object_mode,
            marks: Watermarks::new(high_water_mark),
            queue: VecDeque::new(),
            length: 0,
            writing: false,
            ending: false,
            flushing: false,
            end_callbacks: Vec::new(),
        }
    }
}

impl Node {
    fn writable_state(&self) -> &RefCell<WritableState> {
        match &self.inner.writable {
            Some(state) => state,
            None => panic!("{} has no writable side", self),
        }
    }

    /// Write a chunk; `done` runs once the stage has consumed it.
    ///
    /// Returns false when the caller should wait for `drain` before
    /// writing more.
    pub fn write(&self, chunk: impl Into<Chunk>, done: Done) -> bool {
        let state = self.writable_state();
        let (object_mode, ending) = {
            let ws = state.borrow();
            (ws.object_mode, ws.ending)
        };
        if ending {
            self.reject_write(StreamError::WriteAfterEnd, done);
            return false;
        }

        let chunk = chunk.into();
        let chunk = if object_mode {
            chunk
        } else {
            match chunk.into_data() {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.reject_write(err, done);
                    return false;
                }
            }
        };

        let size = chunk.size(object_mode);
        let (start, saturated) = {
            let mut ws = state.borrow_mut();
            ws.length += size;
            let saturated = ws.marks.check_and_update(ws.length);
            if ws.writing {
                ws.queue.push_back((chunk, done));
                (None, saturated)
            } else {
                ws.writing = true;
                (Some((chunk, done)), saturated)
            }
        };
        if saturated {
            self.inner.metrics.record_write_backpressure();
        }
        if let Some((chunk, done)) = start {
            self.do_write(chunk, done);
        }
        !saturated
    }

    fn reject_write(&self, err: StreamError, done: Done) {
        let node = self.clone();
        self.inner.ctx.next_tick(move || {
            done.fail(err.clone());
            node.emit_error(err);
        });
    }

    fn do_write(&self, chunk: Chunk, done: Done) {
        let size = chunk.size(self.writable_state().borrow().object_mode);
        let started = Instant::now();
        let node = self.clone();
        let completion = Done::new(move |result| {
            let ctx = node.inner.ctx.clone();
            ctx.next_tick(move || node.after_write(size, started, result, done));
        });
        self.with_stage(move |stage, node| stage.write(node, chunk, completion));
    }

    fn after_write(&self, size: usize, started: Instant, result: Result<()>, done: Done) {
        self.inner.metrics.record_write(size, started.elapsed());
        let (next, drained) = {
            let mut ws = self.writable_state().borrow_mut();
            ws.length -= size;
            let was_active = ws.marks.is_active();
            let active = ws.marks.check_and_update(ws.length);
            let next = ws.queue.pop_front();
            ws.writing = next.is_some();
            (next, was_active && !active)
        };

        if let Err(err) = &result {
            debug!(node = %self, error = %err, "write failed");
            self.emit_error(err.clone());
        }
        done.finish(result);
        if drained {
            trace!(node = %self, "drain");
            self.emit(StreamEvent::Drain);
        }
        match next {
            Some((chunk, done)) => self.do_write(chunk, done),
            None => self.maybe_finish(),
        }
    }

    /// Signal that no more chunks will be written
    pub fn end(&self) {
        self.end_with(Done::noop());
    }

    /// [Node::end], calling `done` once the node has finished
    pub fn end_with(&self, done: Done) {
        let Some(state) = &self.inner.writable else {
            done.ok();
            return;
        };
        if self.is_ended() {
            self.inner.ctx.next_tick(move || done.ok());
            return;
        }
        {
            let mut ws = state.borrow_mut();
            ws.end_callbacks.push(done);
            if ws.ending {
                return;
            }
            ws.ending = true;
        }
        trace!(node = %self, "ending");
        self.maybe_finish();
    }

    /// Whether `end()` has been called
    pub fn writable_ending(&self) -> bool {
        self.inner
            .writable
            .as_ref()
            .is_some_and(|state| state.borrow().ending)
    }

    fn maybe_finish(&self) {
        {
            let mut ws = self.writable_state().borrow_mut();
            if !ws.ending || ws.writing || !ws.queue.is_empty() || ws.flushing {
                return;
            }
            ws.flushing = true;
        }
        let node = self.clone();
        let completion = Done::new(move |result| {
            let ctx = node.inner.ctx.clone();
            ctx.next_tick(move || node.after_flush(result));
        });
        self.with_stage(move |stage, node| stage.flush(node, completion));
    }

    fn after_flush(&self, result: Result<()>) {
        if let Err(err) = result {
            self.emit_error(err);
        }
        self.emit(StreamEvent::Prefinish);
        let callbacks = mem::take(&mut self.writable_state().borrow_mut().end_callbacks);
        self.settle_finish();
        for done in callbacks {
            done.ok();
        }
    }
}
