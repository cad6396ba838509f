use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;

use tracing::{debug, trace};

use crate::backpressure::Watermarks;
use crate::chain::Member;
use crate::chunk::{Chunk, Pull};
use crate::conversion::{into_node, Endpoint};
use crate::error::StreamError;
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::node::Node;
use crate::stage::Done;

/// Options for [Node::pipe_with]
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl PipeOptions {
    pub fn end(end: bool) -> Self {
        PipeOptions { end }
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        PipeOptions { end: true }
    }
}

struct PipeLink {
    dest: Node,
    end: bool,
    awaiting_drain: bool,
    on_drain: ListenerId,
    on_finish: ListenerId,
}

pub(crate) struct ReadableState {
    pub(crate) object_mode: bool,
    marks: Watermarks,
    buffer: VecDeque<Chunk>,
    length: usize,
    /// EOF has been pushed
    ended: bool,
    end_emitted: bool,
    end_scheduled: bool,
    /// A stage read is outstanding
    reading: bool,
    flowing: bool,
    flow_scheduled: bool,
    read_more_scheduled: bool,
    need_readable: bool,
    readable_scheduled: bool,
    pipes: Vec<PipeLink>,
}

impl ReadableState {
    pub(crate) fn new(object_mode: bool, high_water_mark: usize) -> Self {
        ReadableState {
            object_mode,
            marks: Watermarks::new(high_water_mark),
            buffer: VecDeque::new(),
            length: 0,
            ended: false,
            end_emitted: false,
            end_scheduled: false,
            reading: false,
            flowing: false,
            flow_scheduled: false,
            read_more_scheduled: false,
            need_readable: false,
            readable_scheduled: false,
            pipes: Vec::new(),
        }
    }

    /// Claim a stage read if the buffer is below the high-water mark
    fn want_more(&mut self) -> Option<usize> {
        if self.ended || self.reading || !self.marks.has_room(self.length) {
            return None;
        }
        self.reading = true;
        Some(self.marks.high() - self.length)
    }
}

enum AfterRead {
    Nothing,
    ReadMore,
    End,
}

impl Node {
    fn readable_state(&self) -> &RefCell<ReadableState> {
        match &self.inner.readable {
            Some(state) => state,
            None => panic!("{} has no readable side", self),
        }
    }

    /// Queue a chunk for consumers, or `None` for end-of-stream.
    ///
    /// Returns false once the buffer reaches the high-water mark; the
    /// stage should stop producing until its next `read`.
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        let state = self.readable_state();
        let Some(chunk) = chunk else {
            self.push_eof();
            return false;
        };

        let object_mode = state.borrow().object_mode;
        let chunk = if object_mode {
            chunk
        } else {
            match chunk.into_data() {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.emit_error(err);
                    return false;
                }
            }
        };

        let has_room = {
            let mut rs = state.borrow_mut();
            if rs.ended {
                None
            } else {
                rs.reading = false;
                let size = chunk.size(object_mode);
                if size > 0 {
                    rs.length += size;
                    rs.buffer.push_back(chunk);
                }
                Some(rs.marks.has_room(rs.length))
            }
        };
        let Some(has_room) = has_room else {
            self.emit_error(StreamError::PushAfterEof);
            return false;
        };

        self.inner.metrics.record_push();
        if !has_room {
            self.inner.metrics.record_push_backpressure();
        }
        self.after_push();
        has_room
    }

    fn push_eof(&self) {
        {
            let mut rs = self.readable_state().borrow_mut();
            if rs.ended {
                return;
            }
            rs.ended = true;
            rs.reading = false;
        }
        trace!(node = %self, "eof pushed");
        self.after_push();
    }

    fn after_push(&self) {
        self.schedule_readable();
        self.schedule_flow();
        self.schedule_read_more();
    }

    /// Pull one chunk from the buffer.
    ///
    /// `size` caps the chunk length on a byte-mode side. `Pending` arms a
    /// `readable` event for when data arrives.
    pub fn read(&self, size: Option<usize>) -> Pull {
        let state = self.readable_state();
        let want = state.borrow_mut().want_more();
        if let Some(n) = want {
            self.call_read(n);
        }

        let (pull, after) = {
            let mut rs = state.borrow_mut();
            let object_mode = rs.object_mode;
            match rs.buffer.pop_front() {
                Some(mut chunk) => {
                    if let Some(limit) = size.filter(|&n| n > 0 && !object_mode) {
                        if let Some(head) = chunk.split_data(limit) {
                            rs.buffer.push_front(chunk);
                            chunk = head;
                        }
                    }
                    rs.length -= chunk.size(object_mode);
                    let after = if rs.ended && rs.buffer.is_empty() {
                        AfterRead::End
                    } else {
                        AfterRead::ReadMore
                    };
                    (Pull::Data(chunk), after)
                }
                None if rs.ended => (Pull::End, AfterRead::End),
                None => {
                    rs.need_readable = true;
                    (Pull::Pending, AfterRead::Nothing)
                }
            }
        };

        match after {
            AfterRead::End => self.schedule_end(),
            AfterRead::ReadMore => self.schedule_read_more(),
            AfterRead::Nothing => {}
        }
        pull
    }

    /// Whether the readable side is below its high-water mark
    pub fn readable_has_room(&self) -> bool {
        self.inner.readable.as_ref().map_or(true, |state| {
            let rs = state.borrow();
            rs.marks.has_room(rs.length)
        })
    }

    /// Whether `end` has been emitted
    pub fn readable_ended(&self) -> bool {
        self.inner
            .readable
            .as_ref()
            .is_some_and(|state| state.borrow().end_emitted)
    }

    /// Nodes this node's readable side is piped into
    pub fn downstream_nodes(&self) -> Vec<Node> {
        match &self.inner.readable {
            Some(state) => state.borrow().pipes.iter().map(|l| l.dest.clone()).collect(),
            None => Vec::new(),
        }
    }

    fn call_read(&self, size: usize) {
        self.with_stage(move |stage, node| stage.read(node, size));
    }

    fn schedule_read_more(&self) {
        {
            let mut rs = self.readable_state().borrow_mut();
            if rs.read_more_scheduled || rs.ended {
                return;
            }
            rs.read_more_scheduled = true;
        }
        let node = self.clone();
        self.inner.ctx.next_tick(move || {
            let want = {
                let mut rs = node.readable_state().borrow_mut();
                rs.read_more_scheduled = false;
                rs.want_more()
            };
            if let Some(n) = want {
                node.call_read(n);
            }
        });
    }

    fn schedule_readable(&self) {
        {
            let mut rs = self.readable_state().borrow_mut();
            if !rs.need_readable || rs.readable_scheduled || rs.flowing {
                return;
            }
            rs.readable_scheduled = true;
        }
        let node = self.clone();
        self.inner.ctx.next_tick(move || {
            {
                let mut rs = node.readable_state().borrow_mut();
                rs.readable_scheduled = false;
                rs.need_readable = false;
            }
            node.emit(StreamEvent::Readable);
        });
    }

    fn schedule_end(&self) {
        {
            let mut rs = self.readable_state().borrow_mut();
            if rs.end_emitted || rs.end_scheduled {
                return;
            }
            rs.end_scheduled = true;
        }
        let node = self.clone();
        self.inner.ctx.next_tick(move || node.emit_end());
    }

    fn emit_end(&self) {
        let dests: Vec<Node> = {
            let mut rs = self.readable_state().borrow_mut();
            rs.end_scheduled = false;
            if rs.end_emitted || !rs.ended || !rs.buffer.is_empty() {
                return;
            }
            rs.end_emitted = true;
            rs.pipes
                .iter()
                .filter(|l| l.end)
                .map(|l| l.dest.clone())
                .collect()
        };
        debug!(node = %self, "end");
        self.emit(StreamEvent::End);
        for dest in dests {
            dest.end();
        }
        if !self.is_writable() {
            self.settle_finish();
        }
    }

    fn schedule_flow(&self) {
        {
            let mut rs = self.readable_state().borrow_mut();
            if !rs.flowing || rs.flow_scheduled {
                return;
            }
            rs.flow_scheduled = true;
        }
        let node = self.clone();
        self.inner.ctx.next_tick(move || node.flow());
    }

    /// Move buffered chunks into every pipe until one pushes back
    fn flow(&self) {
        self.readable_state().borrow_mut().flow_scheduled = false;
        loop {
            let dests: Vec<Node> = {
                let rs = self.readable_state().borrow();
                if !rs.flowing || rs.pipes.is_empty() {
                    return;
                }
                rs.pipes.iter().map(|l| l.dest.clone()).collect()
            };
            let chunk = match self.read(None) {
                Pull::Data(chunk) => chunk,
                Pull::Pending | Pull::End => return,
            };
            let mut paused = false;
            for dest in &dests {
                if !dest.write(chunk.clone(), Done::noop()) {
                    self.await_drain(dest);
                    paused = true;
                }
            }
            if paused {
                trace!(node = %self, "paused for drain");
                return;
            }
        }
    }

    fn await_drain(&self, dest: &Node) {
        let mut rs = self.readable_state().borrow_mut();
        for link in rs.pipes.iter_mut().filter(|l| l.dest.ptr_eq(dest)) {
            link.awaiting_drain = true;
        }
        rs.flowing = false;
    }

    fn on_dest_drain(&self, dest: &Node) {
        let resume = {
            let mut rs = self.readable_state().borrow_mut();
            for link in rs.pipes.iter_mut().filter(|l| l.dest.ptr_eq(dest)) {
                link.awaiting_drain = false;
            }
            let waiting = rs.pipes.iter().any(|l| l.awaiting_drain);
            if !waiting && !rs.pipes.is_empty() && !rs.flowing {
                rs.flowing = true;
                true
            } else {
                false
            }
        };
        if resume {
            self.schedule_flow();
        }
    }

    /// Pipe into `dest`, converting foreign endpoints; returns the
    /// destination node so pipes can be chained
    pub fn pipe(&self, dest: impl Into<Endpoint>) -> Node {
        self.pipe_with(dest, PipeOptions::default())
    }

    pub fn pipe_with(&self, dest: impl Into<Endpoint>, options: PipeOptions) -> Node {
        let dest = into_node(&self.inner.ctx, dest.into());
        assert!(
            dest.is_writable(),
            "cannot pipe {} into {}: not writable",
            self,
            dest
        );
        let state = self.readable_state();

        let source = self.downgrade();
        let on_drain = dest.on(EventKind::Drain, move |dest, _| {
            if let Some(source) = source.upgrade() {
                source.on_dest_drain(dest);
            }
        });
        let source = self.downgrade();
        let on_finish = dest.once(EventKind::Finish, move |dest, _| {
            if let Some(source) = source.upgrade() {
                source.unpipe(Some(dest));
            }
        });

        let already_ended = {
            let mut rs = state.borrow_mut();
            rs.pipes.push(PipeLink {
                dest: dest.clone(),
                end: options.end,
                awaiting_drain: false,
                on_drain,
                on_finish,
            });
            rs.flowing = !rs.pipes.iter().any(|l| l.awaiting_drain);
            rs.end_emitted
        };
        dest.add_upstream(Member::Native(self.clone()));
        self.mark_chain_dirty();
        dest.mark_chain_dirty();

        debug!(source = %self, dest = %dest, "pipe");
        dest.emit(StreamEvent::Pipe(Member::Native(self.clone())));

        if already_ended {
            if options.end {
                let late = dest.clone();
                self.inner.ctx.next_tick(move || late.end());
            }
        } else {
            self.schedule_flow();
        }
        dest
    }

    /// Detach `dest`, or every destination when `None`
    pub fn unpipe(&self, dest: Option<&Node>) {
        let Some(state) = &self.inner.readable else {
            return;
        };
        let (removed, resume) = {
            let mut rs = state.borrow_mut();
            let (removed, kept): (Vec<PipeLink>, Vec<PipeLink>) = mem::take(&mut rs.pipes)
                .into_iter()
                .partition(|l| dest.map_or(true, |d| l.dest.ptr_eq(d)));
            rs.pipes = kept;
            let resume = if rs.pipes.is_empty() {
                rs.flowing = false;
                false
            } else if !rs.flowing && !rs.pipes.iter().any(|l| l.awaiting_drain) {
                rs.flowing = true;
                true
            } else {
                false
            };
            (removed, resume)
        };
        if removed.is_empty() {
            return;
        }

        let me = Member::Native(self.clone());
        for link in removed {
            link.dest.off(link.on_drain);
            link.dest.off(link.on_finish);
            link.dest.remove_upstream(&me);
            debug!(source = %self, dest = %link.dest, "unpipe");
            link.dest.emit(StreamEvent::Unpipe(me.clone()));
        }
        self.mark_chain_dirty();
        if resume {
            self.schedule_flow();
        }
    }
}
