use std::cell::Cell;
use std::rc::Rc;

use crate::chain::Member;
use crate::error::StreamError;
use crate::node::Node;

/// Event names observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Pipe,
    Unpipe,
    Readable,
    End,
    Drain,
    Prefinish,
    Finish,
    Error,
    ChainError,
    UnignoredError,
    AbortStream,
}

/// An event delivered to observers of a node
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A source was piped into this node
    Pipe(Member),
    /// A source was unpiped from this node
    Unpipe(Member),
    /// Data (or end-of-stream) is available to `read()`
    Readable,
    /// The readable side delivered its last chunk
    End,
    /// The writable side's buffer drained below the high-water mark
    Drain,
    /// All writes are done and the flush hook is about to settle
    Prefinish,
    /// The writable side finished
    Finish,
    /// A direct error on this node
    Error(StreamError),
    /// An error somewhere in this node's chain
    ChainError(StreamError),
    /// A chain error no member chose to ignore
    UnignoredError(StreamError),
    /// The node was aborted along with its chain
    AbortStream,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Pipe(_) => EventKind::Pipe,
            StreamEvent::Unpipe(_) => EventKind::Unpipe,
            StreamEvent::Readable => EventKind::Readable,
            StreamEvent::End => EventKind::End,
            StreamEvent::Drain => EventKind::Drain,
            StreamEvent::Prefinish => EventKind::Prefinish,
            StreamEvent::Finish => EventKind::Finish,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::ChainError(_) => EventKind::ChainError,
            StreamEvent::UnignoredError(_) => EventKind::UnignoredError,
            StreamEvent::AbortStream => EventKind::AbortStream,
        }
    }

    /// The carried error, for the three error events
    pub fn error(&self) -> Option<&StreamError> {
        match self {
            StreamEvent::Error(err)
            | StreamEvent::ChainError(err)
            | StreamEvent::UnignoredError(err) => Some(err),
            _ => None,
        }
    }
}

/// Handle for removing a listener with [Node::off]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type Callback = Rc<dyn Fn(&Node, &StreamEvent)>;

struct Listener {
    id: u64,
    kind: EventKind,
    once: bool,
    callback: Callback,
}

/// Per-node observer list
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

impl Listeners {
    pub(crate) fn add(&mut self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        self.next_id += 1;
        self.entries.push(Listener {
            id: self.next_id,
            kind,
            once,
            callback,
        });
        ListenerId(self.next_id)
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|l| l.id != id.0);
        self.entries.len() != before
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|l| l.kind == kind).count()
    }

    /// Callbacks to run for `kind`, dropping one-shot entries
    pub(crate) fn take_for(&mut self, kind: EventKind) -> Vec<Callback> {
        let callbacks = self
            .entries
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| Rc::clone(&l.callback))
            .collect();
        self.entries.retain(|l| !(l.once && l.kind == kind));
        callbacks
    }
}

/// Turn a one-shot closure into a shareable callback
pub(crate) fn once_callback<F>(f: F) -> Callback
where
    F: FnOnce(&Node, &StreamEvent) + 'static,
{
    let slot = Cell::new(Some(f));
    Rc::new(move |node: &Node, event: &StreamEvent| {
        if let Some(f) = slot.take() {
            f(node, event)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Rc::new(|_: &Node, _: &StreamEvent| {})
    }

    #[test]
    fn test_once_entries_are_dropped_after_take() {
        let mut listeners = Listeners::default();
        listeners.add(EventKind::Finish, true, noop());
        let keep = listeners.add(EventKind::Finish, false, noop());
        listeners.add(EventKind::End, true, noop());

        assert_eq!(listeners.take_for(EventKind::Finish).len(), 2);
        assert_eq!(listeners.count(EventKind::Finish), 1);
        assert_eq!(listeners.count(EventKind::End), 1);
        assert!(listeners.remove(keep));
        assert!(!listeners.remove(keep));
    }

    #[test]
    fn test_error_payload() {
        let event = StreamEvent::ChainError(StreamError::WriteAfterEnd);
        assert_eq!(event.kind(), EventKind::ChainError);
        assert!(event.error().is_some());
        assert!(StreamEvent::Finish.error().is_none());
    }
}
