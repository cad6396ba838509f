//! Chain membership, ordering and error propagation.
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, error};

use crate::chunk::StreamId;
use crate::conversion::ForeignSource;
use crate::error::StreamError;
use crate::event::{EventKind, StreamEvent};
use crate::node::{Node, WeakNode};
use crate::streams::Blackhole;

/// Rank given to foreign members, which sit at the head of a chain
pub const FOREIGN_RANK: i64 = -1000;

/// A chain participant
#[derive(Clone)]
pub enum Member {
    Native(Node),
    /// A foreign reader pumping into a native node
    Foreign(Rc<ForeignSource>),
}

impl Member {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Member::Native(node) => Some(node),
            Member::Foreign(_) => None,
        }
    }

    /// Identity comparison
    pub fn same(&self, other: &Member) -> bool {
        match (self, other) {
            (Member::Native(a), Member::Native(b)) => a.ptr_eq(b),
            (Member::Foreign(a), Member::Foreign(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Native(node) => write!(f, "Native({})", node),
            Member::Foreign(source) => write!(f, "Foreign({})", source.label()),
        }
    }
}

/// What [StreamChain::trigger_chain_error] observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainErrorOutcome {
    /// Some member had a chain-error or unignored-error listener
    pub handled: bool,
    /// Some member called `ignore_error()`
    pub ignored: bool,
}

enum Slot {
    Native(WeakNode),
    Foreign(Rc<ForeignSource>),
}

impl Slot {
    fn upgrade(&self) -> Option<Member> {
        match self {
            Slot::Native(node) => node.upgrade().map(Member::Native),
            Slot::Foreign(source) => Some(Member::Foreign(Rc::clone(source))),
        }
    }
}

struct ChainState {
    slots: Vec<Slot>,
    ranks: Vec<Option<i64>>,
    index: HashMap<StreamId, usize>,
    dirty: bool,
}

/// The connected component of nodes linked by pipes.
///
/// Members are kept ordered upstream to downstream. A chain is cached on
/// every member and rebuilt lazily after the topology changes.
///
/// Errors are delivered chain-wide: every member sees `ChainError` in
/// order. Unless a listener calls [Node::ignore_error], every member then
/// sees `UnignoredError` and the chain is aborted.
#[derive(Clone)]
pub struct StreamChain {
    inner: Rc<RefCell<ChainState>>,
}

impl StreamChain {
    pub(crate) fn new() -> Self {
        StreamChain {
            inner: Rc::new(RefCell::new(ChainState {
                slots: Vec::new(),
                ranks: Vec::new(),
                index: HashMap::new(),
                dirty: true,
            })),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.borrow().dirty
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.borrow_mut().dirty = true;
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &StreamChain) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live members, upstream first
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter_map(Slot::upgrade)
            .collect()
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.position(member).is_some()
    }

    /// Rank from the last recompute; lower is further upstream
    pub fn rank_of(&self, member: &Member) -> Option<i64> {
        let idx = self.position(member)?;
        self.inner.borrow().ranks[idx]
    }

    fn position(&self, member: &Member) -> Option<usize> {
        let state = self.inner.borrow();
        match member {
            Member::Native(node) => state.index.get(&node.id()).copied(),
            Member::Foreign(source) => state
                .slots
                .iter()
                .position(|s| matches!(s, Slot::Foreign(f) if Rc::ptr_eq(f, source))),
        }
    }

    /// Add a member; false if it was already present
    pub(crate) fn add_member(&self, member: Member) -> bool {
        if self.contains(&member) {
            return false;
        }
        let mut state = self.inner.borrow_mut();
        let idx = state.slots.len();
        match member {
            Member::Native(node) => {
                state.index.insert(node.id(), idx);
                state.slots.push(Slot::Native(node.downgrade()));
            }
            Member::Foreign(source) => state.slots.push(Slot::Foreign(source)),
        }
        state.ranks.push(None);
        true
    }

    /// Order members upstream to downstream.
    ///
    /// The first native member is seeded at rank 0; others are derived
    /// from ranked neighbors until nothing changes. Members whose rank
    /// stays unknown keep their position.
    pub(crate) fn recompute_ranks(&self) {
        let members = self.members();
        let n = members.len();
        let mut ranks: Vec<Option<i64>> = vec![None; n];

        let mut index: HashMap<StreamId, usize> = HashMap::new();
        for (i, member) in members.iter().enumerate() {
            if let Member::Native(node) = member {
                index.insert(node.id(), i);
            }
        }
        if let Some(seed) = members.iter().position(|m| m.as_node().is_some()) {
            ranks[seed] = Some(0);
        }

        let lookup = |member: &Member| -> Option<usize> {
            match member {
                Member::Native(node) => index.get(&node.id()).copied(),
                Member::Foreign(source) => members
                    .iter()
                    .position(|m| matches!(m, Member::Foreign(f) if Rc::ptr_eq(f, source))),
            }
        };

        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..n {
                if ranks[i].is_some() {
                    continue;
                }
                let node = match &members[i] {
                    Member::Native(node) => node,
                    Member::Foreign(_) => {
                        ranks[i] = Some(FOREIGN_RANK);
                        changed = true;
                        continue;
                    }
                };
                for downstream in node.downstream_nodes() {
                    if let Some(rank) = index.get(&downstream.id()).and_then(|&j| ranks[j]) {
                        ranks[i] = Some(rank - 1);
                        changed = true;
                    }
                }
                for upstream in node.upstream_nodes() {
                    if let Some(rank) = lookup(&upstream).and_then(|j| ranks[j]) {
                        ranks[i] = Some(rank + 1);
                        changed = true;
                    }
                }
            }
        }

        // Stable-sort the ranked members among their own positions so an
        // unranked member never has to be compared.
        let ranked: Vec<usize> = (0..n).filter(|&i| ranks[i].is_some()).collect();
        let mut sorted = ranked.clone();
        sorted.sort_by_key(|&i| ranks[i]);
        let mut order: Vec<usize> = (0..n).collect();
        for (&slot, &from) in ranked.iter().zip(sorted.iter()) {
            order[slot] = from;
        }

        let mut state = self.inner.borrow_mut();
        state.slots.clear();
        state.ranks.clear();
        state.index.clear();
        for (pos, &from) in order.iter().enumerate() {
            match &members[from] {
                Member::Native(node) => {
                    state.index.insert(node.id(), pos);
                    state.slots.push(Slot::Native(node.downgrade()));
                }
                Member::Foreign(source) => state.slots.push(Slot::Foreign(Rc::clone(source))),
            }
            state.ranks.push(ranks[from]);
        }
        state.dirty = false;
    }

    /// Deliver `err` across the chain.
    ///
    /// Members see `ChainError` upstream first. If nobody ignored it, all
    /// members then see `UnignoredError` and the chain is aborted. An
    /// error with no listener at all is reported through the context's
    /// unhandled-error policy.
    pub(crate) fn trigger_chain_error(&self, err: StreamError) -> ChainErrorOutcome {
        let members = self.members();
        debug!(error = %err, members = members.len(), "chain error");

        let mut outcome = ChainErrorOutcome {
            handled: false,
            ignored: false,
        };
        for node in members.iter().filter_map(Member::as_node) {
            if node.listener_count(EventKind::ChainError) > 0 {
                outcome.handled = true;
            }
            node.emit(StreamEvent::ChainError(err.clone()));
            if node.take_ignore_flag() {
                outcome.ignored = true;
            }
        }

        if !outcome.ignored {
            for node in members.iter().filter_map(Member::as_node) {
                if node.listener_count(EventKind::UnignoredError) > 0 {
                    outcome.handled = true;
                }
                node.emit_unignored(err.clone());
            }
            self.abort_chain();
        }

        if !outcome.handled {
            match members.iter().find_map(Member::as_node) {
                Some(node) => node.context().report_unhandled(&err),
                None => error!(error = %err, "unhandled stream error"),
            }
        }
        outcome
    }

    /// Tear the chain down.
    ///
    /// Top-down, every member is unpiped, readable members drain into a
    /// discard sink and abort hooks run. Then, bottom-up, every writable
    /// member is ended. Members marked `no_abort` skip both hooks.
    pub(crate) fn abort_chain(&self) {
        let members = self.members();
        debug!(members = members.len(), "aborting chain");

        for member in &members {
            match member {
                Member::Native(node) => {
                    node.mark_aborted();
                    if node.is_readable() {
                        node.unpipe(None);
                        let sink = Blackhole::node(node.context(), node.is_readable_object_mode());
                        node.pipe(sink);
                    }
                    if !node.no_abort() {
                        node.abort_stream();
                    }
                }
                Member::Foreign(source) => source.unpipe(),
            }
        }

        for node in members.iter().rev().filter_map(Member::as_node) {
            if node.is_writable() && !node.no_abort() {
                node.end();
            }
        }
    }

    /// One line per member with its metrics
    pub fn metrics_summary(&self) -> String {
        let mut lines = Vec::new();
        for member in self.members() {
            match member {
                Member::Native(node) => lines.push(format!(
                    "{}: {}",
                    node,
                    node.metrics().snapshot().format()
                )),
                Member::Foreign(source) => {
                    lines.push(format!("{}: foreign", source.label()))
                }
            }
        }
        lines.join("\n")
    }
}

impl fmt::Debug for StreamChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.members()).finish()
    }
}
