use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::chunk::Chunk;
use crate::config::StreamOptions;
use crate::context::Context;
use crate::error::Result;
use crate::node::Node;
use crate::stage::Stage;

/// Emits a fixed list of chunks, then ends
pub struct ArraySource {
    items: VecDeque<Chunk>,
}

impl Stage for ArraySource {
    fn name(&self) -> &str {
        "array-source"
    }

    fn read(&mut self, node: &Node, _size: usize) {
        while let Some(item) = self.items.pop_front() {
            if !node.push(Some(item)) {
                return;
            }
        }
        node.push(None);
    }
}

/// Object-mode source over `items`
pub fn from_array<I, T>(ctx: &Context, items: I) -> Node
where
    I: IntoIterator<Item = T>,
    T: Into<Chunk>,
{
    let stage = ArraySource {
        items: items.into_iter().map(Into::into).collect(),
    };
    Node::readable(ctx, StreamOptions::object(), stage)
}

/// Byte-mode source over `text`, split into `chunk_size` pieces
pub fn from_string(ctx: &Context, text: impl Into<String>, chunk_size: usize) -> Node {
    let bytes = Bytes::from(text.into());
    let step = chunk_size.max(1);
    let items = (0..bytes.len())
        .step_by(step)
        .map(|start| Chunk::Data(bytes.slice(start..(start + step).min(bytes.len()))))
        .collect();
    Node::readable(ctx, StreamOptions::new(), ArraySource { items })
}

/// Hands one produced item (or the end) back to a [from_fn] source
pub struct Emit {
    node: Node,
    generating: Rc<Cell<bool>>,
}

impl Emit {
    /// `Ok(Some)` pushes an item, `Ok(None)` ends the stream, `Err`
    /// raises an error
    pub fn send(self, result: Result<Option<Chunk>>) {
        self.generating.set(false);
        match result {
            Ok(item) => {
                self.node.push(item);
            }
            Err(err) => self.node.emit_error(err),
        }
    }

    pub fn item(self, chunk: impl Into<Chunk>) {
        self.send(Ok(Some(chunk.into())))
    }

    pub fn end(self) {
        self.send(Ok(None))
    }
}

type Producer = Rc<RefCell<Box<dyn FnMut(Emit)>>>;

/// Calls a producer function once per item
pub struct FunctionSource {
    produce: Producer,
    generating: Rc<Cell<bool>>,
}

impl Stage for FunctionSource {
    fn name(&self) -> &str {
        "function-source"
    }

    fn read(&mut self, node: &Node, _size: usize) {
        if self.generating.replace(true) {
            return;
        }
        let emit = Emit {
            node: node.clone(),
            generating: Rc::clone(&self.generating),
        };
        let produce = Rc::clone(&self.produce);
        node.context().next_tick(move || {
            let mut produce = produce.borrow_mut();
            (*produce)(emit)
        });
    }
}

/// Object-mode source calling `produce` on the next tick whenever more
/// output is wanted. The producer answers through [Emit], possibly later.
pub fn from_fn(ctx: &Context, produce: impl FnMut(Emit) + 'static) -> Node {
    let stage = FunctionSource {
        produce: Rc::new(RefCell::new(Box::new(produce))),
        generating: Rc::new(Cell::new(false)),
    };
    Node::readable(ctx, StreamOptions::object(), stage)
}

/// [from_fn] for producers that answer immediately
pub fn from_fn_sync(
    ctx: &Context,
    mut produce: impl FnMut() -> Result<Option<Chunk>> + 'static,
) -> Node {
    from_fn(ctx, move |emit| emit.send(produce()))
}
