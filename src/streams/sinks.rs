use std::cell::RefCell;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::config::StreamOptions;
use crate::context::Context;
use crate::error::Result;
use crate::node::Node;
use crate::stage::{Done, Stage};

/// Accepts and discards everything
#[derive(Debug, Default)]
pub struct Blackhole;

impl Blackhole {
    /// A discard sink in the given mode
    pub fn node(ctx: &Context, object_mode: bool) -> Node {
        let options = StreamOptions::new()
            .with_name("blackhole")
            .with_object_mode(object_mode);
        Node::writable(ctx, options, Blackhole)
    }
}

impl Stage for Blackhole {
    fn name(&self) -> &str {
        "blackhole"
    }

    fn write(&mut self, _node: &Node, _chunk: Chunk, done: Done) {
        done.ok()
    }
}

/// Collects every chunk into a shared vector
pub struct CollectSink {
    items: Rc<RefCell<Vec<Chunk>>>,
}

impl CollectSink {
    /// An object-mode collecting node and a handle to what it collects
    pub fn node(ctx: &Context) -> (Node, Rc<RefCell<Vec<Chunk>>>) {
        let items = Rc::new(RefCell::new(Vec::new()));
        let sink = CollectSink {
            items: Rc::clone(&items),
        };
        (Node::writable(ctx, StreamOptions::object(), sink), items)
    }
}

impl Stage for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn write(&mut self, _node: &Node, chunk: Chunk, done: Done) {
        self.items.borrow_mut().push(chunk);
        done.ok()
    }
}

/// Appends the text form of every chunk to a shared string
pub struct StringSink {
    text: Rc<RefCell<String>>,
}

impl StringSink {
    pub fn node(ctx: &Context) -> (Node, Rc<RefCell<String>>) {
        let text = Rc::new(RefCell::new(String::new()));
        let sink = StringSink {
            text: Rc::clone(&text),
        };
        (Node::writable(ctx, StreamOptions::object(), sink), text)
    }
}

impl Stage for StringSink {
    fn name(&self) -> &str {
        "string"
    }

    fn write(&mut self, _node: &Node, chunk: Chunk, done: Done) {
        self.text.borrow_mut().push_str(&chunk.to_text());
        done.ok()
    }
}

/// Runs a callback for every chunk; the callback completes it
pub struct EachSink {
    each: Box<dyn FnMut(Chunk, Done)>,
}

impl EachSink {
    pub fn node(ctx: &Context, object_mode: bool, each: impl FnMut(Chunk, Done) + 'static) -> Node {
        let options = StreamOptions::new()
            .with_name("each")
            .with_object_mode(object_mode);
        Node::writable(
            ctx,
            options,
            EachSink {
                each: Box::new(each),
            },
        )
    }

    pub fn node_sync(
        ctx: &Context,
        object_mode: bool,
        mut each: impl FnMut(Chunk) -> Result<()> + 'static,
    ) -> Node {
        Self::node(ctx, object_mode, move |chunk, done| done.finish(each(chunk)))
    }
}

impl Stage for EachSink {
    fn name(&self) -> &str {
        "each"
    }

    fn write(&mut self, _node: &Node, chunk: Chunk, done: Done) {
        (self.each)(chunk, done)
    }
}
