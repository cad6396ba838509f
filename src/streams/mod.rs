//! Ready-made sources, sinks and transforms, plus chaining shorthands on
//! [Node].
mod sinks;
mod sources;
mod transforms;

use std::future::Future;
use std::path::Path;

use crate::chunk::Chunk;
use crate::config::StreamOptions;
use crate::conversion::Endpoint;
use crate::error::Result;
use crate::node::Node;
use crate::stage::{Done, Transform};

pub use sinks::{Blackhole, CollectSink, EachSink, StringSink};
pub use sources::{
    from_array, from_fn, from_fn_sync, from_string, ArraySource, Emit, FunctionSource,
};
pub use transforms::{
    Batch, Filter, Intersperse, Join, JsonParse, Limit, LocalBoxFuture, NumberParse, Pluck, Reply,
    Skip, Split, Through, ThroughFn,
};

impl Node {
    /// Pipe into a new transform whose sides share this node's output mode
    pub fn pipe_transform(&self, name: &str, transform: impl Transform) -> Node {
        let mode = self.is_readable_object_mode();
        let options = StreamOptions::new().with_name(name).with_object_mode(mode);
        self.pipe(Node::transform(self.context(), options, transform))
    }

    fn pipe_transform_with(&self, options: StreamOptions, transform: impl Transform) -> Node {
        self.pipe(Node::transform(self.context(), options, transform))
    }

    /// Map every chunk through `f`
    pub fn through(&self, f: ThroughFn) -> Node {
        self.pipe_transform("through", Through::new(f))
    }

    pub fn through_sync(&self, f: impl FnMut(Chunk) -> Result<Chunk> + 'static) -> Node {
        self.through(ThroughFn::sync(f))
    }

    /// [Node::through] with a byte-mode output
    pub fn through_data(&self, f: ThroughFn) -> Node {
        let options = StreamOptions::new()
            .with_name("through")
            .with_writable_object_mode(self.is_readable_object_mode());
        self.pipe_transform_with(options, Through::new(f))
    }

    /// [Node::through] with an object-mode output
    pub fn through_obj(&self, f: ThroughFn) -> Node {
        let options = StreamOptions::object()
            .with_name("through")
            .with_writable_object_mode(self.is_readable_object_mode());
        self.pipe_transform_with(options, Through::new(f))
    }

    pub fn filter(&self, predicate: impl FnMut(&Chunk) -> bool + 'static) -> Node {
        self.pipe_transform("filter", Filter::new(predicate))
    }

    /// Group objects into arrays of `size`
    pub fn batch(&self, size: usize) -> Node {
        self.pipe_transform_with(StreamOptions::object().with_name("batch"), Batch::new(size))
    }

    /// Split bytes into string objects on `delimiter`
    pub fn split(&self, delimiter: &str) -> Node {
        let options = StreamOptions::object()
            .with_name("split")
            .with_writable_object_mode(false);
        self.pipe_transform_with(options, Split::on(delimiter))
    }

    /// Split bytes into lines
    pub fn split_lines(&self) -> Node {
        let options = StreamOptions::object()
            .with_name("split")
            .with_writable_object_mode(false);
        self.pipe_transform_with(options, Split::lines())
    }

    pub fn intersperse(&self, separator: impl Into<Chunk>) -> Node {
        self.pipe_transform("intersperse", Intersperse::new(separator))
    }

    pub fn limit(&self, limit: usize) -> Node {
        self.pipe_transform("limit", Limit::new(limit))
    }

    pub fn skip(&self, count: usize) -> Node {
        self.pipe_transform("skip", Skip::new(count))
    }

    /// Replace each object with its `field`
    pub fn pluck(&self, field: &str) -> Node {
        self.pipe_transform_with(StreamOptions::object().with_name("pluck"), Pluck::new(field))
    }

    /// Parse concatenated JSON documents out of a byte stream
    pub fn json_parse(&self) -> Node {
        let options = StreamOptions::object()
            .with_name("json-parse")
            .with_writable_object_mode(false);
        self.pipe_transform_with(options, JsonParse::new())
    }

    /// Parse comma or whitespace separated numbers
    pub fn number_parse(&self) -> Node {
        let options = StreamOptions::object()
            .with_name("number-parse")
            .with_writable_object_mode(false);
        self.pipe_transform_with(options, NumberParse::new())
    }

    /// Join objects back into a byte stream
    pub fn join(&self) -> Node {
        let options = StreamOptions::new()
            .with_name("join")
            .with_writable_object_mode(true);
        self.pipe_transform_with(options, Join)
    }

    /// Also pipe into `dest`, returning this node so the chain can go on
    pub fn tee(&self, dest: impl Into<Endpoint>) -> Node {
        self.pipe(dest);
        self.clone()
    }

    /// Write everything to a newly created (or truncated) file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<Node> {
        let file = std::fs::File::create(path.as_ref())?;
        Ok(self.pipe(Endpoint::writer(tokio::fs::File::from_std(file))))
    }

    /// Consume every chunk with `f`, which completes it through `Done`
    pub fn each(&self, f: impl FnMut(Chunk, Done) + 'static) -> Node {
        self.pipe(EachSink::node(self.context(), self.is_readable_object_mode(), f))
    }

    pub fn each_sync(&self, f: impl FnMut(Chunk) -> Result<()> + 'static) -> Node {
        self.pipe(EachSink::node_sync(self.context(), self.is_readable_object_mode(), f))
    }

    /// Collect every chunk, resolving once the chain finishes or fails
    pub fn into_array(&self) -> impl Future<Output = Result<Vec<Chunk>>> + 'static {
        let (sink, items) = CollectSink::node(self.context());
        let done = self.pipe(sink).into_future();
        async move {
            done.await?;
            Ok(items.take())
        }
    }

    /// Concatenate the text form of every chunk
    pub fn into_string(&self) -> impl Future<Output = Result<String>> + 'static {
        let (sink, text) = StringSink::node(self.context());
        let done = self.pipe(sink).into_future();
        async move {
            done.await?;
            Ok(text.take())
        }
    }
}
