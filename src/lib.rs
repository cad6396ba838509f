//! Chainable, backpressure-aware stream pipelines with chain-wide error
//! propagation.
//!
//! Nodes are connected with [Node::pipe]. Every connected set of nodes
//! forms a [StreamChain]: an error raised anywhere in it is announced to
//! every member in topological order, and unless a member marks it
//! ignored the whole chain is aborted and torn down.
//!
//! # Features
//!
//! - Byte and object mode sides with watermark-based backpressure
//! - Chain discovery and ranking across arbitrary pipe topologies
//! - Chain-wide error delivery with ignore and no-abort opt-outs
//! - Compound duplexes wrapping a sub-chain as one node
//! - A disk-backed buffer for unbounded producer/consumer rate gaps
//! - Adapters for foreign `AsyncRead`/`AsyncWrite` endpoints
//! - Per-node metrics: chunks, bytes, backpressure, write latency
//!
//! # Example
//!
//! ```ignore
//! use stream_chain::{from_array, run_local, Context};
//!
//! run_local(async {
//!     let ctx = Context::new();
//!     let items = from_array(&ctx, 0..8i64).batch(3).into_array().await?;
//!     assert_eq!(items.len(), 3);
//!     Ok::<_, stream_chain::StreamError>(())
//! })
//! .await?;
//! ```

pub mod backpressure;
pub mod chain;
pub mod chunk;
pub mod compound;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod event;
pub mod file_buffer;
pub mod metrics;
pub mod node;
pub mod readable;
pub mod stage;
pub mod streams;
pub mod writable;

// Re-exports for convenience
pub use backpressure::Watermarks;
pub use chain::{ChainErrorOutcome, Member, StreamChain, FOREIGN_RANK};
pub use chunk::{Chunk, Pull, StreamId};
pub use compound::{CompoundDuplex, CompoundDuplexBuilder, Flush};
pub use config::{ContextConfig, FileBufferOptions, StreamOptions, UnhandledErrorPolicy};
pub use context::{run_local, Context};
pub use conversion::{into_node, Endpoint, EndpointKind, ForeignSource};
pub use error::{Result, StreamError};
pub use event::{EventKind, ListenerId, StreamEvent};
pub use file_buffer::FileBufferStream;
pub use metrics::{MetricsSnapshot, NodeMetrics};
pub use node::{Node, WeakNode};
pub use readable::PipeOptions;
pub use stage::{Done, Output, PassThrough, Stage, Transform};
pub use streams::{
    from_array, from_fn, from_fn_sync, from_string, Blackhole, CollectSink, EachSink, StringSink,
    ThroughFn,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
