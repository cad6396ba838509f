//! Filter chain with a compound stage and a disk-backed buffer
//!
//! Generates readings, drops the invalid ones, normalizes the rest inside a
//! compound node, spills them through a file buffer, and prints a summary.
//!
//! Usage: cargo run --example filter_pipeline --release

use serde_json::json;
use stream_chain::{
    from_array, run_local, Chunk, CompoundDuplex, Context, FileBufferStream, Node, PassThrough,
    StreamError, StreamOptions,
};

async fn run() -> Result<(), StreamError> {
    let ctx = Context::new();
    let readings = (0..500i64).map(|i| json!({ "sensor": i % 7, "value": (i * 37) % 101 - 10 }));

    // Normalize inside a compound so the outer chain sees one stage.
    let entry = Node::transform(&ctx, StreamOptions::object(), PassThrough);
    let exit = entry
        .pluck("value")
        .through_sync(|chunk| Ok(Chunk::from(format!("{}\n", chunk.to_text()))));
    let normalize = CompoundDuplex::new(&ctx, &entry, &exit)?;

    let chain = from_array(&ctx, readings)
        .filter(|chunk| {
            chunk
                .as_object()
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_i64())
                .is_some_and(|v| v >= 0)
        })
        .pipe(normalize)
        .pipe(FileBufferStream::new(&ctx))
        .split_lines();

    let values = chain.into_array().await?;
    let total: i64 = values
        .iter()
        .filter_map(|chunk| chunk.to_text().parse::<i64>().ok())
        .sum();

    println!("\n=== Filter Chain Results ===");
    println!("Accepted readings: {}", values.len());
    println!("Sum of values: {}", total);
    println!("{}", chain.get_stream_chain().metrics_summary());
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    run_local(run()).await
}
