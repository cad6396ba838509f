#![allow(dead_code)]

use std::time::Duration;

use stream_chain::Chunk;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let queued ticks and spawned I/O make progress
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub fn texts(chunks: Vec<Chunk>) -> Vec<String> {
    chunks.iter().map(Chunk::to_text).collect()
}

/// Poll `cond` until it holds, giving up after about two seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
