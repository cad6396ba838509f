//! Word frequency counter chain
//!
//! Reads lines from stdin, splits them into words, counts frequencies, and
//! prints the top words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use stream_chain::{run_local, Chunk, Context, Done, Node, Output, StreamOptions, Transform};

/// Splits each line into lowercase words
struct WordSplitter;

impl Transform for WordSplitter {
    fn name(&self) -> &str {
        "word_splitter"
    }

    fn transform(&mut self, chunk: Chunk, out: &Output, done: Done) {
        for word in chunk.to_text().split_whitespace() {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if cleaned.len() > 2 {
                out.push(cleaned);
            }
        }
        done.ok()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    run_local(async {
        let ctx = Context::new();
        let lines = Node::transform(
            &ctx,
            StreamOptions::new().with_name("stdin"),
            stream_chain::PassThrough,
        );
        lines.pipe_from_foreign("stdin", tokio::io::stdin());

        let counts: Rc<RefCell<HashMap<String, usize>>> = Rc::default();
        let tally = counts.clone();
        let result = lines
            .split_lines()
            .pipe_transform("word_splitter", WordSplitter)
            .each_sync(move |word| {
                *tally.borrow_mut().entry(word.to_text()).or_default() += 1;
                Ok(())
            })
            .into_future()
            .await;

        if let Err(err) = result {
            eprintln!("Word count failed: {}", err);
            return;
        }

        let mut top: Vec<(String, usize)> = counts.take().into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        println!("\n=== Top Words ===");
        for (word, count) in top.into_iter().take(10) {
            println!("{:>6}  {}", count, word);
        }
    })
    .await;
}
