mod common;

use std::cell::RefCell;
use std::rc::Rc;

use stream_chain::streams::{Split, Through};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stream_chain::{
    from_array, from_string, run_local, Chunk, CompoundDuplex, Context, Endpoint, EventKind, Node,
    PassThrough, StreamError, StreamOptions, ThroughFn,
};

use common::{init_tracing, texts, wait_until};

fn uppercase(node: &Node) -> Node {
    node.through_sync(|chunk| Ok(Chunk::from(chunk.to_text().to_uppercase())))
}

#[tokio::test]
async fn test_compound_wraps_split_and_uppercase() {
    init_tracing();
    run_local(async {
        let ctx = Context::new();
        let options = StreamOptions::object()
            .with_name("split")
            .with_writable_object_mode(false);
        let entry = Node::transform(&ctx, options, Split::on(" "));
        let exit = uppercase(&entry);
        let compound = CompoundDuplex::new(&ctx, &entry, &exit).expect("Build failed");
        assert!(!compound.node().is_writable_object_mode());
        assert!(compound.node().is_readable_object_mode());

        let out = from_string(&ctx, "hello world", 4)
            .pipe(compound)
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(out), vec!["HELLO", "WORLD"]);
    })
    .await;
}

#[tokio::test]
async fn test_shorthand_finds_chain_head() {
    run_local(async {
        let ctx = Context::new();
        let entry = Node::transform(&ctx, StreamOptions::object(), PassThrough);
        let exit = uppercase(&entry);
        let compound = CompoundDuplex::from_readable(&ctx, &exit).expect("Build failed");
        assert!(compound.entry().ptr_eq(&entry));
        assert!(compound.exit().ptr_eq(&exit));

        let out = from_array(&ctx, ["a", "b"])
            .pipe(compound)
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(out), vec!["A", "B"]);
    })
    .await;
}

#[tokio::test]
async fn test_shorthand_rejects_readable_only_head() {
    run_local(async {
        let ctx = Context::new();
        let exit = uppercase(&from_array(&ctx, ["x"]));
        let err = CompoundDuplex::from_readable(&ctx, &exit).err();
        assert!(matches!(err, Some(StreamError::Config(_))));
    })
    .await;
}

#[tokio::test]
async fn test_default_compound_passes_through() {
    run_local(async {
        let ctx = Context::new();
        let compound = CompoundDuplex::builder(&ctx).build().expect("Build failed");
        assert_eq!(compound.node().name(), "compound");
        let text = from_string(&ctx, "abc", 1)
            .pipe(compound)
            .into_string()
            .await
            .expect("Collect failed");
        assert_eq!(text, "abc");
    })
    .await;
}

#[tokio::test]
async fn test_flush_output_follows_regular_items() {
    run_local(async {
        let ctx = Context::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let writes = log.clone();
        let entry = Node::transform(
            &ctx,
            StreamOptions::object(),
            Through::new(ThroughFn::sync(move |chunk| {
                writes.borrow_mut().push(format!("write:{}", chunk.to_text()));
                Ok(chunk)
            })),
        );
        let exit = uppercase(&entry);
        let flushes = log.clone();
        let compound = CompoundDuplex::builder(&ctx)
            .writable(&entry)
            .readable(&exit)
            .flush(move |flush| {
                flushes.borrow_mut().push("flush".to_string());
                flush.push("tail");
                flush.finish(Ok(()));
            })
            .build()
            .expect("Build failed");

        let out = from_array(&ctx, ["a", "b"])
            .pipe(compound)
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(out), vec!["A", "B", "tail"]);
        assert_eq!(*log.borrow(), vec!["write:a", "write:b", "flush"]);
    })
    .await;
}

#[tokio::test]
async fn test_internal_error_surfaces_on_outer_chain() {
    run_local(async {
        let ctx = Context::new();
        let entry = Node::transform(&ctx, StreamOptions::object(), PassThrough);
        let exit = entry.through_sync(|chunk| match chunk.to_text().as_str() {
            "bad" => Err(StreamError::stage("inner", "rejected")),
            _ => Ok(chunk),
        });
        let compound = CompoundDuplex::new(&ctx, &entry, &exit).expect("Build failed");
        let outer = compound.node().clone();
        let inner_unignored = Rc::new(RefCell::new(0));
        let counter = inner_unignored.clone();
        exit.on(EventKind::UnignoredError, move |_, _| *counter.borrow_mut() += 1);

        let result = from_array(&ctx, ["ok", "bad", "later"])
            .pipe(compound)
            .into_array()
            .await;
        let err = result.expect_err("Internal error was swallowed");
        assert_eq!(err.to_string(), "Stage inner failed: rejected");
        assert_eq!(*inner_unignored.borrow(), 0);
        assert!(outer.is_aborted());
        assert_eq!(outer.last_error().map(|e| e.to_string()), Some(err.to_string()));
        assert!(
            wait_until(|| entry.is_aborted() && exit.is_aborted()).await,
            "internal chain was not aborted"
        );
    })
    .await;
}

#[tokio::test]
async fn test_abort_reaches_separate_entry_and_exit_chains() {
    run_local(async {
        let ctx = Context::new();
        let entry = Node::transform(&ctx, StreamOptions::object(), PassThrough);
        let exit = from_array(&ctx, ["one", "two"]);
        assert!(!entry.get_stream_chain().ptr_eq(&exit.get_stream_chain()));
        let compound = CompoundDuplex::new(&ctx, &entry, &exit).expect("Build failed");

        let result = from_array(&ctx, ["a"])
            .pipe(compound)
            .through_sync(|_| Err(StreamError::stage("outer", "refused")))
            .into_array()
            .await;
        assert!(result.is_err());
        assert!(
            wait_until(|| entry.is_aborted() && exit.is_aborted()).await,
            "separate internal chains were not both aborted"
        );
    })
    .await;
}

#[tokio::test]
async fn test_wrapped_node_forwards_errors() {
    run_local(async {
        let ctx = Context::new();
        let inner = Node::transform(
            &ctx,
            StreamOptions::object(),
            Through::new(ThroughFn::sync(|chunk| match chunk.to_text().as_str() {
                "bad" => Err(StreamError::stage("wrapped", "rejected")),
                _ => Ok(chunk),
            })),
        );
        let compound = CompoundDuplex::wrap(&ctx, &inner).expect("Build failed");
        assert!(compound.entry().ptr_eq(compound.exit()));

        let err = from_array(&ctx, ["fine", "bad"])
            .pipe(compound)
            .into_array()
            .await
            .expect_err("Wrapped error was swallowed");
        assert_eq!(err.to_string(), "Stage wrapped failed: rejected");
    })
    .await;
}

#[tokio::test]
async fn test_wrap_foreign_duplex() {
    run_local(async {
        let ctx = Context::new();
        let (local, mut remote) = tokio::io::duplex(64);
        let compound = CompoundDuplex::wrap(&ctx, Endpoint::duplex(local)).expect("Build failed");
        tokio::task::spawn_local(async move {
            let mut request = Vec::new();
            remote.read_to_end(&mut request).await.expect("Read failed");
            let reply = String::from_utf8_lossy(&request).to_uppercase();
            remote.write_all(reply.as_bytes()).await.expect("Write failed");
            remote.shutdown().await.expect("Shutdown failed");
        });

        let text = from_string(&ctx, "ping", 2)
            .pipe(compound)
            .into_string()
            .await
            .expect("Collect failed");
        assert_eq!(text, "PING");
    })
    .await;
}

#[tokio::test]
async fn test_wrap_rejects_readable_only_stream() {
    run_local(async {
        let ctx = Context::new();
        let source = from_array(&ctx, ["x"]);
        let err = CompoundDuplex::wrap(&ctx, &source).err();
        assert!(matches!(err, Some(StreamError::Config(_))));
    })
    .await;
}
