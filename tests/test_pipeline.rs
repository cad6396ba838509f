mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value};
use stream_chain::streams::Through;
use stream_chain::{
    from_array, from_fn, from_fn_sync, from_string, run_local, Chunk, CollectSink, Context,
    ContextConfig, Done, EachSink, EventKind, Node, PassThrough, PipeOptions, StreamError,
    StreamOptions, ThroughFn,
};

use common::{init_tracing, settle, texts};

#[tokio::test]
async fn test_batch_of_three() {
    init_tracing();
    run_local(async {
        let ctx = Context::new();
        let out = from_array(&ctx, 0..8i64)
            .batch(3)
            .into_array()
            .await
            .expect("Collect failed");
        let values: Vec<Value> = out.into_iter().map(Chunk::into_value).collect();
        assert_eq!(values, vec![json!([0, 1, 2]), json!([3, 4, 5]), json!([6, 7])]);
    })
    .await;
}

#[tokio::test]
async fn test_multi_stage_transforms() {
    run_local(async {
        let ctx = Context::new();
        let out = from_array(&ctx, 0..20i64)
            .skip(2)
            .filter(|chunk| chunk.as_object().and_then(Value::as_i64).is_some_and(|n| n % 2 == 0))
            .through_sync(|chunk| {
                let n = chunk.into_value().as_i64().unwrap_or_default();
                Ok(Chunk::from(n * 10))
            })
            .limit(4)
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(out), vec!["20", "40", "60", "80"]);
    })
    .await;
}

#[tokio::test]
async fn test_intersperse_into_string() {
    run_local(async {
        let ctx = Context::new();
        let text = from_array(&ctx, ["a", "b", "c"])
            .intersperse(", ")
            .into_string()
            .await
            .expect("Collect failed");
        assert_eq!(text, "a, b, c");
    })
    .await;
}

#[tokio::test]
async fn test_split_lines_from_bytes() {
    run_local(async {
        let ctx = Context::new();
        let out = from_string(&ctx, "one\r\ntwo\nthree", 3)
            .split_lines()
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(out), vec!["one", "two", "three"]);
    })
    .await;
}

#[tokio::test]
async fn test_pluck_missing_field_is_null() {
    run_local(async {
        let ctx = Context::new();
        let out = from_array(&ctx, [json!({"id": 1}), json!({"name": "x"})])
            .pluck("id")
            .into_array()
            .await
            .expect("Collect failed");
        let values: Vec<Value> = out.into_iter().map(Chunk::into_value).collect();
        assert_eq!(values, vec![json!(1), Value::Null]);
    })
    .await;
}

#[tokio::test]
async fn test_through_callback_and_future_forms() {
    run_local(async {
        let ctx = Context::new();
        let doubled = from_array(&ctx, 1..4i64)
            .through(ThroughFn::callback(|chunk, reply| {
                let n = chunk.into_value().as_i64().unwrap_or_default();
                reply.push(n);
                reply.send(Ok(Chunk::from(n)));
            }))
            .through(ThroughFn::future(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(Chunk::from(chunk.to_text()))
            }))
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(doubled), vec!["1", "1", "2", "2", "3", "3"]);
    })
    .await;
}

#[tokio::test]
async fn test_function_source_runs_on_next_tick() {
    run_local(async {
        let ctx = Context::new();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let source = from_fn(&ctx, move |emit| {
            let n = counter.get();
            counter.set(n + 1);
            if n < 3 {
                emit.item(n as i64);
            } else {
                emit.end();
            }
        });
        let done = source.into_array();
        assert_eq!(calls.get(), 0);
        let out = done.await.expect("Collect failed");
        assert_eq!(texts(out), vec!["0", "1", "2"]);
    })
    .await;
}

#[tokio::test]
async fn test_each_consumer_completes_through_done() {
    run_local(async {
        let ctx = Context::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        from_array(&ctx, ["x", "y"])
            .each(move |chunk, done| {
                sink.borrow_mut().push(chunk.to_text());
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    done.ok()
                });
            })
            .into_future()
            .await
            .expect("Consumer failed");
        assert_eq!(*seen.borrow(), vec!["x", "y"]);
    })
    .await;
}

#[tokio::test]
async fn test_write_backpressure_and_drain() {
    run_local(async {
        let ctx = Context::with_config(ContextConfig::default().with_high_water_marks(1024, 2));
        let held: Rc<RefCell<Vec<Done>>> = Rc::new(RefCell::new(Vec::new()));
        let holder = held.clone();
        let sink = EachSink::node(&ctx, true, move |_, done| holder.borrow_mut().push(done));
        let drains = Rc::new(Cell::new(0));
        let counter = drains.clone();
        sink.on(EventKind::Drain, move |_, _| counter.set(counter.get() + 1));

        assert!(sink.write(1i64, Done::noop()));
        assert!(!sink.write(2i64, Done::noop()));
        assert_eq!(sink.metrics().snapshot().write_backpressure, 1);

        for _ in 0..2 {
            let done = held.borrow_mut().remove(0);
            done.ok();
            settle().await;
        }
        assert_eq!(drains.get(), 1);
        assert_eq!(sink.metrics().total_written(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_write_after_end_is_reported() {
    run_local(async {
        let ctx = Context::new();
        let node = Node::transform(&ctx, StreamOptions::object(), PassThrough);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        node.on_error(move |_, err| sink.borrow_mut().push(err.to_string()));
        node.end();

        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        assert!(!node.write("late", Done::new(move |r| *slot.borrow_mut() = Some(r))));
        settle().await;

        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(StreamError::WriteAfterEnd))
        ));
        assert_eq!(*errors.borrow(), vec!["write after end"]);
    })
    .await;
}

#[tokio::test]
async fn test_pipe_without_end_leaves_destination_open() {
    run_local(async {
        let ctx = Context::new();
        let dest = Node::transform(&ctx, StreamOptions::object(), PassThrough);
        from_array(&ctx, [1i64]).pipe_with(&dest, PipeOptions::end(false));
        settle().await;
        assert!(!dest.writable_ending());
        assert!(!dest.is_ended());

        dest.end();
        let out = dest.into_array().await.expect("Collect failed");
        assert_eq!(texts(out), vec!["1"]);
    })
    .await;
}

#[tokio::test]
async fn test_destination_finish_unpipes_source() {
    run_local(async {
        let ctx = Context::new();
        let source = from_array(&ctx, ["a"]);
        let (sink, items) = stream_chain::CollectSink::node(&ctx);
        let unpiped = Rc::new(Cell::new(0));
        let counter = unpiped.clone();
        sink.on(EventKind::Unpipe, move |_, _| counter.set(counter.get() + 1));

        source.pipe(&sink).into_future().await.expect("Sink failed");
        settle().await;
        assert_eq!(unpiped.get(), 1);
        assert!(source.downstream_nodes().is_empty());
        assert_eq!(items.borrow().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_into_callback_fires_once_per_attachment() {
    run_local(async {
        let ctx = Context::new();
        let calls = Rc::new(Cell::new(0));
        let before = calls.clone();
        let sink = from_array(&ctx, [1i64, 2]).pipe(stream_chain::Blackhole::node(&ctx, true));
        sink.into_callback(move |result| {
            assert!(result.is_ok());
            before.set(before.get() + 1);
        });
        settle().await;
        assert!(sink.is_ended());
        assert_eq!(calls.get(), 1);

        for _ in 0..2 {
            let after = calls.clone();
            sink.into_callback(move |result| {
                assert!(result.is_ok());
                after.set(after.get() + 1);
            });
        }
        assert_eq!(calls.get(), 1);
        settle().await;
        assert_eq!(calls.get(), 3);
    })
    .await;
}

#[tokio::test]
async fn test_transform_holds_writer_until_read() {
    run_local(async {
        let ctx = Context::new();
        let options = StreamOptions::object().with_high_water_mark(1);
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        let node = Node::transform(
            &ctx,
            options,
            Through::new(ThroughFn::sync(move |chunk| {
                counter.set(counter.get() + 1);
                Ok(chunk)
            })),
        );
        node.write(1i64, Done::noop());
        node.write(2i64, Done::noop());
        settle().await;
        // The first output fills the readable side; the second write waits.
        assert_eq!(seen.get(), 1);

        assert!(matches!(node.read(None), stream_chain::Pull::Data(_)));
        settle().await;
        assert_eq!(seen.get(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_sync_source_error_reaches_future() {
    run_local(async {
        let ctx = Context::new();
        let mut n = 0;
        let result = from_fn_sync(&ctx, move || {
            n += 1;
            match n {
                1 => Ok(Some(Chunk::from("ok"))),
                _ => Err(StreamError::stage("producer", "exhausted")),
            }
        })
        .into_array()
        .await;
        let err = result.expect_err("Producer error was swallowed");
        assert_eq!(err.to_string(), "Stage producer failed: exhausted");
    })
    .await;
}

#[tokio::test]
async fn test_json_documents_parsed_across_chunks() {
    run_local(async {
        let ctx = Context::new();
        let text = r#"{"image":"tiles.png","solid":{"1":[0,1],"2":[1,1]}} [1, 2] "three" 42"#;
        let out = from_string(&ctx, text, 5)
            .json_parse()
            .into_array()
            .await
            .expect("Collect failed");
        let values: Vec<Value> = out.into_iter().map(Chunk::into_value).collect();
        assert_eq!(
            values,
            vec![
                json!({"image": "tiles.png", "solid": {"1": [0, 1], "2": [1, 1]}}),
                json!([1, 2]),
                json!("three"),
                json!(42),
            ]
        );
    })
    .await;
}

#[tokio::test]
async fn test_truncated_json_fails_at_end() {
    run_local(async {
        let ctx = Context::new();
        let result = from_string(&ctx, r#"{"a": [1, 2"#, 4)
            .json_parse()
            .into_array()
            .await;
        assert!(matches!(result, Err(StreamError::InvalidChunk(_))));
    })
    .await;
}

#[tokio::test]
async fn test_comma_separated_numbers() {
    run_local(async {
        let ctx = Context::new();
        let out = from_string(&ctx, "1,2,34,56,78.9,0", 3)
            .number_parse()
            .into_array()
            .await
            .expect("Collect failed");
        let values: Vec<Value> = out.into_iter().map(Chunk::into_value).collect();
        assert_eq!(
            values,
            vec![json!(1), json!(2), json!(34), json!(56), json!(78.9), json!(0)]
        );
    })
    .await;
}

#[tokio::test]
async fn test_join_objects_into_bytes() {
    run_local(async {
        let ctx = Context::new();
        let joined = from_array(&ctx, ["a", "b", "c", "d"]).join();
        assert!(joined.is_writable_object_mode());
        assert!(!joined.is_readable_object_mode());
        let text = joined.into_string().await.expect("Collect failed");
        assert_eq!(text, "abcd");
    })
    .await;
}

#[tokio::test]
async fn test_tee_feeds_both_destinations() {
    run_local(async {
        let ctx = Context::new();
        let (side, seen) = CollectSink::node(&ctx);
        let source = from_array(&ctx, ["x", "y"]);
        let teed = source.tee(&side);
        assert!(teed.ptr_eq(&source));

        let out = teed.into_array().await.expect("Collect failed");
        side.into_future().await.expect("Side sink failed");
        assert_eq!(texts(out), vec!["x", "y"]);
        assert_eq!(texts(seen.take()), vec!["x", "y"]);
    })
    .await;
}

#[tokio::test]
async fn test_to_file_writes_everything() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let path = dir.path().join("out.txt");
        let ctx = Context::new();
        from_string(&ctx, "line one\nline two\n", 4)
            .to_file(&path)
            .expect("Create failed")
            .into_future()
            .await
            .expect("Write failed");
        let on_disk = tokio::fs::read_to_string(&path).await.expect("Read failed");
        assert_eq!(on_disk, "line one\nline two\n");
    })
    .await;
}
