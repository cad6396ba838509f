mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use stream_chain::{
    from_fn_sync, from_string, run_local, Chunk, Context, Done, FileBufferOptions,
    FileBufferStream,
};

use common::{init_tracing, settle, texts, wait_until};

#[tokio::test]
async fn test_round_trip_through_disk() {
    init_tracing();
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let ctx = Context::new();
        let buffer = FileBufferStream::with_options(
            &ctx,
            FileBufferOptions::default().with_directory(dir.path()),
        );
        let path = buffer.path().to_path_buf();
        assert!(path.starts_with(dir.path()));

        let mut next = 0i64;
        let out = from_fn_sync(&ctx, move || {
            if next == 1000 {
                return Ok(None);
            }
            let item = Chunk::from(next.to_string());
            next += 1;
            Ok(Some(item))
        })
        .intersperse("\n")
        .pipe(buffer)
        .split_lines()
        .into_array()
        .await
        .expect("Collect failed");

        let expected: Vec<String> = (0..1000).map(|n| n.to_string()).collect();
        assert_eq!(texts(out), expected);

        assert!(
            wait_until(|| !path.exists()).await,
            "backing file was not removed"
        );
    })
    .await;
}

#[tokio::test]
async fn test_slow_consumer_sees_every_byte() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let ctx = Context::new();
        let options = FileBufferOptions::default()
            .with_directory(dir.path())
            .with_read_buffer_size(1024);
        let buffer = FileBufferStream::with_options(&ctx, options);

        let input: String = (0..4096).map(|n| char::from(b'a' + (n % 26) as u8)).collect();
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        from_string(&ctx, input.clone(), 128)
            .pipe(buffer)
            .each(move |chunk, done| {
                if let Some(bytes) = chunk.as_bytes() {
                    sink.borrow_mut().extend_from_slice(bytes);
                }
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    done.ok()
                });
            })
            .into_future()
            .await
            .expect("Consumer failed");

        assert_eq!(received.borrow().len(), input.len());
        assert_eq!(*received.borrow(), input.into_bytes());
    })
    .await;
}

#[tokio::test]
async fn test_backing_file_can_be_kept() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let path = dir.path().join("kept.buf");
        let ctx = Context::new();
        let options = FileBufferOptions::default()
            .with_path(&path)
            .with_remove_file(false);
        let text = from_string(&ctx, "keep me", 3)
            .pipe(FileBufferStream::with_options(&ctx, options))
            .into_string()
            .await
            .expect("Collect failed");
        assert_eq!(text, "keep me");

        settle().await;
        let on_disk = tokio::fs::read_to_string(&path).await.expect("Read failed");
        assert_eq!(on_disk, "keep me");
    })
    .await;
}

#[tokio::test]
async fn test_abort_removes_backing_file() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let ctx = Context::new();
        let buffer = FileBufferStream::with_options(
            &ctx,
            FileBufferOptions::default().with_directory(dir.path()),
        );
        let path = buffer.path().to_path_buf();
        let node = buffer.into_node();

        let written = Rc::new(RefCell::new(None));
        let slot = written.clone();
        node.write("pending bytes", Done::new(move |r| *slot.borrow_mut() = Some(r.is_ok())));
        assert!(wait_until(|| written.borrow().is_some()).await);
        assert_eq!(*written.borrow(), Some(true));
        assert!(path.exists());

        node.abort_chain();
        assert!(node.is_aborted());
        assert!(
            wait_until(|| !path.exists()).await,
            "abort left the backing file behind"
        );
    })
    .await;
}

#[tokio::test]
async fn test_dropped_buffer_removes_file() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let ctx = Context::new();
        let buffer = FileBufferStream::with_options(
            &ctx,
            FileBufferOptions::default().with_directory(dir.path()),
        );
        let path = buffer.path().to_path_buf();
        assert!(wait_until(|| path.exists()).await);

        drop(buffer);
        settle().await;
        assert!(!path.exists(), "drop left the backing file behind");
    })
    .await;
}

#[tokio::test]
async fn test_end_before_open_yields_empty_output() {
    run_local(async {
        let dir = tempfile::tempdir().expect("Tempdir failed");
        let ctx = Context::new();
        let buffer = FileBufferStream::with_options(
            &ctx,
            FileBufferOptions::default().with_directory(dir.path()),
        );
        let path = buffer.path().to_path_buf();
        let node = buffer.into_node();
        node.end();

        let text = node.into_string().await.expect("Collect failed");
        assert_eq!(text, "");
        assert!(
            wait_until(|| !path.exists()).await,
            "backing file outlived an empty buffer"
        );
    })
    .await;
}
