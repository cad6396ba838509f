mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stream_chain::{
    from_string, into_node, run_local, Context, Done, Endpoint, Member, Node, PassThrough,
    StreamOptions, FOREIGN_RANK,
};

use common::{init_tracing, texts};

#[tokio::test]
async fn test_pipe_into_foreign_writer() {
    init_tracing();
    run_local(async {
        let ctx = Context::new();
        let (client, mut server) = tokio::io::duplex(16);
        let sink = from_string(&ctx, "hello foreign world", 3).pipe(Endpoint::writer(client));
        assert_eq!(sink.name(), "foreign");

        let mut received = String::new();
        server
            .read_to_string(&mut received)
            .await
            .expect("Read failed");
        assert_eq!(received, "hello foreign world");
        sink.into_future().await.expect("Writer failed");
    })
    .await;
}

#[tokio::test]
async fn test_foreign_reader_as_source() {
    run_local(async {
        let ctx = Context::new();
        let source = into_node(&ctx, Endpoint::reader(&b"abc\ndef\n"[..]));
        assert!(source.is_readable());
        assert!(!source.is_writable());
        let lines = source
            .split_lines()
            .into_array()
            .await
            .expect("Collect failed");
        assert_eq!(texts(lines), vec!["abc", "def"]);
    })
    .await;
}

#[tokio::test]
async fn test_foreign_duplex_both_directions() {
    run_local(async {
        let ctx = Context::new();
        let (local, mut remote) = tokio::io::duplex(64);
        let node = into_node(&ctx, Endpoint::duplex(local));
        assert!(node.is_readable() && node.is_writable());

        node.write("ping", Done::noop());
        node.end();
        let mut request = [0u8; 4];
        remote.read_exact(&mut request).await.expect("Read failed");
        assert_eq!(&request, b"ping");

        remote.write_all(b"pong").await.expect("Write failed");
        remote.shutdown().await.expect("Shutdown failed");
        let reply = node.into_string().await.expect("Collect failed");
        assert_eq!(reply, "pong");
    })
    .await;
}

#[tokio::test]
async fn test_unconverted_reader_joins_chain_head() {
    run_local(async {
        let ctx = Context::new();
        let dest = Node::transform(&ctx, StreamOptions::new(), PassThrough);
        let source = dest.pipe_from_foreign("payload-reader", &b"payload"[..]);

        let chain = dest.get_stream_chain();
        let members = chain.members();
        assert_eq!(members.len(), 2);
        assert!(matches!(&members[0], Member::Foreign(s) if s.label() == "payload-reader"));
        assert_eq!(
            chain.rank_of(&Member::Foreign(source.clone())),
            Some(FOREIGN_RANK)
        );

        let text = dest.into_string().await.expect("Collect failed");
        assert_eq!(text, "payload");
        assert!(dest.upstream_nodes().is_empty());
    })
    .await;
}
