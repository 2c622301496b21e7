//! Session behavior against hand-driven peers over in-memory pipes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use proven_rpc::status::{CODE_CONN_CLOSED, CODE_DEADLINE_EXCEEDED};
use proven_rpc::{
    CallCtx, CallOptions, Endpoint, EndpointConfig, GZIP_FILTER_ID, JSON_CODEC_ID, Message,
    MessageType, Proto, RawProto, Session, Socket, Status, WireContext, XferFilter, XferRegistry,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const PROMPT: Duration = Duration::from_secs(2);

async fn add(_ctx: CallCtx, args: Vec<i64>) -> Result<i64, Status> {
    Ok(args.iter().sum())
}

fn server(config: EndpointConfig) -> Endpoint {
    let server = Endpoint::new(config).unwrap();
    server
        .router()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    server
}

/// Serve one end of a fresh pipe and return the other end.
async fn attach(server: &Endpoint, capacity: usize) -> (Arc<Session>, DuplexStream) {
    let (local, peer) = tokio::io::duplex(capacity);
    let session = server.serve_conn(local).await.unwrap();
    (session, peer)
}

fn add_call(seq: i32, args: &[i64]) -> Message {
    let mut msg = Message::default();
    msg.set_seq(seq);
    msg.set_mtype(MessageType::Call);
    msg.set_service_method("/math/add");
    msg.set_body_codec(JSON_CODEC_ID);
    msg.set_body(args).unwrap();
    msg
}

/// Check that `peer` still gets answers from the server.
async fn assert_serves(peer: &Socket, seq: i32) {
    peer.write_message(&mut add_call(seq, &[1, 2])).await.unwrap();
    let reply = timeout(WAIT, peer.read_message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.seq(), seq);
    assert_eq!(reply.mtype(), MessageType::Reply);
    let sum: i64 = reply.decode_body(&WireContext::default().codecs).unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_endpoint_close_is_not_held_by_stalled_peer() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (session, _peer) = attach(&server, 64).await;

    let pusher = Arc::clone(&session);
    let push = tokio::spawn(async move { pusher.push("/notice", &"x".repeat(100_000)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!push.is_finished());

    timeout(PROMPT, server.close()).await.unwrap();
    let status = timeout(PROMPT, push).await.unwrap().unwrap().unwrap_err();
    assert_eq!(status.code(), CODE_CONN_CLOSED);
    assert!(!session.is_active());
}

#[tokio::test]
async fn test_call_deadline_covers_blocked_write() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (session, _peer) = attach(&server, 64).await;

    let options = CallOptions::default().timeout(Duration::from_millis(100));
    let status = timeout(
        PROMPT,
        session.call_with::<_, String>("/echo", &"x".repeat(100_000), options),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(status.code(), CODE_DEADLINE_EXCEEDED);
    assert_eq!(session.pending_calls(), 0);

    // Half a frame went out, so the connection cannot be reused.
    timeout(WAIT, session.closed()).await.unwrap();
    assert_eq!(server.count_session(), 0);
    server.close().await;
}

#[tokio::test]
async fn test_session_close_releases_call_stuck_in_write() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (session, _peer) = attach(&server, 64).await;

    let caller = Arc::clone(&session);
    let call = tokio::spawn(async move {
        caller.call::<_, String>("/echo", &"x".repeat(100_000)).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());

    timeout(PROMPT, session.close()).await.unwrap();
    let status = timeout(PROMPT, call).await.unwrap().unwrap().unwrap_err();
    assert_eq!(status.code(), CODE_CONN_CLOSED);
    server.close().await;
}

#[tokio::test]
async fn test_bad_checksum_ends_only_that_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (broken, mut broken_peer) = attach(&server, 4096).await;
    let (_healthy, healthy_peer) = attach(&server, 4096).await;
    let healthy_peer = Socket::new(healthy_peer, Arc::new(RawProto), WireContext::default());
    assert_eq!(server.count_session(), 2);

    let mut frame = BytesMut::new();
    RawProto
        .pack(&mut add_call(1, &[1, 2]), &WireContext::default(), &mut frame)
        .unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0x5A;
    broken_peer.write_all(&frame).await.unwrap();

    timeout(WAIT, broken.closed()).await.unwrap();
    assert_eq!(server.count_session(), 1);
    assert_serves(&healthy_peer, 7).await;

    server.close().await;
}

/// Passes bytes through under an id the server does not know.
struct Passthrough;

impl XferFilter for Passthrough {
    fn id(&self) -> u8 {
        b'p'
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn on_pack(&self, src: Bytes) -> proven_rpc::Result<Bytes> {
        Ok(src)
    }

    fn on_unpack(&self, src: Bytes, _limit: usize) -> proven_rpc::Result<Bytes> {
        Ok(src)
    }
}

#[tokio::test]
async fn test_unknown_transfer_filter_ends_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (session, peer) = attach(&server, 4096).await;
    let wire = WireContext {
        xfers: XferRegistry::with_defaults()
            .with(Arc::new(Passthrough))
            .unwrap(),
        ..WireContext::default()
    };
    let peer = Socket::new(peer, Arc::new(RawProto), wire);

    let mut call = add_call(1, &[1, 2]);
    call.xfer_pipe_mut().append(&[b'p']);
    peer.write_message(&mut call).await.unwrap();

    timeout(WAIT, session.closed()).await.unwrap();
    assert!(timeout(WAIT, peer.read_message()).await.unwrap().unwrap().is_none());
    server.close().await;
}

#[tokio::test]
async fn test_stray_reply_is_dropped() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = server(EndpointConfig::default());
    let (session, peer) = attach(&server, 4096).await;
    let peer = Socket::new(peer, Arc::new(RawProto), WireContext::default());

    let mut stray = Message::default();
    stray.set_seq(999);
    stray.set_mtype(MessageType::Reply);
    stray.set_service_method("/math/add");
    stray.set_body_codec(JSON_CODEC_ID);
    stray.set_body(&42).unwrap();
    peer.write_message(&mut stray).await.unwrap();

    assert_serves(&peer, 2).await;
    assert!(session.is_active());
    assert_eq!(server.count_session(), 1);
    server.close().await;
}

#[tokio::test]
async fn test_inflated_body_over_limit_ends_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let handled = Arc::new(AtomicUsize::new(0));
    let server = Endpoint::new(EndpointConfig {
        message_size_limit: 64 << 10,
        ..EndpointConfig::default()
    })
    .unwrap();
    server
        .router()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    let seen = Arc::clone(&handled);
    server
        .router()
        .route_call_func(
            "upload",
            move |_ctx: CallCtx, body: String| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Status>(body.len()) }
            },
            vec![],
        )
        .unwrap();
    let (bombed, bomb_peer) = attach(&server, 1 << 16).await;
    let bomb_peer = Socket::new(bomb_peer, Arc::new(RawProto), WireContext::default());
    let (_healthy, healthy_peer) = attach(&server, 4096).await;
    let healthy_peer = Socket::new(healthy_peer, Arc::new(RawProto), WireContext::default());

    let mut upload = Message::default();
    upload.set_seq(1);
    upload.set_service_method("/upload");
    upload.set_body_codec(JSON_CODEC_ID);
    upload.set_body(&"a".repeat(4 << 20)).unwrap();
    upload.xfer_pipe_mut().append(&[GZIP_FILTER_ID]);
    bomb_peer.write_message(&mut upload).await.unwrap();
    assert!(upload.size() < 64 << 10);

    timeout(WAIT, bombed.closed()).await.unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_serves(&healthy_peer, 3).await;

    server.close().await;
}
